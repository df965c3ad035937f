use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use tracing::debug;

use crate::error::LoadError;

// Bytes inspected for magic numbers and zip entry names
const HEADER_LEN: usize = 150;
// Bytes inspected for text formats
const SNIFF_LEN: u64 = 64 * 1024;
// An SQLite database header is always 100 bytes
const SQLITE_HEADER_LEN: usize = 100;

// Enum that represents the file types we can recognise
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum FileType {
    Geopackage,
    Shapefile,
    Geojson,
    Excel,
    Csv,
    Parquet,
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FileType::Geopackage => "Geopackage",
            FileType::Shapefile => "Shapefile",
            FileType::Geojson => "GeoJSON",
            FileType::Excel => "Excel",
            FileType::Csv => "CSV",
            FileType::Parquet => "Parquet",
        };
        f.write_str(name)
    }
}

// Determine the file type based on magic numbers, then content, then extension
pub fn determine_file_type(file_path: impl AsRef<Path>) -> Result<FileType, LoadError> {
    let path = file_path.as_ref();
    let mut file = File::open(path).map_err(|e| open_error(path, e))?;

    let mut header_buffer = [0u8; HEADER_LEN];
    let bytes_read = read_up_to(&mut file, &mut header_buffer).map_err(|e| open_error(path, e))?;
    let header = &header_buffer[..bytes_read];

    if let Some(file_type) = match_magic_numbers(header) {
        if file_type == FileType::Geopackage && header.len() < SQLITE_HEADER_LEN {
            return Err(LoadError::CorruptFile {
                location: path.display().to_string(),
                reason: format!(
                    "SQLite header truncated to {} of {SQLITE_HEADER_LEN} bytes",
                    header.len()
                ),
            });
        }
        debug!(file = %path.display(), %file_type, "file type matched by magic number");
        return Ok(file_type);
    }

    let mut sniff = Vec::new();
    File::open(path)
        .and_then(|f| f.take(SNIFF_LEN).read_to_end(&mut sniff))
        .map_err(|e| open_error(path, e))?;

    if let Some(file_type) = detect_content_based_type(&sniff) {
        debug!(file = %path.display(), %file_type, "file type matched by content");
        return Ok(file_type);
    }

    // Extension fallback for CSVs whose first lines are irregular
    let is_csv_extension = path
        .extension()
        .is_some_and(|ext| ext.to_string_lossy().eq_ignore_ascii_case("csv"));
    if is_csv_extension {
        debug!(file = %path.display(), "file type matched by .csv extension");
        return Ok(FileType::Csv);
    }

    Err(LoadError::UnsupportedFormat {
        path: path.to_path_buf(),
        reason: "unknown file signature".into(),
    })
}

fn open_error(path: &Path, e: io::Error) -> LoadError {
    if e.kind() == io::ErrorKind::NotFound {
        LoadError::FileNotFound {
            path: path.to_path_buf(),
        }
    } else {
        LoadError::CorruptFile {
            location: path.display().to_string(),
            reason: e.to_string(),
        }
    }
}

// A single read may return short; keep going until the buffer is full or EOF
fn read_up_to(file: &mut File, buffer: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        match file.read(&mut buffer[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

pub fn match_magic_numbers(buffer: &[u8]) -> Option<FileType> {
    match buffer {
        // PKZip signature [0x50, 0x4B, 0x03, 0x04] detected
        [0x50, 0x4B, 0x03, 0x04, rest @ ..] => {
            let excel_patterns: [&[u8]; 13] = [
                b"xl/worksheets",
                b"xl/_rels",
                b"docProps/",
                b"[Content_Types]",
                b"xl/workbook",
                b"xl/styles",
                b"xl/theme",
                b"xl/strings",
                b"xl/charts",
                b"xl/drawings",
                b"xl/sharedStrings",
                b"xl/metadata",
                b"xl/calc",
            ];
            let shapefile_patterns: [&[u8]; 4] = [b".shp", b".dbf", b".prj", b".shx"];

            let contains = |pattern: &[u8]| rest.windows(pattern.len()).any(|w| w == pattern);
            let is_excel = excel_patterns.iter().any(|&p| contains(p));
            let is_shapefile = shapefile_patterns.iter().any(|&p| contains(p));

            match (is_excel, is_shapefile) {
                (true, false) => Some(FileType::Excel),
                (false, true) => Some(FileType::Shapefile),
                (true, true) => {
                    debug!("zip header matches both Excel and Shapefile entries");
                    None
                }
                (false, false) => None,
            }
        }
        // Excel (XLS) - Compound File Binary Format
        [0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1, ..] => Some(FileType::Excel),
        // Parquet
        [0x50, 0x41, 0x52, 0x31, ..] => Some(FileType::Parquet),
        // Geopackage (SQLite)
        [b'S', b'Q', b'L', b'i', b't', b'e', b' ', b'f', b'o', b'r', b'm', b'a', b't', b' ', b'3', 0x00, ..] => {
            Some(FileType::Geopackage)
        }
        _ => None,
    }
}

pub fn detect_content_based_type(buffer: &[u8]) -> Option<FileType> {
    // The sniff window may end inside a multi-byte character
    let text = match std::str::from_utf8(buffer) {
        Ok(text) => text,
        Err(e) => std::str::from_utf8(&buffer[..e.valid_up_to()]).ok()?,
    };
    let text_lower = text.trim_start().to_lowercase();

    if text_lower.starts_with('{')
        && text_lower.contains("\"type\"")
        && (text_lower.contains("\"featurecollection\"")
            || text_lower.contains("\"feature\"")
            || text_lower.contains("\"geometry\""))
    {
        return Some(FileType::Geojson);
    }

    if is_valid_csv(text) {
        return Some(FileType::Csv);
    }

    None
}

fn is_valid_csv(content: &str) -> bool {
    let lines: Vec<&str> = content.lines().take(5).collect();
    if lines.len() < 2 {
        return false;
    }

    let first_line_fields = lines[0].split(',').count();
    first_line_fields >= 2
        && lines[1..].iter().all(|line| {
            line.split(',').count() == first_line_fields
                && line.chars().all(|c| c.is_ascii() || c.is_whitespace())
        })
}
