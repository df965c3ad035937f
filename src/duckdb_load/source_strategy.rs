use std::fs::File;
use std::io::Read;
use std::path::Path;

use tracing::{debug, info};
use zip::ZipArchive;

use crate::duckdb_load::geometry::Srid;
use crate::duckdb_load::sql::{quote_ident, quote_literal};
use crate::error::LoadError;
use crate::file_load::FileType;

const BRITISH_NATIONAL_GRID: i32 = 27700;
const WGS84: i32 = 4326;

// Column-name pairs read as point coordinates, most specific first
const COORDINATE_PATTERNS: [(&str, &str, Option<i32>); 14] = [
    ("longitude", "latitude", Some(WGS84)),
    ("long", "lat", Some(WGS84)),
    ("lng", "lat", Some(WGS84)),
    ("lon", "lat", Some(WGS84)),
    ("easting", "northing", Some(BRITISH_NATIONAL_GRID)),
    ("east", "north", Some(BRITISH_NATIONAL_GRID)),
    ("x_coordinate", "y_coordinate", None),
    ("x_coord", "y_coord", None),
    ("xcoord", "ycoord", None),
    ("point_x", "point_y", None),
    ("pt_x", "pt_y", None),
    ("coord_x", "coord_y", None),
    ("x_pos", "y_pos", None),
    ("x", "y", None),
];

// Plain tables read by DuckDB's own scanners
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableFormat {
    Csv,
    Excel,
    Parquet,
}

/// How a recognised file is addressed: vector containers through the spatial
/// extension's `st_read`, plain tables through DuckDB's scanners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceStrategy {
    // GeoPackage and GeoJSON are read straight from their path
    Direct,
    // A Shapefile inside a zip, addressed through GDAL's /vsizip/
    ZippedShapefile { shapefile_path: String },
    Tabular(TableFormat),
}

impl SourceStrategy {
    pub fn for_file(file_path: &Path, file_type: FileType) -> Result<Self, LoadError> {
        let strategy = match file_type {
            FileType::Geopackage | FileType::Geojson => SourceStrategy::Direct,
            FileType::Shapefile => {
                let shapefile_path = find_shapefile_path(file_path)?;
                info!(%shapefile_path, "shapefile found in zip archive");
                SourceStrategy::ZippedShapefile { shapefile_path }
            }
            FileType::Csv => SourceStrategy::Tabular(TableFormat::Csv),
            FileType::Excel => SourceStrategy::Tabular(TableFormat::Excel),
            FileType::Parquet => SourceStrategy::Tabular(TableFormat::Parquet),
        };
        Ok(strategy)
    }

    pub fn is_tabular(&self) -> bool {
        matches!(self, SourceStrategy::Tabular(_))
    }

    // DuckDB extension the scanner lives in; CSV is built in
    pub fn extension(&self) -> Option<&'static str> {
        match self {
            SourceStrategy::Direct | SourceStrategy::ZippedShapefile { .. } => Some("spatial"),
            SourceStrategy::Tabular(TableFormat::Csv) => None,
            SourceStrategy::Tabular(TableFormat::Excel) => Some("excel"),
            SourceStrategy::Tabular(TableFormat::Parquet) => Some("parquet"),
        }
    }

    // The dataset name handed to GDAL or the table scanner
    pub fn dataset_path(&self, file_path: &Path) -> String {
        match self {
            SourceStrategy::ZippedShapefile { shapefile_path } => {
                format!("/vsizip/{}/{}", file_path.display(), shapefile_path)
            }
            SourceStrategy::Direct | SourceStrategy::Tabular(_) => file_path.display().to_string(),
        }
    }

    /// Table function reading `layer` of the dataset. Tables have a single
    /// layer, so `layer` only matters to `st_read`.
    pub fn scan(&self, dataset_path: &str, layer: &str) -> String {
        let path = quote_literal(dataset_path);
        match self {
            SourceStrategy::Direct | SourceStrategy::ZippedShapefile { .. } => {
                format!("st_read({path}, layer := {})", quote_literal(layer))
            }
            SourceStrategy::Tabular(TableFormat::Csv) => {
                format!("read_csv({path}, header = true, ignore_errors = true)")
            }
            SourceStrategy::Tabular(TableFormat::Excel) => format!("read_xlsx({path})"),
            SourceStrategy::Tabular(TableFormat::Parquet) => format!("read_parquet({path})"),
        }
    }

    /// CRS to assume when GDAL cannot identify the layer's CRS.
    ///
    /// Only zipped Shapefiles have one: a `.prj` naming the Ordnance Survey
    /// grid maps to EPSG:27700.
    pub fn fallback_srid(&self, file_path: &Path) -> Result<Srid, LoadError> {
        let SourceStrategy::ZippedShapefile { shapefile_path } = self else {
            return Ok(Srid::Unknown);
        };

        let prj_path = shapefile_path
            .strip_suffix(".shp")
            .map(|stem| format!("{stem}.prj"))
            .unwrap_or_else(|| format!("{shapefile_path}.prj"));

        let mut archive = open_archive(file_path)?;
        let mut prj_content = String::new();
        match archive.by_name(&prj_path) {
            Ok(mut entry) => {
                entry
                    .read_to_string(&mut prj_content)
                    .map_err(|e| corrupt_zip(file_path, e))?;
            }
            Err(zip::result::ZipError::FileNotFound) => {
                debug!(%prj_path, "no .prj entry in archive");
                return Ok(Srid::Unknown);
            }
            Err(e) => return Err(corrupt_zip(file_path, e)),
        }

        if prj_content.contains("OSGB") || prj_content.contains("27700") {
            info!("found British National Grid CRS in PRJ file");
            Ok(Srid::Known(BRITISH_NATIONAL_GRID))
        } else {
            Ok(Srid::Unknown)
        }
    }
}

/// Two columns of a table that hold point coordinates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatePair {
    pub x_column: String,
    pub y_column: String,
    /// Implied by the column names: lon/lat is WGS84, easting/northing the
    /// British National Grid.
    pub srid: Srid,
}

impl CoordinatePair {
    // Point per row; values that are not numbers give a NULL geometry
    pub fn point_expression(&self) -> String {
        format!(
            "ST_Point(TRY_CAST({} AS DOUBLE), TRY_CAST({} AS DOUBLE))",
            quote_ident(&self.x_column),
            quote_ident(&self.y_column)
        )
    }
}

fn normalise_column(name: &str) -> String {
    name.trim()
        .to_ascii_lowercase()
        .replace(['-', ' '], "_")
}

/// First known coordinate naming present among `columns`, compared without
/// case and with `-` or spaces read as `_`.
pub fn find_coordinate_pair(columns: &[String]) -> Option<CoordinatePair> {
    let find = |wanted: &str| {
        columns
            .iter()
            .find(|column| normalise_column(column) == wanted)
            .cloned()
    };
    COORDINATE_PATTERNS.iter().find_map(|(x, y, srid)| {
        let x_column = find(x)?;
        let y_column = find(y)?;
        info!(%x_column, %y_column, "coordinate columns found");
        Some(CoordinatePair {
            x_column,
            y_column,
            srid: srid.map_or(Srid::Unknown, Srid::Known),
        })
    })
}

fn open_archive(zip_path: &Path) -> Result<ZipArchive<File>, LoadError> {
    let file = File::open(zip_path).map_err(|e| corrupt_zip(zip_path, e))?;
    ZipArchive::new(file).map_err(|e| corrupt_zip(zip_path, e))
}

fn corrupt_zip(zip_path: &Path, e: impl std::fmt::Display) -> LoadError {
    LoadError::CorruptFile {
        location: zip_path.display().to_string(),
        reason: format!("unreadable zip archive: {e}"),
    }
}

// Find the first .shp entry inside a zip
pub fn find_shapefile_path(zip_path: &Path) -> Result<String, LoadError> {
    let mut archive = open_archive(zip_path)?;

    for i in 0..archive.len() {
        let entry = archive.by_index(i).map_err(|e| corrupt_zip(zip_path, e))?;
        let name = entry.name();
        if name.to_ascii_lowercase().ends_with(".shp") {
            return Ok(name.to_string());
        }
    }

    Err(LoadError::CorruptFile {
        location: zip_path.display().to_string(),
        reason: "no .shp file found in zip archive".into(),
    })
}
