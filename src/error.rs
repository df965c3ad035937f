//! Error taxonomy for a single `process_file` call.
//!
//! Every failure path ends in exactly one [`LoadError`] variant. Low-level
//! `duckdb::Error`s are classified at the boundary where they happen (reader,
//! schema mapper, loader) so callers can branch on [`LoadError::kind`] instead
//! of matching message strings.

use std::path::PathBuf;
use thiserror::Error;

/// Terminal failure of a load.
#[derive(Debug, Error)]
pub enum LoadError {
    /// The source path does not exist.
    #[error("file not found: '{}'", path.display())]
    FileNotFound { path: PathBuf },

    /// The file signature is unknown, or names a container that holds no
    /// vector layers.
    #[error("unsupported format for '{}': {reason}", path.display())]
    UnsupportedFormat { path: PathBuf, reason: String },

    /// The container (or a geometry blob inside it) is structurally invalid.
    #[error("corrupt input at {location}: {reason}")]
    CorruptFile { location: String, reason: String },

    /// A geometry type code outside the OGC simple-feature set.
    #[error("unsupported geometry type: {detail}")]
    UnsupportedGeometryType { detail: String },

    /// Two source columns map to the same destination column name.
    #[error("duplicate column '{column}' in layer '{layer}'")]
    DuplicateColumn { layer: String, column: String },

    /// The destination table exists with columns the layer cannot be written to.
    #[error("table {table} conflicts with the layer schema: {reason}")]
    SchemaConflict { table: String, reason: String },

    /// The destination URI could not be parsed.
    #[error("invalid connection string: {reason}")]
    InvalidConnectionString { reason: String },

    /// The destination could not be reached, or dropped the session mid-load.
    #[error("connection to {target} lost: {message}")]
    ConnectionLost {
        target: String,
        message: String,
        /// Rows committed before the failure (non-zero only in per-batch mode).
        rows_committed: u64,
    },

    /// The caller asked for a layer the container does not have.
    #[error("layer '{layer}' not found; available layers: [{available}]")]
    LayerNotFound { layer: String, available: String },

    /// Reprojection was requested but the layer CRS is not identifiable.
    #[error("layer '{layer}' has no recognised CRS, cannot reproject to EPSG:{target_srid}")]
    UnknownCrs { layer: String, target_srid: i32 },

    /// The destination refused a statement (constraint, permission, syntax).
    #[error("destination rejected statement: {message}")]
    WriteRejected { message: String, rows_committed: u64 },

    /// The embedded DuckDB engine failed outside of file or destination I/O.
    #[error("embedded engine failure while {context}: {source}")]
    Engine {
        context: String,
        #[source]
        source: duckdb::Error,
    },

    /// `LoadOptions` failed validation.
    #[error("invalid load options: {reason}")]
    InvalidOptions { reason: String },

    /// The caller cancelled the load.
    #[error("load cancelled after {rows_committed} committed rows")]
    Cancelled { rows_committed: u64 },
}

/// Fieldless mirror of [`LoadError`] for branching and for the Python bindings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    FileNotFound,
    UnsupportedFormat,
    CorruptFile,
    UnsupportedGeometryType,
    DuplicateColumn,
    SchemaConflict,
    InvalidConnectionString,
    ConnectionLost,
    LayerNotFound,
    UnknownCrs,
    WriteRejected,
    Engine,
    InvalidOptions,
    Cancelled,
}

impl LoadError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LoadError::FileNotFound { .. } => ErrorKind::FileNotFound,
            LoadError::UnsupportedFormat { .. } => ErrorKind::UnsupportedFormat,
            LoadError::CorruptFile { .. } => ErrorKind::CorruptFile,
            LoadError::UnsupportedGeometryType { .. } => ErrorKind::UnsupportedGeometryType,
            LoadError::DuplicateColumn { .. } => ErrorKind::DuplicateColumn,
            LoadError::SchemaConflict { .. } => ErrorKind::SchemaConflict,
            LoadError::InvalidConnectionString { .. } => ErrorKind::InvalidConnectionString,
            LoadError::ConnectionLost { .. } => ErrorKind::ConnectionLost,
            LoadError::LayerNotFound { .. } => ErrorKind::LayerNotFound,
            LoadError::UnknownCrs { .. } => ErrorKind::UnknownCrs,
            LoadError::WriteRejected { .. } => ErrorKind::WriteRejected,
            LoadError::Engine { .. } => ErrorKind::Engine,
            LoadError::InvalidOptions { .. } => ErrorKind::InvalidOptions,
            LoadError::Cancelled { .. } => ErrorKind::Cancelled,
        }
    }

    /// Record how many rows were durably committed before this error.
    ///
    /// Only the variants raised while loading carry the count; the others are
    /// returned unchanged.
    pub fn with_rows_committed(self, committed: u64) -> Self {
        match self {
            LoadError::ConnectionLost {
                target, message, ..
            } => LoadError::ConnectionLost {
                target,
                message,
                rows_committed: committed,
            },
            LoadError::WriteRejected { message, .. } => LoadError::WriteRejected {
                message,
                rows_committed: committed,
            },
            LoadError::Cancelled { .. } => LoadError::Cancelled {
                rows_committed: committed,
            },
            other => other,
        }
    }

    /// Rows committed before the failure, where the variant tracks it.
    pub fn rows_committed(&self) -> u64 {
        match self {
            LoadError::ConnectionLost { rows_committed, .. }
            | LoadError::WriteRejected { rows_committed, .. }
            | LoadError::Cancelled { rows_committed } => *rows_committed,
            _ => 0,
        }
    }

    pub(crate) fn engine(context: impl Into<String>, source: duckdb::Error) -> Self {
        LoadError::Engine {
            context: context.into(),
            source,
        }
    }
}
