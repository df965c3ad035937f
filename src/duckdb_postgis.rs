use pyo3::prelude::*;

use crate::error::ErrorKind;

pub mod exceptions {
    use pyo3::create_exception;
    use pyo3::exceptions::PyRuntimeError;

    create_exception!(duckdb_postgis, LoadError, PyRuntimeError);
    create_exception!(duckdb_postgis, FileNotFoundError, LoadError);
    create_exception!(duckdb_postgis, UnsupportedFormatError, LoadError);
    create_exception!(duckdb_postgis, CorruptFileError, LoadError);
    create_exception!(duckdb_postgis, UnsupportedGeometryTypeError, LoadError);
    create_exception!(duckdb_postgis, DuplicateColumnError, LoadError);
    create_exception!(duckdb_postgis, SchemaConflictError, LoadError);
    create_exception!(duckdb_postgis, InvalidConnectionStringError, LoadError);
    create_exception!(duckdb_postgis, ConnectionLostError, LoadError);
    create_exception!(duckdb_postgis, LayerNotFoundError, LoadError);
    create_exception!(duckdb_postgis, UnknownCrsError, LoadError);
    create_exception!(duckdb_postgis, WriteRejectedError, LoadError);
    create_exception!(duckdb_postgis, EngineError, LoadError);
    create_exception!(duckdb_postgis, InvalidOptionsError, LoadError);
    create_exception!(duckdb_postgis, CancelledError, LoadError);
}

fn to_py_err(kind: ErrorKind, message: String) -> PyErr {
    use exceptions::*;
    match kind {
        ErrorKind::FileNotFound => FileNotFoundError::new_err(message),
        ErrorKind::UnsupportedFormat => UnsupportedFormatError::new_err(message),
        ErrorKind::CorruptFile => CorruptFileError::new_err(message),
        ErrorKind::UnsupportedGeometryType => UnsupportedGeometryTypeError::new_err(message),
        ErrorKind::DuplicateColumn => DuplicateColumnError::new_err(message),
        ErrorKind::SchemaConflict => SchemaConflictError::new_err(message),
        ErrorKind::InvalidConnectionString => InvalidConnectionStringError::new_err(message),
        ErrorKind::ConnectionLost => ConnectionLostError::new_err(message),
        ErrorKind::LayerNotFound => LayerNotFoundError::new_err(message),
        ErrorKind::UnknownCrs => UnknownCrsError::new_err(message),
        ErrorKind::WriteRejected => WriteRejectedError::new_err(message),
        ErrorKind::Engine => EngineError::new_err(message),
        ErrorKind::InvalidOptions => InvalidOptionsError::new_err(message),
        ErrorKind::Cancelled => CancelledError::new_err(message),
    }
}

// Returns True once every row is committed; failures raise a LoadError subclass
#[pyfunction]
fn process_file(
    py: Python<'_>,
    file_path: &str,
    table_name: &str,
    postgis_uri: &str,
    schema_name: &str,
) -> PyResult<bool> {
    py.allow_threads(|| {
        crate::duckdb_load::core_processor::process_file(
            file_path,
            table_name,
            postgis_uri,
            schema_name,
        )
        .map_err(|e| (e.kind(), e.to_string()))
    })
    .map_err(|(kind, message)| to_py_err(kind, message))?;
    Ok(true)
}

#[pymodule]
#[pyo3(name = "duckdb_postgis")]
fn duckdb_postgis(m: &Bound<'_, PyModule>) -> PyResult<()> {
    use exceptions::*;
    let py = m.py();
    m.add_function(wrap_pyfunction!(process_file, m)?)?;
    m.add("LoadError", py.get_type::<LoadError>())?;
    m.add("FileNotFoundError", py.get_type::<FileNotFoundError>())?;
    m.add("UnsupportedFormatError", py.get_type::<UnsupportedFormatError>())?;
    m.add("CorruptFileError", py.get_type::<CorruptFileError>())?;
    m.add(
        "UnsupportedGeometryTypeError",
        py.get_type::<UnsupportedGeometryTypeError>(),
    )?;
    m.add("DuplicateColumnError", py.get_type::<DuplicateColumnError>())?;
    m.add("SchemaConflictError", py.get_type::<SchemaConflictError>())?;
    m.add(
        "InvalidConnectionStringError",
        py.get_type::<InvalidConnectionStringError>(),
    )?;
    m.add("ConnectionLostError", py.get_type::<ConnectionLostError>())?;
    m.add("LayerNotFoundError", py.get_type::<LayerNotFoundError>())?;
    m.add("UnknownCrsError", py.get_type::<UnknownCrsError>())?;
    m.add("WriteRejectedError", py.get_type::<WriteRejectedError>())?;
    m.add("EngineError", py.get_type::<EngineError>())?;
    m.add("InvalidOptionsError", py.get_type::<InvalidOptionsError>())?;
    m.add("CancelledError", py.get_type::<CancelledError>())?;
    Ok(())
}
