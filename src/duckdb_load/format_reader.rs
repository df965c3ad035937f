//! Format Reader: opens a vector container through DuckDB's `spatial`
//! extension, or a plain table through DuckDB's own scanners, and streams one
//! layer as batches of [`Feature`]s.
//!
//! Layers and their CRS come from `st_read_meta`, the attribute schema from
//! `DESCRIBE` over the table function, and rows through DuckDB's Arrow
//! streaming result so the layer is never materialised as a whole. A table is
//! one layer named after the file; when it has a coordinate column pair its
//! rows get point geometry.

use std::path::{Path, PathBuf};

use duckdb::arrow::array::{
    Array, ArrayRef, BinaryArray, BooleanArray, Float64Array, Int64Array, LargeBinaryArray,
    LargeStringArray, StringArray,
};
use duckdb::arrow::record_batch::RecordBatch;
use duckdb::Connection;
use tracing::{debug, info, warn};

use crate::duckdb_load::geometry::{decode_wkb, Dimension, Geometry, GeometryKind, Srid};
use crate::duckdb_load::source_strategy::{find_coordinate_pair, CoordinatePair, SourceStrategy};
use crate::duckdb_load::sql::{quote_ident, quote_literal};
use crate::error::LoadError;
use crate::file_load::{determine_file_type, FileType};

// One attribute value of a feature
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Text(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SemanticType {
    Text,
    Integer,
    Float,
    Boolean,
}

impl SemanticType {
    // Total mapping from DuckDB's type names
    pub fn from_duckdb_type(duckdb_type: &str) -> Self {
        let upper = duckdb_type.trim().to_ascii_uppercase();
        let base = upper.split('(').next().unwrap_or_default().trim();
        match base {
            "TINYINT" | "SMALLINT" | "INTEGER" | "BIGINT" | "UTINYINT" | "USMALLINT"
            | "UINTEGER" | "INT1" | "INT2" | "INT4" | "INT8" | "INT" => SemanticType::Integer,
            "FLOAT" | "REAL" | "DOUBLE" | "DECIMAL" | "NUMERIC" | "UBIGINT" | "HUGEINT"
            | "UHUGEINT" | "FLOAT4" | "FLOAT8" => SemanticType::Float,
            "BOOLEAN" | "BOOL" => SemanticType::Boolean,
            _ => SemanticType::Text,
        }
    }

    fn duckdb_cast(self) -> &'static str {
        match self {
            SemanticType::Text => "VARCHAR",
            SemanticType::Integer => "BIGINT",
            SemanticType::Float => "DOUBLE",
            SemanticType::Boolean => "BOOLEAN",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: String,
    pub semantic_type: SemanticType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeometryField {
    pub name: String,
    /// `None` when the layer declares mixed or unknown geometry.
    pub kind: Option<GeometryKind>,
    pub dimension: Dimension,
    pub srid: Srid,
}

/// Attribute columns in source order plus the optional geometry column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerSchema {
    pub layer_name: String,
    pub columns: Vec<ColumnSpec>,
    pub geometry: Option<GeometryField>,
}

// One record: values aligned with LayerSchema::columns
#[derive(Debug, Clone, PartialEq)]
pub struct Feature {
    pub values: Vec<Value>,
    pub geometry: Option<Geometry>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LayerInfo {
    pub name: String,
    /// `None` when the driver cannot count without a full scan.
    pub feature_count: Option<u64>,
    pub geometry_type: Option<String>,
    pub srid: Srid,
}

/// Everything needed to stream one layer.
#[derive(Debug, Clone)]
pub struct LayerPlan {
    pub schema: LayerSchema,
    query: String,
    expected_features: Option<u64>,
}

/// A layer ready to stream, as seen by the loading pipeline.
pub trait FeatureSource: Send {
    fn schema(&self) -> &LayerSchema;

    /// File and layer, for error messages.
    fn location(&self) -> String;

    /// Push every feature to `sink` in batches of at most `batch_size` and
    /// return how many were read. A sink error stops the stream and is
    /// returned as is.
    fn stream_batches<F>(&self, batch_size: usize, sink: F) -> Result<u64, LoadError>
    where
        F: FnMut(Vec<Feature>) -> Result<(), LoadError>;
}

/// An opened reader together with the plan for one of its layers.
pub struct PlannedLayer {
    reader: FormatReader,
    plan: LayerPlan,
}

impl PlannedLayer {
    pub fn new(reader: FormatReader, plan: LayerPlan) -> Self {
        Self { reader, plan }
    }

    pub fn file_type(&self) -> FileType {
        self.reader.file_type()
    }
}

impl FeatureSource for PlannedLayer {
    fn schema(&self) -> &LayerSchema {
        &self.plan.schema
    }

    fn location(&self) -> String {
        format!(
            "{} layer '{}'",
            self.reader.file_path().display(),
            self.plan.schema.layer_name
        )
    }

    fn stream_batches<F>(&self, batch_size: usize, sink: F) -> Result<u64, LoadError>
    where
        F: FnMut(Vec<Feature>) -> Result<(), LoadError>,
    {
        self.reader.stream_batches(&self.plan, batch_size, sink)
    }
}

// Name of the point column built from a coordinate pair
const POINT_COLUMN: &str = "geom";

pub struct FormatReader {
    conn: Connection,
    file_path: PathBuf,
    file_type: FileType,
    strategy: SourceStrategy,
    dataset_path: String,
    layers: Vec<LayerInfo>,
    coordinates: Option<CoordinatePair>,
}

impl FormatReader {
    /// Detect the file type, start a private DuckDB with the extensions it
    /// needs and list the layers.
    pub fn open(file_path: impl AsRef<Path>) -> Result<Self, LoadError> {
        let file_path = file_path.as_ref().to_path_buf();
        let file_type = determine_file_type(&file_path)?;
        info!(file = %file_path.display(), %file_type, "detected file type");

        let strategy = SourceStrategy::for_file(&file_path, file_type)?;
        let dataset_path = strategy.dataset_path(&file_path);

        let conn = Connection::open_in_memory()
            .map_err(|e| LoadError::engine("opening the reader database", e))?;
        if let Some(extension) = strategy.extension() {
            load_extension(&conn, extension)?;
        }

        let mut reader = Self {
            conn,
            file_path,
            file_type,
            strategy,
            dataset_path,
            layers: Vec::new(),
            coordinates: None,
        };
        if reader.strategy.is_tabular() {
            reader.open_table()?;
        } else {
            reader.open_container()?;
        }
        Ok(reader)
    }

    fn open_container(&mut self) -> Result<(), LoadError> {
        let file_path = &self.file_path;
        let mut layers =
            read_layers(&self.conn, &self.dataset_path).map_err(|e| LoadError::CorruptFile {
                location: file_path.display().to_string(),
                reason: format!("cannot read layer metadata: {e}"),
            })?;

        if layers.iter().any(|layer| layer.srid == Srid::Unknown) {
            let fallback = self.strategy.fallback_srid(file_path)?;
            for layer in layers.iter_mut().filter(|l| l.srid == Srid::Unknown) {
                layer.srid = fallback;
            }
        }

        if layers.is_empty() {
            return Err(LoadError::UnsupportedFormat {
                path: file_path.clone(),
                reason: format!("{} container holds no vector layers", self.file_type),
            });
        }

        self.layers = layers;
        Ok(())
    }

    fn open_table(&mut self) -> Result<(), LoadError> {
        let name = self
            .file_path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "table".to_string());
        let source = self.strategy.scan(&self.dataset_path, &name);
        let column_names: Vec<String> = self
            .describe(&source)?
            .into_iter()
            .map(|(column, _)| column)
            .collect();

        self.coordinates = find_coordinate_pair(&column_names);
        let (geometry_type, srid) = match &self.coordinates {
            Some(pair) => {
                // ST_Point lives in spatial; tables without coordinates never load it
                load_extension(&self.conn, "spatial")?;
                (Some("Point".to_string()), pair.srid)
            }
            None => {
                info!(table = %name, "no coordinate columns, loading attributes only");
                (None, Srid::Unknown)
            }
        };

        self.layers = vec![LayerInfo {
            name,
            feature_count: None,
            geometry_type,
            srid,
        }];
        Ok(())
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    pub fn file_type(&self) -> FileType {
        self.file_type
    }

    pub fn layers(&self) -> &[LayerInfo] {
        &self.layers
    }

    pub fn layer_names(&self) -> Vec<String> {
        self.layers.iter().map(|l| l.name.clone()).collect()
    }

    /// Resolve the schema of the requested layer (or the first) and build its
    /// read query, reprojecting when `target_srid` differs from the layer CRS.
    pub fn plan_layer(
        &self,
        layer: Option<&str>,
        target_srid: Option<i32>,
    ) -> Result<LayerPlan, LoadError> {
        let info = match layer {
            Some(name) => self
                .layers
                .iter()
                .find(|l| l.name == name)
                .ok_or_else(|| LoadError::LayerNotFound {
                    layer: name.to_string(),
                    available: self.layer_names().join(", "),
                })?,
            // open() guarantees at least one layer
            None => &self.layers[0],
        };

        let source = self.strategy.scan(&self.dataset_path, &info.name);

        let described = self.describe(&source)?;
        let mut columns = Vec::new();
        let mut geometry_columns = Vec::new();
        for (name, column_type) in described {
            if column_type.to_ascii_uppercase().starts_with("GEOMETRY") {
                geometry_columns.push(name);
            } else {
                columns.push(ColumnSpec {
                    semantic_type: SemanticType::from_duckdb_type(&column_type),
                    name,
                });
            }
        }
        if geometry_columns.len() > 1 {
            return Err(LoadError::UnsupportedFormat {
                path: self.file_path.clone(),
                reason: format!(
                    "layer '{}' has {} geometry fields, one is supported",
                    info.name,
                    geometry_columns.len()
                ),
            });
        }

        let mut select_list: Vec<String> = columns
            .iter()
            .map(|c| format!("CAST({} AS {})", quote_ident(&c.name), c.semantic_type.duckdb_cast()))
            .collect();

        let geometry_source = match &self.coordinates {
            Some(pair) => Some((POINT_COLUMN.to_string(), pair.point_expression())),
            None => geometry_columns.pop().map(|name| {
                let column = quote_ident(&name);
                (name, column)
            }),
        };

        let geometry = match geometry_source {
            Some((name, column)) => {
                let (kind, dimension) = info
                    .geometry_type
                    .as_deref()
                    .map(parse_gdal_geometry_type)
                    .unwrap_or((None, Dimension::Xy));
                let (expr, srid) = geometry_expression(&column, info, target_srid)?;
                select_list.push(format!("CAST(ST_AsWKB({expr}) AS BLOB)"));
                Some(GeometryField {
                    name,
                    kind,
                    dimension,
                    srid,
                })
            }
            None => {
                info!(layer = %info.name, "layer has no geometry column");
                None
            }
        };

        let schema = LayerSchema {
            layer_name: info.name.clone(),
            columns,
            geometry,
        };
        debug!(?schema, "resolved layer schema");

        let select_list = if select_list.is_empty() {
            // Attribute-less, geometry-less layers still have rows
            "NULL".to_string()
        } else {
            select_list.join(", ")
        };

        Ok(LayerPlan {
            schema,
            query: format!("SELECT {select_list} FROM {source}"),
            expected_features: info.feature_count,
        })
    }

    /// Push the layer to `sink` in batches of at most `batch_size` features.
    ///
    /// Returns the number of features read. A sink error stops the stream and
    /// is returned as is.
    pub fn stream_batches<F>(
        &self,
        plan: &LayerPlan,
        batch_size: usize,
        mut sink: F,
    ) -> Result<u64, LoadError>
    where
        F: FnMut(Vec<Feature>) -> Result<(), LoadError>,
    {
        let layer = &plan.schema.layer_name;
        let read_error = |e: duckdb::Error| LoadError::CorruptFile {
            location: format!("{} layer '{layer}'", self.file_path.display()),
            reason: e.to_string(),
        };

        let mut stmt = self.conn.prepare(&plan.query).map_err(read_error)?;
        let stream = stmt.stream_arrow([]).map_err(read_error)?;

        let mut features_read: u64 = 0;
        let mut pending: Vec<Feature> = Vec::with_capacity(batch_size);
        for record_batch in stream {
            for row in 0..record_batch.num_rows() {
                pending.push(feature_at(&record_batch, row, &plan.schema, features_read)?);
                features_read += 1;
                if pending.len() == batch_size {
                    sink(std::mem::replace(&mut pending, Vec::with_capacity(batch_size)))?;
                }
            }
        }
        if !pending.is_empty() {
            sink(pending)?;
        }

        if let Some(expected) = plan.expected_features {
            if features_read < expected {
                return Err(LoadError::CorruptFile {
                    location: format!("{} layer '{layer}'", self.file_path.display()),
                    reason: format!("stream ended after {features_read} of {expected} features"),
                });
            }
        }

        debug!(%layer, features_read, "layer stream finished");
        Ok(features_read)
    }

    fn describe(&self, source: &str) -> Result<Vec<(String, String)>, LoadError> {
        let describe_error = |e: duckdb::Error| LoadError::CorruptFile {
            location: self.file_path.display().to_string(),
            reason: format!("cannot describe layer: {e}"),
        };
        let mut stmt = self
            .conn
            .prepare(&format!("DESCRIBE SELECT * FROM {source}"))
            .map_err(describe_error)?;
        let mut rows = stmt.query([]).map_err(describe_error)?;
        let mut columns = Vec::new();
        while let Some(row) = rows.next().map_err(describe_error)? {
            let name: String = row.get(0).map_err(describe_error)?;
            let column_type: String = row.get(1).map_err(describe_error)?;
            columns.push((name, column_type));
        }
        Ok(columns)
    }
}

fn load_extension(conn: &Connection, extension: &str) -> Result<(), LoadError> {
    debug!(%extension, "loading DuckDB extension");
    conn.execute_batch(&format!("INSTALL {extension}; LOAD {extension};"))
        .map_err(|e| LoadError::engine(format!("loading the {extension} extension"), e))
}

fn read_layers(conn: &Connection, dataset_path: &str) -> duckdb::Result<Vec<LayerInfo>> {
    let query = format!(
        "SELECT l.name,
                l.feature_count,
                l.geometry_fields[1].type,
                l.geometry_fields[1].crs.auth_name,
                l.geometry_fields[1].crs.auth_code
         FROM (SELECT unnest(layers) AS l FROM st_read_meta({}))",
        quote_literal(dataset_path)
    );
    let mut stmt = conn.prepare(&query)?;
    let mut rows = stmt.query([])?;

    let mut layers = Vec::new();
    while let Some(row) = rows.next()? {
        let name: String = row.get(0)?;
        let feature_count: Option<i64> = row.get(1)?;
        let geometry_type: Option<String> = row.get(2)?;
        let auth_name: Option<String> = row.get(3)?;
        let auth_code: Option<String> = row.get(4)?;
        let srid = srid_from_authority(auth_name.as_deref(), auth_code.as_deref());
        debug!(layer = %name, ?feature_count, ?geometry_type, ?srid, "found layer");
        layers.push(LayerInfo {
            name,
            feature_count: feature_count.and_then(|n| u64::try_from(n).ok()),
            geometry_type,
            srid,
        });
    }
    Ok(layers)
}

pub fn srid_from_authority(auth_name: Option<&str>, auth_code: Option<&str>) -> Srid {
    match (auth_name.map(str::to_ascii_uppercase).as_deref(), auth_code) {
        (Some("EPSG"), Some(code)) => code
            .trim()
            .parse::<i32>()
            .map(Srid::from_postgis)
            .unwrap_or(Srid::Unknown),
        // lon/lat WGS84, what GeoJSON declares by default
        (Some("OGC"), Some("CRS84")) => Srid::Known(4326),
        _ => Srid::Unknown,
    }
}

// GDAL names look like "Multi Polygon", "3D Point", "3D Measured Line String"
pub fn parse_gdal_geometry_type(name: &str) -> (Option<GeometryKind>, Dimension) {
    let mut rest = name.trim();
    let mut has_z = false;
    let mut has_m = false;
    if let Some(stripped) = rest.strip_prefix("3D ") {
        has_z = true;
        rest = stripped;
    }
    if let Some(stripped) = rest.strip_prefix("Measured ") {
        has_m = true;
        rest = stripped;
    }
    for (suffix, z, m) in [(" ZM", true, true), (" Z", true, false), (" M", false, true)] {
        if let Some(stripped) = rest.strip_suffix(suffix) {
            has_z |= z;
            has_m |= m;
            rest = stripped;
            break;
        }
    }
    (
        GeometryKind::from_name(rest),
        Dimension::from_flags(has_z, has_m),
    )
}

// Geometry expression and the SRID it yields
fn geometry_expression(
    column: &str,
    info: &LayerInfo,
    target_srid: Option<i32>,
) -> Result<(String, Srid), LoadError> {
    match (target_srid, info.srid) {
        (None, srid) => Ok((column.to_string(), srid)),
        (Some(target), Srid::Known(source)) if target == source => {
            info!(layer = %info.name, "CRS is already EPSG:{target}");
            Ok((column.to_string(), Srid::Known(target)))
        }
        (Some(target), Srid::Known(source)) => {
            info!(layer = %info.name, "transforming EPSG:{source} to EPSG:{target}");
            Ok((
                format!(
                    "ST_Transform({column}, 'EPSG:{source}', 'EPSG:{target}', always_xy := true)"
                ),
                Srid::Known(target),
            ))
        }
        (Some(target), Srid::Unknown) => {
            warn!(layer = %info.name, "cannot reproject a layer with unknown CRS");
            Err(LoadError::UnknownCrs {
                layer: info.name.clone(),
                target_srid: target,
            })
        }
    }
}

fn feature_at(
    batch: &RecordBatch,
    row: usize,
    schema: &LayerSchema,
    feature_index: u64,
) -> Result<Feature, LoadError> {
    let location = || format!("layer '{}' feature {feature_index}", schema.layer_name);

    let values = schema
        .columns
        .iter()
        .enumerate()
        .map(|(i, column)| value_at(batch.column(i), row, column.semantic_type, &location))
        .collect::<Result<Vec<_>, _>>()?;

    let geometry = match &schema.geometry {
        None => None,
        Some(field) => {
            let array = batch.column(schema.columns.len());
            match blob_at(array, row, &location)? {
                None => None,
                Some(bytes) => Some(
                    decode_wkb(bytes)
                        .map_err(|e| e.into_load_error(location()))?
                        .with_srid(field.srid),
                ),
            }
        }
    };

    Ok(Feature { values, geometry })
}

fn unexpected_array(location: &dyn Fn() -> String, array: &ArrayRef) -> LoadError {
    LoadError::CorruptFile {
        location: location(),
        reason: format!("unexpected column type {:?}", array.data_type()),
    }
}

fn value_at(
    array: &ArrayRef,
    row: usize,
    semantic_type: SemanticType,
    location: &dyn Fn() -> String,
) -> Result<Value, LoadError> {
    if array.is_null(row) {
        return Ok(Value::Null);
    }
    let any = array.as_any();
    let value = match semantic_type {
        SemanticType::Integer => any
            .downcast_ref::<Int64Array>()
            .map(|a| Value::Integer(a.value(row))),
        SemanticType::Float => any
            .downcast_ref::<Float64Array>()
            .map(|a| Value::Float(a.value(row))),
        SemanticType::Boolean => any
            .downcast_ref::<BooleanArray>()
            .map(|a| Value::Boolean(a.value(row))),
        SemanticType::Text => any
            .downcast_ref::<StringArray>()
            .map(|a| Value::Text(a.value(row).to_string()))
            .or_else(|| {
                any.downcast_ref::<LargeStringArray>()
                    .map(|a| Value::Text(a.value(row).to_string()))
            }),
    };
    value.ok_or_else(|| unexpected_array(location, array))
}

fn blob_at<'a>(
    array: &'a ArrayRef,
    row: usize,
    location: &dyn Fn() -> String,
) -> Result<Option<&'a [u8]>, LoadError> {
    if array.is_null(row) {
        return Ok(None);
    }
    let any = array.as_any();
    if let Some(a) = any.downcast_ref::<BinaryArray>() {
        return Ok(Some(a.value(row)));
    }
    if let Some(a) = any.downcast_ref::<LargeBinaryArray>() {
        return Ok(Some(a.value(row)));
    }
    Err(unexpected_array(location, array))
}
