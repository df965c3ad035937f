use std::collections::HashSet;

use tracing::{info, warn};

use crate::config::IfExists;
use crate::duckdb_load::format_reader::{LayerSchema, SemanticType};
use crate::duckdb_load::geometry::{Dimension, GeometryKind, Srid};
use crate::duckdb_load::postgis_processor::{ExistingTable, PostgisProcessor};
use crate::duckdb_load::sql::{qualified_table, quote_ident};
use crate::error::LoadError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetColumn {
    pub name: String,
    pub semantic_type: SemanticType,
}

impl TargetColumn {
    pub fn sql_type(&self) -> &'static str {
        postgres_type(self.semantic_type)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetGeometry {
    pub name: String,
    pub kind: Option<GeometryKind>,
    pub dimension: Dimension,
    pub srid: Srid,
}

impl TargetGeometry {
    // geometry(PolygonZ, 27700), geometry(Geometry, 4326), geometry(Point) ...
    pub fn sql_type(&self) -> String {
        let kind = self
            .kind
            .map(GeometryKind::postgis_name)
            .unwrap_or("Geometry");
        let type_name = format!("{kind}{}", self.dimension.postgis_suffix());
        match self.srid {
            Srid::Known(code) => format!("geometry({type_name}, {code})"),
            Srid::Unknown => format!("geometry({type_name})"),
        }
    }
}

/// Destination table derived from a layer schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadTarget {
    pub schema_name: String,
    pub table_name: String,
    pub columns: Vec<TargetColumn>,
    pub geometry: Option<TargetGeometry>,
}

impl LoadTarget {
    pub fn qualified_name(&self) -> String {
        qualified_table(&self.schema_name, &self.table_name)
    }

    // Quoted column list in insert order: attributes, then geometry
    pub fn insert_columns(&self) -> Vec<String> {
        self.columns
            .iter()
            .map(|c| quote_ident(&c.name))
            .chain(self.geometry.iter().map(|g| quote_ident(&g.name)))
            .collect()
    }

    pub fn create_schema_sql(&self) -> String {
        format!("CREATE SCHEMA IF NOT EXISTS {};", quote_ident(&self.schema_name))
    }

    pub fn create_table_sql(&self) -> String {
        let definitions: Vec<String> = self
            .columns
            .iter()
            .map(|c| format!("{} {}", quote_ident(&c.name), c.sql_type()))
            .chain(
                self.geometry
                    .iter()
                    .map(|g| format!("{} {}", quote_ident(&g.name), g.sql_type())),
            )
            .collect();
        format!(
            "CREATE TABLE IF NOT EXISTS {} ({});",
            self.qualified_name(),
            definitions.join(", ")
        )
    }

    pub fn drop_table_sql(&self) -> String {
        format!("DROP TABLE IF EXISTS {};", self.qualified_name())
    }
}

// The fixed mapping from semantic types to PostgreSQL column types
pub fn postgres_type(semantic_type: SemanticType) -> &'static str {
    match semantic_type {
        SemanticType::Text => "text",
        SemanticType::Integer => "bigint",
        SemanticType::Float => "double precision",
        SemanticType::Boolean => "boolean",
    }
}

// udt_names an existing column may have and still accept the mapped values
fn compatible_udt_names(semantic_type: SemanticType) -> &'static [&'static str] {
    match semantic_type {
        SemanticType::Text => &["text", "varchar", "citext"],
        SemanticType::Integer => &["int8", "numeric"],
        SemanticType::Float => &["float8", "numeric"],
        SemanticType::Boolean => &["bool"],
    }
}

// Clean the table name so that a file extension and whitespace are removed
pub fn clean_table_name(table_name: &str) -> String {
    let trimmed = table_name.trim();
    trimmed
        .rsplit_once('.')
        .map(|(name, _)| name)
        .unwrap_or(trimmed)
        .trim()
        .to_string()
}

/// Map a layer schema onto a destination table.
///
/// Column order follows the source; names that collide (case-insensitively,
/// geometry column included) are rejected.
pub fn map_schema(
    layer: &LayerSchema,
    schema_name: &str,
    table_name: &str,
) -> Result<LoadTarget, LoadError> {
    let schema_name = schema_name.trim();
    let table_name = clean_table_name(table_name);
    if schema_name.is_empty() || table_name.is_empty() {
        return Err(LoadError::InvalidOptions {
            reason: format!("schema '{schema_name}' and table '{table_name}' must be non-empty"),
        });
    }

    let mut seen = HashSet::new();
    let names = layer
        .columns
        .iter()
        .map(|c| &c.name)
        .chain(layer.geometry.iter().map(|g| &g.name));
    for name in names {
        if !seen.insert(name.to_lowercase()) {
            return Err(LoadError::DuplicateColumn {
                layer: layer.layer_name.clone(),
                column: name.clone(),
            });
        }
    }

    Ok(LoadTarget {
        schema_name: schema_name.to_string(),
        table_name,
        columns: layer
            .columns
            .iter()
            .map(|c| TargetColumn {
                name: c.name.clone(),
                semantic_type: c.semantic_type,
            })
            .collect(),
        geometry: layer.geometry.as_ref().map(|g| TargetGeometry {
            name: g.name.clone(),
            kind: g.kind,
            dimension: g.dimension,
            srid: g.srid,
        }),
    })
}

/// Check that an existing table can take the mapped rows.
pub fn check_compatibility(target: &LoadTarget, existing: &ExistingTable) -> Result<(), LoadError> {
    let conflict = |reason: String| LoadError::SchemaConflict {
        table: target.qualified_name(),
        reason,
    };
    let find = |name: &str| existing.columns.iter().find(|c| c.name == name);

    for column in &target.columns {
        let found = find(&column.name)
            .ok_or_else(|| conflict(format!("column \"{}\" is missing", column.name)))?;
        if !compatible_udt_names(column.semantic_type).contains(&found.udt_name.as_str()) {
            return Err(conflict(format!(
                "column \"{}\" is {} but the layer needs {}",
                column.name,
                found.udt_name,
                column.sql_type()
            )));
        }
    }

    if let Some(geometry) = &target.geometry {
        let found = find(&geometry.name)
            .ok_or_else(|| conflict(format!("geometry column \"{}\" is missing", geometry.name)))?;
        if found.udt_name != "geometry" {
            return Err(conflict(format!(
                "column \"{}\" is {}, not geometry",
                geometry.name, found.udt_name
            )));
        }
        if let Some(registered) = existing
            .geometry_columns
            .iter()
            .find(|g| g.column == geometry.name)
        {
            let existing_type = registered.geometry_type.to_ascii_uppercase();
            let unconstrained_type = existing_type == "GEOMETRY";

            if !unconstrained_type {
                let existing_kind = GeometryKind::from_name(existing_type.trim_end_matches('M'));
                if geometry.kind.is_none() || existing_kind != geometry.kind {
                    return Err(conflict(format!(
                        "geometry column \"{}\" holds {} but the layer is {}",
                        geometry.name,
                        registered.geometry_type,
                        geometry.sql_type()
                    )));
                }
            }

            if registered.srid != 0 && Srid::from_postgis(registered.srid) != geometry.srid {
                return Err(conflict(format!(
                    "geometry column \"{}\" has SRID {} but the layer has {:?}",
                    geometry.name, registered.srid, geometry.srid
                )));
            }

            let constrained = !unconstrained_type || registered.srid != 0;
            if constrained && registered.coord_dimension as usize != geometry.dimension.ordinates() {
                return Err(conflict(format!(
                    "geometry column \"{}\" has {} dimensions but the layer has {}",
                    geometry.name,
                    registered.coord_dimension,
                    geometry.dimension.ordinates()
                )));
            }
        }
    }

    Ok(())
}

/// Look at the table already in place without changing anything.
///
/// Returns true when it exists. Appending requires it to be compatible;
/// replacing ignores its shape.
pub fn inspect_target<P: PostgisProcessor + ?Sized>(
    processor: &mut P,
    target: &LoadTarget,
    if_exists: IfExists,
) -> Result<bool, LoadError> {
    match processor.existing_table(&target.schema_name, &target.table_name)? {
        Some(existing) if if_exists == IfExists::Append => {
            check_compatibility(target, &existing)?;
            info!(table = %target.qualified_name(), "appending to existing table");
            Ok(true)
        }
        Some(_) => Ok(true),
        None => Ok(false),
    }
}

/// Target DDL: schema, optional drop, table. Run inside the load transaction
/// so a failed load leaves none of it behind.
pub fn prepare_target<P: PostgisProcessor + ?Sized>(
    processor: &mut P,
    target: &LoadTarget,
    if_exists: IfExists,
) -> Result<(), LoadError> {
    processor.execute(&target.create_schema_sql())?;

    if if_exists == IfExists::Replace {
        warn!(table = %target.qualified_name(), "dropping existing table before load");
        processor.execute(&target.drop_table_sql())?;
    }

    // IF NOT EXISTS makes this a no-op when appending
    processor.execute(&target.create_table_sql())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::duckdb_load::format_reader::{ColumnSpec, GeometryField};
    use crate::duckdb_load::postgis_processor::{ExistingColumn, ExistingGeometry};
    use crate::duckdb_load::test_support::RecordingTarget;
    use crate::error::ErrorKind;

    fn boundaries() -> LayerSchema {
        LayerSchema {
            layer_name: "boundaries".into(),
            columns: vec![
                ColumnSpec {
                    name: "name".into(),
                    semantic_type: SemanticType::Text,
                },
                ColumnSpec {
                    name: "population".into(),
                    semantic_type: SemanticType::Integer,
                },
                ColumnSpec {
                    name: "area_ha".into(),
                    semantic_type: SemanticType::Float,
                },
                ColumnSpec {
                    name: "designated".into(),
                    semantic_type: SemanticType::Boolean,
                },
            ],
            geometry: Some(GeometryField {
                name: "geom".into(),
                kind: Some(GeometryKind::Polygon),
                dimension: Dimension::Xy,
                srid: Srid::Known(27700),
            }),
        }
    }

    fn existing_for(target: &LoadTarget) -> ExistingTable {
        let udt = |t: SemanticType| match t {
            SemanticType::Text => "text",
            SemanticType::Integer => "int8",
            SemanticType::Float => "float8",
            SemanticType::Boolean => "bool",
        };
        ExistingTable {
            columns: target
                .columns
                .iter()
                .map(|c| ExistingColumn {
                    name: c.name.clone(),
                    udt_name: udt(c.semantic_type).into(),
                })
                .chain(std::iter::once(ExistingColumn {
                    name: "geom".into(),
                    udt_name: "geometry".into(),
                }))
                .collect(),
            geometry_columns: vec![ExistingGeometry {
                column: "geom".into(),
                geometry_type: "POLYGON".into(),
                srid: 27700,
                coord_dimension: 2,
            }],
        }
    }

    #[test]
    fn maps_types_and_builds_ddl() {
        let target = map_schema(&boundaries(), "add_schema", "add_table").unwrap();
        assert_eq!(
            target.create_schema_sql(),
            "CREATE SCHEMA IF NOT EXISTS \"add_schema\";"
        );
        assert_eq!(
            target.create_table_sql(),
            "CREATE TABLE IF NOT EXISTS \"add_schema\".\"add_table\" (\"name\" text, \
             \"population\" bigint, \"area_ha\" double precision, \"designated\" boolean, \
             \"geom\" geometry(Polygon, 27700));"
        );
    }

    #[test]
    fn geometry_type_modifiers() {
        let mut geometry = TargetGeometry {
            name: "geom".into(),
            kind: None,
            dimension: Dimension::Xyz,
            srid: Srid::Unknown,
        };
        assert_eq!(geometry.sql_type(), "geometry(GeometryZ)");
        geometry.kind = Some(GeometryKind::MultiPolygon);
        geometry.srid = Srid::Known(4326);
        assert_eq!(geometry.sql_type(), "geometry(MultiPolygonZ, 4326)");
    }

    #[test]
    fn table_name_extension_is_stripped() {
        assert_eq!(clean_table_name(" boundaries.gpkg "), "boundaries");
        assert_eq!(clean_table_name("add_table"), "add_table");
        let target = map_schema(&boundaries(), "add_schema", "High_Street.gpkg").unwrap();
        assert_eq!(target.table_name, "High_Street");
    }

    #[test]
    fn duplicate_columns_are_rejected() {
        let mut layer = boundaries();
        layer.columns.push(ColumnSpec {
            name: "Name".into(),
            semantic_type: SemanticType::Text,
        });
        let err = map_schema(&layer, "add_schema", "add_table").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DuplicateColumn);

        let mut layer = boundaries();
        layer.columns.push(ColumnSpec {
            name: "GEOM".into(),
            semantic_type: SemanticType::Text,
        });
        assert!(map_schema(&layer, "add_schema", "add_table").is_err());
    }

    #[test]
    fn matching_table_is_compatible() {
        let target = map_schema(&boundaries(), "add_schema", "add_table").unwrap();
        assert!(check_compatibility(&target, &existing_for(&target)).is_ok());
    }

    #[test]
    fn retyped_column_conflicts() {
        let target = map_schema(&boundaries(), "add_schema", "add_table").unwrap();
        let mut existing = existing_for(&target);
        existing.columns[1].udt_name = "int4".into();
        let err = check_compatibility(&target, &existing).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SchemaConflict);
        assert!(err.to_string().contains("population"));
    }

    #[test]
    fn missing_column_conflicts() {
        let target = map_schema(&boundaries(), "add_schema", "add_table").unwrap();
        let mut existing = existing_for(&target);
        existing.columns.retain(|c| c.name != "designated");
        assert!(check_compatibility(&target, &existing).is_err());
    }

    #[test]
    fn inspection_checks_only_when_appending() {
        let target = map_schema(&boundaries(), "add_schema", "add_table").unwrap();
        let mut existing = existing_for(&target);
        existing.columns[1].udt_name = "int4".into();
        let mut db = RecordingTarget::default();
        db.existing = Some(existing);

        let err = inspect_target(&mut db, &target, IfExists::Append).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SchemaConflict);
        assert!(inspect_target(&mut db, &target, IfExists::Replace).unwrap());
        assert!(db.statements.is_empty());
    }

    #[test]
    fn geometry_srid_and_kind_must_agree() {
        let target = map_schema(&boundaries(), "add_schema", "add_table").unwrap();

        let mut existing = existing_for(&target);
        existing.geometry_columns[0].srid = 4326;
        assert!(check_compatibility(&target, &existing).is_err());

        let mut existing = existing_for(&target);
        existing.geometry_columns[0].geometry_type = "POINT".into();
        assert!(check_compatibility(&target, &existing).is_err());

        let mut existing = existing_for(&target);
        existing.geometry_columns[0].geometry_type = "GEOMETRY".into();
        existing.geometry_columns[0].srid = 0;
        assert!(check_compatibility(&target, &existing).is_ok());
    }
}
