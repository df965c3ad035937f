use duckdb::Connection;
use tracing::{debug, info, warn};

use crate::connection::ConnectionDescriptor;
use crate::duckdb_load::sql::{postgres_execute, postgres_query, quote_literal};
use crate::error::LoadError;

// Name the destination database is attached under inside DuckDB
pub const TARGET_ALIAS: &str = "target_pg";

// Substrings libpq and the postgres extension use for transport failures
const CONNECTION_MARKERS: [&str; 14] = [
    "unable to connect",
    "could not connect",
    "connection refused",
    "connection to server",
    "server closed the connection",
    "could not translate host name",
    "no route to host",
    "connection reset",
    "broken pipe",
    "terminating connection",
    "timed out",
    "timeout expired",
    "ssl syscall",
    "no connection to the server",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExistingColumn {
    pub name: String,
    pub udt_name: String,
}

// A row of PostGIS' geometry_columns view
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExistingGeometry {
    pub column: String,
    pub geometry_type: String,
    pub srid: i32,
    pub coord_dimension: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExistingTable {
    pub columns: Vec<ExistingColumn>,
    pub geometry_columns: Vec<ExistingGeometry>,
}

/// The destination side of a load.
///
/// The production implementation is [`AttachedPostgis`]; the trait is the
/// seam the schema mapper and bulk loader are written against.
pub trait PostgisProcessor {
    /// Human-readable destination, password redacted.
    fn target_name(&self) -> String;

    /// Run one statement on the destination, inside the open transaction if
    /// there is one.
    fn execute(&mut self, statement: &str) -> Result<(), LoadError>;

    /// Columns of `schema.table`, or `None` when the table does not exist.
    fn existing_table(
        &mut self,
        schema_name: &str,
        table_name: &str,
    ) -> Result<Option<ExistingTable>, LoadError>;

    fn begin(&mut self) -> Result<(), LoadError>;
    fn commit(&mut self) -> Result<(), LoadError>;
    fn rollback(&mut self) -> Result<(), LoadError>;
}

impl<P: PostgisProcessor + ?Sized> PostgisProcessor for &mut P {
    fn target_name(&self) -> String {
        (**self).target_name()
    }

    fn execute(&mut self, statement: &str) -> Result<(), LoadError> {
        (**self).execute(statement)
    }

    fn existing_table(
        &mut self,
        schema_name: &str,
        table_name: &str,
    ) -> Result<Option<ExistingTable>, LoadError> {
        (**self).existing_table(schema_name, table_name)
    }

    fn begin(&mut self) -> Result<(), LoadError> {
        (**self).begin()
    }

    fn commit(&mut self) -> Result<(), LoadError> {
        (**self).commit()
    }

    fn rollback(&mut self) -> Result<(), LoadError> {
        (**self).rollback()
    }
}

pub fn is_connection_failure(message: &str) -> bool {
    let lower = message.to_lowercase();
    CONNECTION_MARKERS.iter().any(|marker| lower.contains(marker))
}

// Translate a destination-side DuckDB error into the taxonomy
pub fn classify_target_error(target: &str, error: &duckdb::Error) -> LoadError {
    let message = error.to_string();
    if is_connection_failure(&message) {
        LoadError::ConnectionLost {
            target: target.to_string(),
            message,
            rows_committed: 0,
        }
    } else {
        LoadError::WriteRejected {
            message,
            rows_committed: 0,
        }
    }
}

/// A PostGIS database attached to a private DuckDB instance through the
/// `postgres` extension.
pub struct AttachedPostgis {
    conn: Connection,
    target: ConnectionDescriptor,
    in_transaction: bool,
    healthy: bool,
}

impl AttachedPostgis {
    pub fn connect(target: &ConnectionDescriptor) -> Result<Self, LoadError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| LoadError::engine("opening the writer database", e))?;
        conn.execute_batch("INSTALL postgres; LOAD postgres;")
            .map_err(|e| LoadError::engine("loading the postgres extension", e))?;

        // Any ATTACH failure means we never reached a usable server
        conn.execute_batch(&format!(
            "ATTACH {} AS {TARGET_ALIAS} (TYPE POSTGRES);",
            quote_literal(target.as_uri())
        ))
        .map_err(|e| LoadError::ConnectionLost {
            target: target.redacted(),
            message: target.scrub(&e.to_string()),
            rows_committed: 0,
        })?;

        info!(target = %target, "attached PostGIS database");
        Ok(Self {
            conn,
            target: target.clone(),
            in_transaction: false,
            healthy: true,
        })
    }

    pub fn descriptor(&self) -> &ConnectionDescriptor {
        &self.target
    }

    // False once the session has seen a transport failure
    pub fn is_healthy(&self) -> bool {
        self.healthy && !self.in_transaction
    }

    fn run(&mut self, sql: &str) -> Result<(), LoadError> {
        self.conn.execute_batch(sql).map_err(|e| {
            let err = classify_target_error(&self.target.redacted(), &e);
            if matches!(err, LoadError::ConnectionLost { .. }) {
                self.healthy = false;
            }
            err
        })
    }

    fn query_rows<T>(
        &mut self,
        statement: &str,
        map_row: impl Fn(&duckdb::Row<'_>) -> duckdb::Result<T>,
    ) -> Result<Vec<T>, LoadError> {
        let target = self.target.redacted();
        let classify = |e: duckdb::Error| classify_target_error(&target, &e);

        let mut stmt = self
            .conn
            .prepare(&postgres_query(TARGET_ALIAS, statement))
            .map_err(classify)?;
        let mut rows = stmt.query([]).map_err(classify)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(classify)? {
            out.push(map_row(row).map_err(classify)?);
        }
        Ok(out)
    }
}

impl PostgisProcessor for AttachedPostgis {
    fn target_name(&self) -> String {
        self.target.redacted()
    }

    fn execute(&mut self, statement: &str) -> Result<(), LoadError> {
        debug!(bytes = statement.len(), "executing on destination");
        self.run(&postgres_execute(TARGET_ALIAS, statement))
    }

    fn existing_table(
        &mut self,
        schema_name: &str,
        table_name: &str,
    ) -> Result<Option<ExistingTable>, LoadError> {
        let columns = self.query_rows(
            &format!(
                "SELECT column_name::text, udt_name::text
                 FROM information_schema.columns
                 WHERE table_schema = {} AND table_name = {}
                 ORDER BY ordinal_position",
                quote_literal(schema_name),
                quote_literal(table_name)
            ),
            |row| {
                Ok(ExistingColumn {
                    name: row.get(0)?,
                    udt_name: row.get(1)?,
                })
            },
        )?;

        if columns.is_empty() {
            return Ok(None);
        }

        let geometry_columns = if columns.iter().any(|c| c.udt_name == "geometry") {
            self.query_rows(
                &format!(
                    "SELECT f_geometry_column::text, type::text, srid, coord_dimension
                     FROM public.geometry_columns
                     WHERE f_table_schema = {} AND f_table_name = {}",
                    quote_literal(schema_name),
                    quote_literal(table_name)
                ),
                |row| {
                    Ok(ExistingGeometry {
                        column: row.get(0)?,
                        geometry_type: row.get(1)?,
                        srid: row.get(2)?,
                        coord_dimension: row.get(3)?,
                    })
                },
            )?
        } else {
            Vec::new()
        };

        Ok(Some(ExistingTable {
            columns,
            geometry_columns,
        }))
    }

    fn begin(&mut self) -> Result<(), LoadError> {
        self.run("BEGIN TRANSACTION;")?;
        self.in_transaction = true;
        Ok(())
    }

    fn commit(&mut self) -> Result<(), LoadError> {
        let result = self.run("COMMIT;");
        // A failed COMMIT still ends the transaction
        self.in_transaction = false;
        result
    }

    fn rollback(&mut self) -> Result<(), LoadError> {
        let result = self.run("ROLLBACK;");
        self.in_transaction = false;
        if result.is_err() {
            warn!(target = %self.target, "rollback failed, session marked unhealthy");
            self.healthy = false;
        }
        result
    }
}
