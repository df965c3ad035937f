//! Bulk Loader: writes feature batches as multi-row `INSERT`s under the
//! configured transaction mode.
//!
//! `TransactionMode::WholeLoad` keeps the target DDL and every batch in one
//! transaction, so any failure leaves the destination as it was before the
//! call. `PerBatch` runs the DDL inside the first batch's transaction and
//! commits at each batch boundary; a failure then only rolls back the
//! in-flight batch and the error reports how many rows were already committed.

use tracing::{debug, info, warn};

use crate::config::{LoadOptions, TransactionMode};
use crate::duckdb_load::format_reader::Feature;
use crate::duckdb_load::geometry::translate;
use crate::duckdb_load::postgis_processor::PostgisProcessor;
use crate::duckdb_load::schema_mapper::{prepare_target, LoadTarget};
use crate::duckdb_load::sql::render_value;
use crate::error::LoadError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoadSummary {
    pub rows_written: u64,
    /// Transactions committed; an empty whole load still commits its DDL.
    pub batches_committed: u64,
}

// A batch that failed part-way; always resolved into a rollback before the
// cause is returned
struct PartialBatchWrite {
    batch_index: u64,
    rows_in_batch: usize,
    cause: LoadError,
}

// Rolls back on drop unless committed
struct TransactionGuard<'p, P: PostgisProcessor + ?Sized> {
    processor: &'p mut P,
    open: bool,
}

impl<'p, P: PostgisProcessor + ?Sized> TransactionGuard<'p, P> {
    fn begin(processor: &'p mut P) -> Result<Self, LoadError> {
        processor.begin()?;
        Ok(Self {
            processor,
            open: true,
        })
    }

    fn execute(&mut self, statement: &str) -> Result<(), LoadError> {
        self.processor.execute(statement)
    }

    fn processor(&mut self) -> &mut P {
        self.processor
    }

    // Create, or drop and recreate, the target inside this transaction
    fn prepare(&mut self, target: &LoadTarget, options: &LoadOptions) -> Result<(), LoadError> {
        prepare_target(self.processor(), target, options.if_exists)
    }

    fn commit(mut self) -> Result<(), LoadError> {
        self.open = false;
        self.processor.commit()
    }

    fn rollback(mut self) {
        self.open = false;
        if let Err(e) = self.processor.rollback() {
            warn!(error = %e, "rollback failed");
        }
    }
}

impl<P: PostgisProcessor + ?Sized> Drop for TransactionGuard<'_, P> {
    fn drop(&mut self) {
        if self.open {
            warn!("transaction abandoned, rolling back");
            if let Err(e) = self.processor.rollback() {
                warn!(error = %e, "rollback of abandoned transaction failed");
            }
        }
    }
}

pub struct BulkLoader<'a, P: PostgisProcessor + ?Sized> {
    processor: &'a mut P,
    target: &'a LoadTarget,
    options: &'a LoadOptions,
}

impl<'a, P: PostgisProcessor + ?Sized> BulkLoader<'a, P> {
    pub fn new(processor: &'a mut P, target: &'a LoadTarget, options: &'a LoadOptions) -> Self {
        Self {
            processor,
            target,
            options,
        }
    }

    /// Prepare the target table and write every batch; the row count is only
    /// reported after the final commit succeeds.
    pub fn load<I>(&mut self, batches: I) -> Result<LoadSummary, LoadError>
    where
        I: IntoIterator<Item = Result<Vec<Feature>, LoadError>>,
    {
        match self.options.transaction_mode {
            TransactionMode::WholeLoad => self.load_whole(batches.into_iter()),
            TransactionMode::PerBatch => self.load_per_batch(batches.into_iter()),
        }
    }

    fn load_whole(
        &mut self,
        batches: impl Iterator<Item = Result<Vec<Feature>, LoadError>>,
    ) -> Result<LoadSummary, LoadError> {
        let target = self.target;
        let options = self.options;
        let mut tx = TransactionGuard::begin(&mut *self.processor)?;
        if let Err(e) = tx.prepare(target, options) {
            tx.rollback();
            return Err(e);
        }
        let mut rows_written: u64 = 0;

        for (batch_index, batch) in (0u64..).zip(batches) {
            match write_batch(&mut tx, target, options, batch_index, batch) {
                Ok(rows) => rows_written += rows as u64,
                Err(partial) => {
                    tx.rollback();
                    return Err(resolve(partial, 0, rows_written));
                }
            }
        }

        tx.commit()?;
        info!(
            table = %target.qualified_name(),
            rows_written,
            "load committed in a single transaction"
        );
        Ok(LoadSummary {
            rows_written,
            batches_committed: 1,
        })
    }

    fn load_per_batch(
        &mut self,
        batches: impl Iterator<Item = Result<Vec<Feature>, LoadError>>,
    ) -> Result<LoadSummary, LoadError> {
        let target = self.target;
        let options = self.options;
        let mut summary = LoadSummary::default();
        let mut prepared = false;

        for (batch_index, batch) in (0u64..).zip(batches) {
            let mut tx = TransactionGuard::begin(&mut *self.processor)
                .map_err(|e| e.with_rows_committed(summary.rows_written))?;
            if !prepared {
                if let Err(e) = tx.prepare(target, options) {
                    tx.rollback();
                    return Err(e);
                }
                prepared = true;
            }
            match write_batch(&mut tx, target, options, batch_index, batch) {
                Ok(rows) => {
                    tx.commit()
                        .map_err(|e| e.with_rows_committed(summary.rows_written))?;
                    summary.rows_written += rows as u64;
                    summary.batches_committed += 1;
                    debug!(batch_index, rows, "batch committed");
                }
                Err(partial) => {
                    tx.rollback();
                    return Err(resolve(partial, summary.rows_written, 0));
                }
            }
        }

        // A layer without features still gets its table
        if !prepared {
            let mut tx = TransactionGuard::begin(&mut *self.processor)?;
            if let Err(e) = tx.prepare(target, options) {
                tx.rollback();
                return Err(e);
            }
            tx.commit()?;
            summary.batches_committed += 1;
        }

        info!(
            table = %target.qualified_name(),
            rows_written = summary.rows_written,
            batches = summary.batches_committed,
            "load committed batch by batch"
        );
        Ok(summary)
    }
}

fn write_batch<P: PostgisProcessor + ?Sized>(
    tx: &mut TransactionGuard<'_, P>,
    target: &LoadTarget,
    options: &LoadOptions,
    batch_index: u64,
    batch: Result<Vec<Feature>, LoadError>,
) -> Result<usize, PartialBatchWrite> {
    let partial = |rows_in_batch: usize, cause: LoadError| PartialBatchWrite {
        batch_index,
        rows_in_batch,
        cause,
    };

    if options.is_cancelled() {
        return Err(partial(0, LoadError::Cancelled { rows_committed: 0 }));
    }

    let features = batch.map_err(|cause| partial(0, cause))?;
    if features.is_empty() {
        return Ok(0);
    }

    let statement = render_insert(target, &features).map_err(|cause| partial(features.len(), cause))?;
    tx.execute(&statement)
        .map_err(|cause| partial(features.len(), cause))?;
    Ok(features.len())
}

// Roll-back bookkeeping is done by the caller; this only shapes the error
fn resolve(partial: PartialBatchWrite, rows_committed: u64, rows_discarded: u64) -> LoadError {
    warn!(
        batch_index = partial.batch_index,
        rows_in_batch = partial.rows_in_batch,
        rows_discarded,
        rows_committed,
        error = %partial.cause,
        "batch failed, transaction rolled back"
    );
    partial.cause.with_rows_committed(rows_committed)
}

/// One multi-row `INSERT` for a batch.
pub fn render_insert(target: &LoadTarget, features: &[Feature]) -> Result<String, LoadError> {
    let columns = target.insert_columns();
    if columns.is_empty() {
        return Ok(features
            .iter()
            .map(|_| format!("INSERT INTO {} DEFAULT VALUES;", target.qualified_name()))
            .collect());
    }

    let mut rows = Vec::with_capacity(features.len());
    for (offset, feature) in features.iter().enumerate() {
        if feature.values.len() != target.columns.len() {
            return Err(LoadError::CorruptFile {
                location: format!("row {offset} of batch for {}", target.qualified_name()),
                reason: format!(
                    "{} values for {} columns",
                    feature.values.len(),
                    target.columns.len()
                ),
            });
        }

        let mut cells: Vec<String> = feature.values.iter().map(render_value).collect();
        if target.geometry.is_some() {
            cells.push(match &feature.geometry {
                Some(geometry) => {
                    let ewkb = translate(geometry).map_err(|e| {
                        e.into_load_error(format!(
                            "row {offset} of batch for {}",
                            target.qualified_name()
                        ))
                    })?;
                    format!("'{}'::geometry", hex::encode_upper(ewkb))
                }
                None => "NULL".to_string(),
            });
        }
        rows.push(format!("({})", cells.join(", ")));
    }

    Ok(format!(
        "INSERT INTO {} ({}) VALUES {};",
        target.qualified_name(),
        columns.join(", "),
        rows.join(", ")
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CancelHandle, IfExists};
    use crate::duckdb_load::format_reader::{SemanticType, Value};
    use crate::duckdb_load::geometry::{Coord, Dimension, Geometry, GeometryKind, Shape, Srid};
    use crate::duckdb_load::schema_mapper::{TargetColumn, TargetGeometry};
    use crate::duckdb_load::test_support::RecordingTarget;
    use crate::error::ErrorKind;

    fn target() -> LoadTarget {
        LoadTarget {
            schema_name: "add_schema".into(),
            table_name: "add_table".into(),
            columns: vec![TargetColumn {
                name: "name".into(),
                semantic_type: SemanticType::Text,
            }],
            geometry: Some(TargetGeometry {
                name: "geom".into(),
                kind: Some(GeometryKind::Point),
                dimension: Dimension::Xy,
                srid: Srid::Known(4326),
            }),
        }
    }

    fn feature(name: &str) -> Feature {
        Feature {
            values: vec![Value::Text(name.into())],
            geometry: Some(Geometry::new(
                Srid::Known(4326),
                Dimension::Xy,
                Shape::Point(Some(Coord::xy(1.0, 2.0))),
            )),
        }
    }

    fn batches(sizes: &[usize]) -> Vec<Result<Vec<Feature>, LoadError>> {
        sizes
            .iter()
            .map(|&n| Ok((0..n).map(|i| feature(&format!("f{i}"))).collect()))
            .collect()
    }

    #[test]
    fn renders_one_insert_per_batch() {
        let sql = render_insert(&target(), &[feature("a"), feature("O'Hare")]).unwrap();
        assert_eq!(
            sql,
            "INSERT INTO \"add_schema\".\"add_table\" (\"name\", \"geom\") VALUES \
             ('a', '0101000020E6100000000000000000F03F0000000000000040'::geometry), \
             ('O''Hare', '0101000020E6100000000000000000F03F0000000000000040'::geometry);"
        );
    }

    #[test]
    fn null_geometry_renders_null() {
        let mut f = feature("a");
        f.geometry = None;
        let sql = render_insert(&target(), &[f]).unwrap();
        assert!(sql.ends_with("VALUES ('a', NULL);"));
    }

    #[test]
    fn whole_load_commits_once() {
        let mut db = RecordingTarget::default();
        let options = LoadOptions::default();
        let target = target();
        let summary = BulkLoader::new(&mut db, &target, &options)
            .load(batches(&[3, 3, 1]))
            .unwrap();
        assert_eq!(summary.rows_written, 7);
        assert_eq!(db.committed_rows(), 7);
        assert_eq!(db.commits, 1);
        assert_eq!(db.inserts_executed, 3);
    }

    #[test]
    fn whole_load_failure_rolls_back_everything() {
        let mut db = RecordingTarget::default();
        let options = LoadOptions::default();
        let target = target();
        let mut input = batches(&[2, 2]);
        input.push(Err(LoadError::UnsupportedGeometryType {
            detail: "type code 17 at layer 'boundaries' feature 4".into(),
        }));
        let err = BulkLoader::new(&mut db, &target, &options)
            .load(input)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedGeometryType);
        assert_eq!(db.committed_rows(), 0);
        assert_eq!(db.rollbacks, 1);
    }

    #[test]
    fn per_batch_keeps_committed_batches() {
        let mut db = RecordingTarget::default();
        db.fail_insert_number = Some(3);
        let options = LoadOptions::default().with_transaction_mode(TransactionMode::PerBatch);
        let target = target();
        let err = BulkLoader::new(&mut db, &target, &options)
            .load(batches(&[2, 2, 2, 2]))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectionLost);
        assert_eq!(err.rows_committed(), 4);
        assert_eq!(db.committed_rows(), 4);
        assert_eq!(db.commits, 2);
        assert_eq!(db.rollbacks, 1);
    }

    #[test]
    fn cancellation_rolls_back() {
        let mut db = RecordingTarget::default();
        let cancel = CancelHandle::new();
        cancel.cancel();
        let options = LoadOptions::default().with_cancel(cancel);
        let target = target();
        let err = BulkLoader::new(&mut db, &target, &options)
            .load(batches(&[1]))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert_eq!(db.committed_rows(), 0);
        assert_eq!(db.rollbacks, 1);
    }

    #[test]
    fn empty_stream_still_creates_the_table() {
        for mode in [TransactionMode::WholeLoad, TransactionMode::PerBatch] {
            let mut db = RecordingTarget::default();
            let options = LoadOptions::default().with_transaction_mode(mode);
            let target = target();
            let summary = BulkLoader::new(&mut db, &target, &options)
                .load(Vec::new())
                .unwrap();
            assert_eq!(summary.rows_written, 0);
            assert_eq!(summary.batches_committed, 1);
            assert_eq!(db.commits, 1);
            assert!(db.statements.iter().any(|s| s.starts_with("CREATE TABLE")));
            assert!(db.outside_transaction.is_empty());
        }
    }

    #[test]
    fn failed_replace_leaves_the_old_table() {
        let mut db = RecordingTarget::default();
        let options = LoadOptions::default().with_if_exists(IfExists::Replace);
        let target = target();
        let mut input = batches(&[2]);
        input.push(Err(LoadError::UnsupportedGeometryType {
            detail: "Triangle at layer 'boundaries' feature 2".into(),
        }));

        let err = BulkLoader::new(&mut db, &target, &options)
            .load(input)
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::UnsupportedGeometryType);
        assert_eq!(db.statements[0], "BEGIN");
        assert!(db.statements.iter().any(|s| s.starts_with("DROP TABLE")));
        assert!(db.outside_transaction.is_empty());
        assert_eq!(db.statements.last().map(String::as_str), Some("ROLLBACK"));
        assert_eq!(db.commits, 0);
    }

    #[test]
    fn per_batch_runs_ddl_with_the_first_batch() {
        let mut db = RecordingTarget::default();
        db.fail_insert_number = Some(1);
        let options = LoadOptions::default()
            .with_transaction_mode(TransactionMode::PerBatch)
            .with_if_exists(IfExists::Replace);
        let target = target();

        let err = BulkLoader::new(&mut db, &target, &options)
            .load(batches(&[2, 2]))
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ConnectionLost);
        assert_eq!(err.rows_committed(), 0);
        assert_eq!(
            db.statements,
            vec![
                "BEGIN".to_string(),
                target.create_schema_sql(),
                target.drop_table_sql(),
                target.create_table_sql(),
                render_insert(&target, &[feature("f0"), feature("f1")]).unwrap(),
                "ROLLBACK".to_string(),
            ]
        );
    }

    #[test]
    fn arity_mismatch_is_a_row_encoding_failure() {
        let mut db = RecordingTarget::default();
        let options = LoadOptions::default();
        let target = target();
        let mut bad = feature("a");
        bad.values.push(Value::Integer(1));
        let err = BulkLoader::new(&mut db, &target, &options)
            .load(vec![Ok(vec![feature("ok")]), Ok(vec![bad])])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CorruptFile);
        assert_eq!(db.committed_rows(), 0);
    }
}
