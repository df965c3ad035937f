use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::LoadError;

pub const DEFAULT_BATCH_SIZE: usize = 1000;
pub const BATCH_SIZE_ENV: &str = "DUCKDB_POSTGIS_BATCH_SIZE";
pub const TRANSACTION_MODE_ENV: &str = "DUCKDB_POSTGIS_TRANSACTION_MODE";

// How batches map onto destination transactions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionMode {
    /// One transaction for the whole load: all rows or none.
    #[default]
    WholeLoad,
    /// Commit after every batch: a failure keeps the batches already committed.
    PerBatch,
}

impl FromStr for TransactionMode {
    type Err = LoadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "whole-load" | "whole" => Ok(TransactionMode::WholeLoad),
            "per-batch" | "batch" => Ok(TransactionMode::PerBatch),
            other => Err(LoadError::InvalidOptions {
                reason: format!("unknown transaction mode '{other}'"),
            }),
        }
    }
}

// What to do when the destination table already exists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IfExists {
    /// Keep the table and its rows; a re-run appends the same rows again.
    #[default]
    Append,
    /// Drop the table and recreate it from the layer schema.
    Replace,
}

impl FromStr for IfExists {
    type Err = LoadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "append" => Ok(IfExists::Append),
            "replace" => Ok(IfExists::Replace),
            other => Err(LoadError::InvalidOptions {
                reason: format!("unknown if-exists policy '{other}'"),
            }),
        }
    }
}

/// Cooperative cancellation flag shared between a caller and a running load.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Per-call knobs for `process_file_with`.
#[derive(Debug, Clone)]
pub struct LoadOptions {
    pub layer: Option<String>,
    pub batch_size: usize,
    pub transaction_mode: TransactionMode,
    pub if_exists: IfExists,
    pub target_srid: Option<i32>,
    pub cancel: Option<CancelHandle>,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            layer: None,
            batch_size: DEFAULT_BATCH_SIZE,
            transaction_mode: TransactionMode::default(),
            if_exists: IfExists::default(),
            target_srid: None,
            cancel: None,
        }
    }
}

impl LoadOptions {
    /// Defaults, overridden by `DUCKDB_POSTGIS_BATCH_SIZE` and
    /// `DUCKDB_POSTGIS_TRANSACTION_MODE` where set. `process_file` starts here.
    pub fn from_env() -> Result<Self, LoadError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, LoadError> {
        let mut options = Self::default();
        if let Some(raw) = lookup(BATCH_SIZE_ENV) {
            options.batch_size = raw.trim().parse().map_err(|_| LoadError::InvalidOptions {
                reason: format!("{BATCH_SIZE_ENV}='{raw}' is not a positive integer"),
            })?;
        }
        if let Some(raw) = lookup(TRANSACTION_MODE_ENV) {
            options.transaction_mode = raw.parse()?;
        }
        options.validate()?;
        Ok(options)
    }

    pub fn with_layer(mut self, layer: impl Into<String>) -> Self {
        self.layer = Some(layer.into());
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_transaction_mode(mut self, mode: TransactionMode) -> Self {
        self.transaction_mode = mode;
        self
    }

    pub fn with_if_exists(mut self, if_exists: IfExists) -> Self {
        self.if_exists = if_exists;
        self
    }

    pub fn with_target_srid(mut self, srid: i32) -> Self {
        self.target_srid = Some(srid);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelHandle) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn validate(&self) -> Result<(), LoadError> {
        if self.batch_size == 0 {
            return Err(LoadError::InvalidOptions {
                reason: "batch size must be greater than zero".into(),
            });
        }
        if let Some(srid) = self.target_srid {
            if srid <= 0 {
                return Err(LoadError::InvalidOptions {
                    reason: format!("target SRID {srid} is not a valid EPSG code"),
                });
            }
        }
        Ok(())
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancelHandle::is_cancelled)
    }
}
