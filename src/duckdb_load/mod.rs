pub mod bulk_loader;
pub mod core_processor;
pub mod format_reader;
pub mod geometry;
pub mod postgis_processor;
pub mod schema_mapper;
pub mod source_strategy;
pub mod sql;

#[cfg(test)]
mod test_support;
