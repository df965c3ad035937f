// SQL text helpers shared by the reader, the schema mapper and the loader.
// Everything that ends up inside a statement string goes through here.

use lexical_core::FormattedSize;

use crate::duckdb_load::format_reader::Value;

// "name" with embedded quotes doubled
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

// 'text' with embedded quotes doubled
pub fn quote_literal(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

pub fn qualified_table(schema_name: &str, table_name: &str) -> String {
    format!("{}.{}", quote_ident(schema_name), quote_ident(table_name))
}

// Shortest representation that parses back to the same f64
pub fn format_float(value: f64) -> String {
    if value.is_nan() {
        return "'NaN'::double precision".to_string();
    }
    if value.is_infinite() {
        let sign = if value > 0.0 { "" } else { "-" };
        return format!("'{sign}Infinity'::double precision");
    }
    let mut buffer = [0u8; f64::FORMATTED_SIZE_DECIMAL];
    let digits = lexical_core::write(value, &mut buffer);
    // lexical only emits ASCII digits, sign, '.', and 'e'
    String::from_utf8_lossy(digits).into_owned()
}

pub fn format_integer(value: i64) -> String {
    let mut buffer = [0u8; i64::FORMATTED_SIZE_DECIMAL];
    let digits = lexical_core::write(value, &mut buffer);
    String::from_utf8_lossy(digits).into_owned()
}

// Attribute value as a PostgreSQL literal
pub fn render_value(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Text(text) => quote_literal(text),
        Value::Integer(n) => format_integer(*n),
        Value::Float(f) => format_float(*f),
        Value::Boolean(true) => "TRUE".to_string(),
        Value::Boolean(false) => "FALSE".to_string(),
    }
}

// Wrap a statement so DuckDB forwards it verbatim to the attached database
pub fn postgres_execute(alias: &str, statement: &str) -> String {
    format!(
        "CALL postgres_execute({}, {});",
        quote_literal(alias),
        quote_literal(statement)
    )
}

pub fn postgres_query(alias: &str, statement: &str) -> String {
    format!(
        "SELECT * FROM postgres_query({}, {});",
        quote_literal(alias),
        quote_literal(statement)
    )
}
