//! JSON row representation shared by the backends

use crate::error::Result;
use arrow::json::{ArrayWriter, LineDelimitedWriter};
use arrow_array::RecordBatch;
use serde_json::{Map, Value};

/// One result row, keyed by column name. NULL columns may be absent.
pub type Row = Map<String, Value>;

/// Convert record batches to JSON objects, one per row
pub fn batches_to_rows(batches: &[RecordBatch]) -> Result<Vec<Row>> {
    let batches: Vec<&RecordBatch> = batches.iter().filter(|b| b.num_rows() > 0).collect();
    if batches.is_empty() {
        return Ok(Vec::new());
    }

    let mut writer = ArrayWriter::new(Vec::new());
    writer.write_batches(&batches)?;
    writer.finish()?;
    let buf = writer.into_inner();

    Ok(serde_json::from_slice(&buf)?)
}

/// Encode record batches as newline-delimited JSON, one object per row
pub fn batches_to_ndjson(batches: &[RecordBatch]) -> Result<Vec<u8>> {
    let batches: Vec<&RecordBatch> = batches.iter().filter(|b| b.num_rows() > 0).collect();
    let mut writer = LineDelimitedWriter::new(Vec::new());
    writer.write_batches(&batches)?;
    writer.finish()?;
    Ok(writer.into_inner())
}

/// Read an unsigned integer cell, accepting numbers and numeric strings
pub fn cell_as_u64(row: &Row, column: &str) -> Option<u64> {
    match row.get(column)? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Read a floating point cell, accepting numbers and numeric strings
pub fn cell_as_f64(row: &Row, column: &str) -> Option<f64> {
    match row.get(column)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

pub fn cell_as_str<'a>(row: &'a Row, column: &str) -> Option<&'a str> {
    row.get(column)?.as_str()
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow_array::{Float64Array, Int64Array, StringArray};
    use arrow_schema::{DataType, Field, Schema};
    use std::sync::Arc;

    #[test]
    fn test_batches_to_rows() {
        let schema = Arc::new(Schema::new(vec![
            Field::new("department", DataType::Utf8, true),
            Field::new("employee_count", DataType::Int64, false),
            Field::new("avg_salary", DataType::Float64, true),
        ]));
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(StringArray::from(vec![Some("Engineering"), None])),
                Arc::new(Int64Array::from(vec![2, 1])),
                Arc::new(Float64Array::from(vec![90000.0, 60000.5])),
            ],
        )
        .expect("batch");

        let rows = batches_to_rows(&[batch]).expect("rows");
        assert_eq!(rows.len(), 2);
        assert_eq!(cell_as_str(&rows[0], "department"), Some("Engineering"));
        assert_eq!(cell_as_u64(&rows[0], "employee_count"), Some(2));
        assert_eq!(cell_as_f64(&rows[1], "avg_salary"), Some(60000.5));
        assert_eq!(cell_as_str(&rows[1], "department"), None);
    }

    #[test]
    fn test_empty_input() {
        assert!(batches_to_rows(&[]).expect("rows").is_empty());
        assert!(batches_to_ndjson(&[]).expect("ndjson").is_empty());
    }

    #[test]
    fn test_batches_to_ndjson_omits_nulls() {
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("name", DataType::Utf8, true),
        ]));
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(vec![1, 2])),
                Arc::new(StringArray::from(vec![Some("Alice"), None])),
            ],
        )
        .expect("batch");

        let text = String::from_utf8(batches_to_ndjson(&[batch]).expect("ndjson")).expect("utf8");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines, vec![r#"{"id":1,"name":"Alice"}"#, r#"{"id":2}"#]);
    }

    #[test]
    fn test_string_cells() {
        let mut row = Row::new();
        row.insert("n".into(), Value::String("42".into()));
        assert_eq!(cell_as_u64(&row, "n"), Some(42));
        assert_eq!(cell_as_f64(&row, "n"), Some(42.0));
        assert_eq!(cell_as_u64(&row, "missing"), None);
    }
}
