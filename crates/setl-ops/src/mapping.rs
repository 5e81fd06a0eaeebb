//! Field-to-column mapping for the sink.
//!
//! The mapping is built once, before the pipeline starts. Every destination
//! column must be mapped to a source field, carry a database-side default, or
//! be nullable; anything else is a configuration error. Type compatibility
//! between schema types and destination column types is a closed matrix
//! checked at build time; per-record type violations at runtime dead-letter
//! the record.
//!
//! Defaulted and nullable unmapped columns are omitted from the insert column
//! list, so the database fills them itself.

use serde_json::{Map, Value};

use setl_core::definition::{ColumnType, SinkConfig};
use setl_core::error::StartupError;
use setl_core::schema::{Field, FieldType};

#[derive(Debug)]
pub struct SinkMapping {
    columns: Vec<MappedColumn>,
}

#[derive(Debug)]
struct MappedColumn {
    column: String,
    column_type: ColumnType,
    source_field: String,
    nullable: bool,
}

/// Per-record mapping failure; the record is dead-lettered and the batch
/// continues without it.
#[derive(Debug, thiserror::Error)]
#[error("column {column:?}: {message}")]
pub struct RowError {
    pub column: String,
    pub message: String,
}

impl SinkMapping {
    pub fn build(sink: &SinkConfig, fields: &[Field]) -> Result<Self, StartupError> {
        let mut columns = Vec::new();
        let mut problems = Vec::new();

        for mapping in &sink.mapping {
            match &mapping.source_field {
                Some(source_field) => {
                    match fields.iter().find(|f| &f.name == source_field) {
                        None => problems.push(format!(
                            "column {:?} maps unknown field {source_field:?}",
                            mapping.column
                        )),
                        Some(field) => {
                            if !compatible(field.field_type, mapping.column_type) {
                                problems.push(format!(
                                    "column {:?} of type {:?} cannot accept field {:?} of type {}",
                                    mapping.column,
                                    mapping.column_type,
                                    field.name,
                                    field.field_type
                                ));
                            } else {
                                columns.push(MappedColumn {
                                    column: mapping.column.clone(),
                                    column_type: mapping.column_type,
                                    source_field: source_field.clone(),
                                    nullable: mapping.nullable,
                                });
                            }
                        }
                    }
                }
                // Unmapped columns stay out of the insert; the database
                // applies the default or NULL.
                None if mapping.has_default || mapping.nullable => {}
                None => problems.push(format!(
                    "column {:?} is not mapped, not nullable, and has no default",
                    mapping.column
                )),
            }
        }

        if columns.is_empty() {
            problems.push("no column is mapped to a source field".to_string());
        }
        if problems.is_empty() {
            Ok(Self { columns })
        } else {
            Err(StartupError(problems.join("; ")))
        }
    }

    /// Column names of the fixed insert set, in mapping order.
    pub fn insert_columns(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.column.clone()).collect()
    }

    /// Map one record to a row of the insert column set.
    pub fn row_for(&self, record: &Map<String, Value>) -> Result<Vec<Value>, RowError> {
        let mut row = Vec::with_capacity(self.columns.len());
        for column in &self.columns {
            let value = record.get(&column.source_field).cloned().unwrap_or(Value::Null);
            if value.is_null() {
                if column.nullable {
                    row.push(Value::Null);
                    continue;
                }
                return Err(RowError {
                    column: column.column.clone(),
                    message: format!(
                        "field {:?} is missing and the column is not nullable",
                        column.source_field
                    ),
                });
            }
            if !runtime_accepts(column.column_type, &value) {
                return Err(RowError {
                    column: column.column.clone(),
                    message: format!("value {value} does not fit {:?}", column.column_type),
                });
            }
            row.push(value);
        }
        Ok(row)
    }
}

/// Closed compatibility matrix: schema primitive -> accepted destination
/// types.
fn compatible(field: FieldType, column: ColumnType) -> bool {
    use ColumnType as C;
    use FieldType as F;
    match field {
        F::String | F::Bytes => {
            matches!(column, C::String | C::Json | C::Datetime)
        }
        F::Bool => matches!(column, C::Bool | C::String),
        F::Int8 => matches!(column, C::Int8 | C::Int16 | C::Int32 | C::Int64),
        F::Int16 => matches!(column, C::Int16 | C::Int32 | C::Int64),
        F::Int32 => matches!(column, C::Int32 | C::Int64),
        F::Int | F::Int64 => matches!(column, C::Int64 | C::Datetime),
        F::Uint8 => matches!(column, C::Uint8 | C::Uint16 | C::Uint32 | C::Uint64 | C::Int16 | C::Int32 | C::Int64),
        F::Uint16 => matches!(column, C::Uint16 | C::Uint32 | C::Uint64 | C::Int32 | C::Int64),
        F::Uint32 => matches!(column, C::Uint32 | C::Uint64 | C::Int64),
        F::Uint | F::Uint64 => matches!(column, C::Uint64 | C::Datetime),
        F::Float32 => matches!(column, C::Float32 | C::Float64),
        F::Float | F::Float64 => matches!(column, C::Float64),
        F::Array | F::Map => matches!(column, C::Json),
    }
}

/// Runtime check of one JSON value against the destination column type.
fn runtime_accepts(column: ColumnType, value: &Value) -> bool {
    use ColumnType as C;
    match column {
        C::String => value.is_string() || value.is_boolean(),
        C::Bool => value.is_boolean(),
        C::Int8 | C::Int16 | C::Int32 | C::Int64 => value.as_i64().is_some(),
        C::Uint8 | C::Uint16 | C::Uint32 | C::Uint64 => value.as_u64().is_some(),
        C::Float32 | C::Float64 => value.is_number(),
        C::Datetime => value.is_string() || value.as_i64().is_some() || value.as_u64().is_some(),
        C::Json => true,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use setl_core::definition::ColumnMapping;

    use super::*;

    fn sink(mapping: Vec<ColumnMapping>) -> SinkConfig {
        SinkConfig {
            sink_type: "clickhouse".into(),
            source_id: "orders".into(),
            table: "orders".into(),
            max_batch_size: 10,
            max_batch_age: std::time::Duration::from_secs(1),
            max_attempts: 3,
            mapping,
        }
    }

    fn mapped(column: &str, column_type: ColumnType, field: &str) -> ColumnMapping {
        ColumnMapping {
            column: column.into(),
            column_type,
            source_field: Some(field.into()),
            nullable: false,
            has_default: false,
        }
    }

    fn fields() -> Vec<Field> {
        vec![
            Field::new("id", FieldType::Int64),
            Field::new("name", FieldType::String),
            Field::new("score", FieldType::Float64),
        ]
    }

    #[test]
    fn builds_for_compatible_mapping() {
        let sink = sink(vec![
            mapped("id", ColumnType::Int64, "id"),
            mapped("name", ColumnType::String, "name"),
            ColumnMapping {
                column: "inserted_at".into(),
                column_type: ColumnType::Datetime,
                source_field: None,
                nullable: false,
                has_default: true,
            },
        ]);
        let mapping = SinkMapping::build(&sink, &fields()).unwrap();
        // The defaulted column is left to the database.
        assert_eq!(mapping.insert_columns(), vec!["id".to_string(), "name".to_string()]);
    }

    #[test]
    fn unmapped_required_column_is_rejected() {
        let sink = sink(vec![ColumnMapping {
            column: "id".into(),
            column_type: ColumnType::Int64,
            source_field: None,
            nullable: false,
            has_default: false,
        }]);
        let err = SinkMapping::build(&sink, &fields()).unwrap_err();
        assert!(err.0.contains("not mapped"));
    }

    #[test]
    fn matrix_violation_is_rejected() {
        let sink = sink(vec![mapped("id", ColumnType::Int32, "id")]);
        let err = SinkMapping::build(&sink, &fields()).unwrap_err();
        assert!(err.0.contains("cannot accept"));
    }

    #[test]
    fn unknown_field_is_rejected() {
        let sink = sink(vec![mapped("id", ColumnType::Int64, "missing")]);
        let err = SinkMapping::build(&sink, &fields()).unwrap_err();
        assert!(err.0.contains("unknown field"));
    }

    #[test]
    fn row_mapping_and_runtime_type_errors() {
        let sink = sink(vec![
            mapped("id", ColumnType::Int64, "id"),
            mapped("name", ColumnType::String, "name"),
        ]);
        let mapping = SinkMapping::build(&sink, &fields()).unwrap();

        let good = json!({"id": 7, "name": "x"}).as_object().unwrap().clone();
        assert_eq!(mapping.row_for(&good).unwrap(), vec![json!(7), json!("x")]);

        // Fractional number into an integer column.
        let bad = json!({"id": 7.5, "name": "x"}).as_object().unwrap().clone();
        let err = mapping.row_for(&bad).unwrap_err();
        assert_eq!(err.column, "id");

        // Missing non-nullable field.
        let missing = json!({"name": "x"}).as_object().unwrap().clone();
        assert!(mapping.row_for(&missing).is_err());
    }

    #[test]
    fn nullable_mapped_column_accepts_missing_field() {
        let sink = sink(vec![
            mapped("id", ColumnType::Int64, "id"),
            ColumnMapping {
                column: "score".into(),
                column_type: ColumnType::Float64,
                source_field: Some("score".into()),
                nullable: true,
                has_default: false,
            },
        ]);
        let mapping = SinkMapping::build(&sink, &fields()).unwrap();
        let record = json!({"id": 1}).as_object().unwrap().clone();
        assert_eq!(mapping.row_for(&record).unwrap(), vec![json!(1), Value::Null]);
    }
}
