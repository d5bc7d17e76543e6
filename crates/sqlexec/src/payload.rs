//! Encoding of background query results for the result store.
//!
//! Two formats are supported. JSON documents with ISO-8601 dates, and an
//! Arrow envelope holding a JSON header followed by one IPC stream per
//! statement with rows:
//!
//! ```text
//! | "ARW1" | header len (u32 BE) | header json | (frame len (u32 BE) | ipc stream)* |
//! ```
use std::io::Cursor as IoCursor;
use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, AsArray, BooleanBuilder, Date32Builder, Float64Builder, Int64Builder,
    StringBuilder, TimestampMicrosecondBuilder,
};
use arrow::datatypes::{
    DataType, Date32Type, Field, Float64Type, Int64Type, Schema, TimeUnit, TimestampMicrosecondType,
};
use arrow::ipc::reader::StreamReader;
use arrow::ipc::writer::StreamWriter;
use arrow::record_batch::{RecordBatch, RecordBatchOptions};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{ExecError, Result};
use crate::query::QueryId;
use crate::result::{
    Column, ColumnType, QueryResult, QueryStatus, ResultSet, Row, ScalarValue, StatementResult,
};

const ARROW_MAGIC: &[u8; 4] = b"ARW1";
const UTC: &str = "UTC";

#[derive(Debug, Serialize, Deserialize)]
struct Payload<S> {
    query_id: Option<QueryId>,
    status: QueryStatus,
    statements: Vec<S>,
    total_execution_time_ms: f64,
}

#[derive(Debug, Serialize, Deserialize)]
struct JsonStatement {
    original_sql: String,
    executed_sql: String,
    columns: Vec<Column>,
    /// `None` for statements that don't return rows.
    data: Option<Vec<Vec<Value>>>,
    row_count: u64,
    execution_time_ms: f64,
}

#[derive(Debug, Serialize, Deserialize)]
struct ArrowStatement {
    original_sql: String,
    executed_sql: String,
    columns: Vec<Column>,
    /// An IPC frame follows for this statement.
    has_data: bool,
    row_count: u64,
    execution_time_ms: f64,
}

/// Serialize a result, as Arrow IPC when `use_arrow` is set and JSON
/// otherwise.
pub fn encode(result: &QueryResult, use_arrow: bool) -> Result<Bytes> {
    if use_arrow {
        encode_arrow(result)
    } else {
        encode_json(result)
    }
}

/// Deserialize a result written by [`encode`], detecting the format.
pub fn decode(data: &[u8]) -> Result<QueryResult> {
    match data.strip_prefix(ARROW_MAGIC.as_slice()) {
        Some(rest) => decode_arrow(rest),
        None => decode_json(data),
    }
}

fn columns_of(stmt: &StatementResult) -> Vec<Column> {
    stmt.data
        .as_ref()
        .map(|data| data.columns.clone())
        .unwrap_or_default()
}

fn to_result<S>(payload: Payload<S>, statements: Vec<StatementResult>) -> QueryResult {
    QueryResult {
        status: payload.status,
        statements,
        query_id: payload.query_id,
        total_execution_time_ms: payload.total_execution_time_ms,
        error_message: None,
        is_cached: false,
    }
}

fn encode_json(result: &QueryResult) -> Result<Bytes> {
    let statements = result
        .statements
        .iter()
        .map(|stmt| JsonStatement {
            original_sql: stmt.original_sql.clone(),
            executed_sql: stmt.executed_sql.clone(),
            columns: columns_of(stmt),
            data: stmt
                .data
                .as_ref()
                .map(|data| data.rows.iter().map(|row| row.iter().map(json_value).collect()).collect()),
            row_count: stmt.row_count,
            execution_time_ms: stmt.execution_time_ms,
        })
        .collect();

    let payload = Payload {
        query_id: result.query_id,
        status: result.status,
        statements,
        total_execution_time_ms: result.total_execution_time_ms,
    };
    Ok(Bytes::from(serde_json::to_vec(&payload)?))
}

fn json_value(value: &ScalarValue) -> Value {
    match value {
        ScalarValue::Null => Value::Null,
        ScalarValue::Boolean(v) => Value::Bool(*v),
        ScalarValue::Int64(v) => Value::from(*v),
        ScalarValue::Float64(v) => Value::from(*v),
        ScalarValue::Utf8(v) => Value::String(v.clone()),
        ScalarValue::Date(v) => Value::String(v.format("%Y-%m-%d").to_string()),
        ScalarValue::Timestamp(v) => Value::String(v.to_rfc3339()),
    }
}

fn scalar_from_json(value: &Value, column: &Column) -> Result<ScalarValue> {
    let invalid = || {
        ExecError::ResultsBackend(format!(
            "invalid value {value} for column '{}' of type {:?}",
            column.name, column.column_type
        ))
    };
    if value.is_null() {
        return Ok(ScalarValue::Null);
    }
    Ok(match column.column_type {
        ColumnType::Boolean => ScalarValue::Boolean(value.as_bool().ok_or_else(invalid)?),
        ColumnType::Int64 => ScalarValue::Int64(value.as_i64().ok_or_else(invalid)?),
        ColumnType::Float64 => ScalarValue::Float64(value.as_f64().ok_or_else(invalid)?),
        ColumnType::Utf8 => ScalarValue::Utf8(value.as_str().ok_or_else(invalid)?.to_string()),
        ColumnType::Date => {
            let text = value.as_str().ok_or_else(invalid)?;
            ScalarValue::Date(NaiveDate::parse_from_str(text, "%Y-%m-%d").map_err(|_| invalid())?)
        }
        ColumnType::Timestamp => {
            let text = value.as_str().ok_or_else(invalid)?;
            let ts = DateTime::parse_from_rfc3339(text).map_err(|_| invalid())?;
            ScalarValue::Timestamp(ts.with_timezone(&Utc))
        }
    })
}

fn decode_json(data: &[u8]) -> Result<QueryResult> {
    let mut payload: Payload<JsonStatement> = serde_json::from_slice(data)?;
    let mut statements = Vec::with_capacity(payload.statements.len());
    for stmt in std::mem::take(&mut payload.statements) {
        let data = match stmt.data {
            Some(rows) => {
                let rows = rows
                    .iter()
                    .map(|row| {
                        if row.len() != stmt.columns.len() {
                            return Err(ExecError::ResultsBackend(format!(
                                "row has {} values, expected {}",
                                row.len(),
                                stmt.columns.len()
                            )));
                        }
                        row.iter()
                            .zip(&stmt.columns)
                            .map(|(value, column)| scalar_from_json(value, column))
                            .collect::<Result<Row>>()
                    })
                    .collect::<Result<Vec<_>>>()?;
                Some(ResultSet::new(stmt.columns, rows))
            }
            None => None,
        };
        statements.push(StatementResult {
            original_sql: stmt.original_sql,
            executed_sql: stmt.executed_sql,
            data,
            row_count: stmt.row_count,
            execution_time_ms: stmt.execution_time_ms,
        });
    }
    Ok(to_result(payload, statements))
}

fn arrow_type(column_type: ColumnType) -> DataType {
    match column_type {
        ColumnType::Boolean => DataType::Boolean,
        ColumnType::Int64 => DataType::Int64,
        ColumnType::Float64 => DataType::Float64,
        ColumnType::Utf8 => DataType::Utf8,
        ColumnType::Date => DataType::Date32,
        ColumnType::Timestamp => DataType::Timestamp(TimeUnit::Microsecond, Some(UTC.into())),
    }
}

fn mismatch(column: &Column, value: &ScalarValue) -> ExecError {
    ExecError::ResultsBackend(format!(
        "value {value:?} doesn't match column '{}' of type {:?}",
        column.name, column.column_type
    ))
}

/// Build an array from one column of the rows.
fn build_array(rows: &[Row], idx: usize, column: &Column) -> Result<ArrayRef> {
    macro_rules! build {
        ($builder:expr, $variant:ident, $convert:expr) => {{
            let mut builder = $builder;
            for row in rows {
                match row.get(idx) {
                    None | Some(ScalarValue::Null) => builder.append_null(),
                    Some(ScalarValue::$variant(v)) => builder.append_value($convert(v)),
                    Some(other) => return Err(mismatch(column, other)),
                }
            }
            Arc::new(builder.finish()) as ArrayRef
        }};
    }

    Ok(match column.column_type {
        ColumnType::Boolean => build!(BooleanBuilder::new(), Boolean, |v: &bool| *v),
        ColumnType::Int64 => build!(Int64Builder::new(), Int64, |v: &i64| *v),
        ColumnType::Float64 => build!(Float64Builder::new(), Float64, |v: &f64| *v),
        ColumnType::Utf8 => build!(StringBuilder::new(), Utf8, |v: &String| v.clone()),
        ColumnType::Date => build!(Date32Builder::new(), Date, |v: &NaiveDate| {
            Date32Type::from_naive_date(*v)
        }),
        ColumnType::Timestamp => build!(
            TimestampMicrosecondBuilder::new().with_timezone(UTC),
            Timestamp,
            |v: &DateTime<Utc>| v.timestamp_micros()
        ),
    })
}

fn encode_batch(data: &ResultSet) -> Result<Vec<u8>> {
    let fields: Vec<Field> = data
        .columns
        .iter()
        .map(|c| Field::new(&c.name, arrow_type(c.column_type), true))
        .collect();
    let schema = Arc::new(Schema::new(fields));

    let arrays = data
        .columns
        .iter()
        .enumerate()
        .map(|(idx, column)| build_array(&data.rows, idx, column))
        .collect::<Result<Vec<_>>>()?;
    let options = RecordBatchOptions::new().with_row_count(Some(data.rows.len()));
    let batch = RecordBatch::try_new_with_options(schema.clone(), arrays, &options)?;

    let mut buf = Vec::new();
    let mut writer = StreamWriter::try_new(&mut buf, &schema)?;
    writer.write(&batch)?;
    writer.finish()?;
    drop(writer);
    Ok(buf)
}

fn encode_arrow(result: &QueryResult) -> Result<Bytes> {
    let mut frames = Vec::new();
    let statements: Vec<ArrowStatement> = result
        .statements
        .iter()
        .map(|stmt| {
            if let Some(data) = &stmt.data {
                frames.push(encode_batch(data)?);
            }
            Ok(ArrowStatement {
                original_sql: stmt.original_sql.clone(),
                executed_sql: stmt.executed_sql.clone(),
                columns: columns_of(stmt),
                has_data: stmt.data.is_some(),
                row_count: stmt.row_count,
                execution_time_ms: stmt.execution_time_ms,
            })
        })
        .collect::<Result<_>>()?;

    let header = serde_json::to_vec(&Payload {
        query_id: result.query_id,
        status: result.status,
        statements,
        total_execution_time_ms: result.total_execution_time_ms,
    })?;

    let mut buf = BytesMut::new();
    buf.put_slice(ARROW_MAGIC);
    buf.put_u32(header.len() as u32);
    buf.put_slice(&header);
    for frame in frames {
        buf.put_u32(frame.len() as u32);
        buf.put_slice(&frame);
    }
    Ok(buf.freeze())
}

fn take_frame<'a>(buf: &mut &'a [u8]) -> Result<&'a [u8]> {
    if buf.remaining() < 4 {
        return Err(ExecError::ResultsBackend("truncated arrow payload".to_string()));
    }
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return Err(ExecError::ResultsBackend("truncated arrow payload".to_string()));
    }
    let data: &'a [u8] = buf;
    let (frame, rest) = data.split_at(len);
    *buf = rest;
    Ok(frame)
}

fn scalar_at(array: &ArrayRef, idx: usize, column: &Column) -> ScalarValue {
    if array.is_null(idx) {
        return ScalarValue::Null;
    }
    match column.column_type {
        ColumnType::Boolean => ScalarValue::Boolean(array.as_boolean().value(idx)),
        ColumnType::Int64 => ScalarValue::Int64(array.as_primitive::<Int64Type>().value(idx)),
        ColumnType::Float64 => ScalarValue::Float64(array.as_primitive::<Float64Type>().value(idx)),
        ColumnType::Utf8 => ScalarValue::Utf8(array.as_string::<i32>().value(idx).to_string()),
        ColumnType::Date => {
            ScalarValue::Date(Date32Type::to_naive_date(array.as_primitive::<Date32Type>().value(idx)))
        }
        ColumnType::Timestamp => {
            let micros = array.as_primitive::<TimestampMicrosecondType>().value(idx);
            DateTime::from_timestamp_micros(micros)
                .map(ScalarValue::Timestamp)
                .unwrap_or(ScalarValue::Null)
        }
    }
}

fn decode_batches(frame: &[u8], columns: &[Column]) -> Result<Vec<Row>> {
    let reader = StreamReader::try_new(IoCursor::new(frame), None)?;
    let mut rows = Vec::new();
    for batch in reader {
        let batch = batch?;
        if batch.num_columns() != columns.len() {
            return Err(ExecError::ResultsBackend(format!(
                "batch has {} columns, expected {}",
                batch.num_columns(),
                columns.len()
            )));
        }
        for idx in 0..batch.num_rows() {
            rows.push(
                batch
                    .columns()
                    .iter()
                    .zip(columns)
                    .map(|(array, column)| scalar_at(array, idx, column))
                    .collect(),
            );
        }
    }
    Ok(rows)
}

fn decode_arrow(data: &[u8]) -> Result<QueryResult> {
    let mut buf = data;
    let header = take_frame(&mut buf)?;
    let mut payload: Payload<ArrowStatement> = serde_json::from_slice(header)?;

    let mut statements = Vec::with_capacity(payload.statements.len());
    for stmt in std::mem::take(&mut payload.statements) {
        let data = if stmt.has_data {
            let frame = take_frame(&mut buf)?;
            let rows = decode_batches(frame, &stmt.columns)?;
            Some(ResultSet::new(stmt.columns, rows))
        } else {
            None
        };
        statements.push(StatementResult {
            original_sql: stmt.original_sql,
            executed_sql: stmt.executed_sql,
            data,
            row_count: stmt.row_count,
            execution_time_ms: stmt.execution_time_ms,
        });
    }
    Ok(to_result(payload, statements))
}
