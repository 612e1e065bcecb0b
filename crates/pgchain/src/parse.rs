//! Result parsing: raw adapter rows -> application values.
//!
//! The return type decides the produced shape; per-column decoders convert
//! driver values; batch parsers walk the paths recorded at select time into
//! nested JSON produced by sub-query projections, applying each nested
//! query's own return-type semantics recursively.

use crate::adapter::QueryOutput;
use crate::error::{ChainError, ChainResult};
use crate::state::{BatchParser, QueryKind, QueryState, ReturnType};
use serde_json::{Map, Value};

/// Printable description of the originating query, carried by NotFound
/// errors for diagnostics.
pub(crate) fn describe(state: &QueryState) -> String {
    let verb = match state.kind {
        QueryKind::Select => "select from",
        QueryKind::Insert => "insert into",
        QueryKind::Update => "update",
        QueryKind::Delete => "delete from",
    };
    format!("{verb} \"{}\"", state.schema.table)
}

/// Parse an adapter result according to the query's return type. Transforms
/// are not applied here; the pipeline runs them after the after-hooks.
pub(crate) fn parse_result(state: &QueryState, output: &QueryOutput) -> ChainResult<Value> {
    match state.return_type {
        ReturnType::All => {
            let mut rows = Vec::with_capacity(output.rows.len());
            for row in &output.rows {
                rows.push(Value::Object(parse_row(state, &output.fields, row)?));
            }
            Ok(Value::Array(rows))
        }
        ReturnType::One => match output.rows.first() {
            Some(row) => Ok(Value::Object(parse_row(state, &output.fields, row)?)),
            None => Ok(Value::Null),
        },
        ReturnType::OneOrThrow => match output.rows.first() {
            Some(row) => Ok(Value::Object(parse_row(state, &output.fields, row)?)),
            None => Err(ChainError::not_found(describe(state))),
        },
        ReturnType::Value => match output.rows.first().and_then(|r| r.first()) {
            Some(v) => parse_single_value(state, v.clone(), &output.fields),
            None => Ok(Value::Null),
        },
        ReturnType::ValueOrThrow => {
            let Some(value) = output.rows.first().and_then(|r| r.first()) else {
                return Err(ChainError::not_found(describe(state)));
            };
            // Zero matching rows and a found-but-NULL value are otherwise
            // indistinguishable for a non-nullable column.
            if value.is_null()
                && state.value_column.as_ref().map(|c| c.not_null).unwrap_or(false)
            {
                return Err(ChainError::not_found(describe(state)));
            }
            parse_single_value(state, value.clone(), &output.fields)
        }
        ReturnType::Rows => {
            let mut rows = Vec::with_capacity(output.rows.len());
            for row in &output.rows {
                let mut out = Vec::with_capacity(row.len());
                for (i, value) in row.iter().enumerate() {
                    out.push(parse_positional(state, i, value.clone(), &output.fields)?);
                }
                rows.push(Value::Array(out));
            }
            Ok(Value::Array(rows))
        }
        ReturnType::Pluck => {
            let mut out = Vec::with_capacity(output.rows.len());
            for row in &output.rows {
                let value = row.first().cloned().unwrap_or(Value::Null);
                out.push(parse_single_value(state, value, &output.fields)?);
            }
            Ok(Value::Array(out))
        }
        ReturnType::Void => Ok(Value::from(output.row_count)),
    }
}

/// Parse one row into an object: per-column decoders, then batch parsers.
pub(crate) fn parse_row(
    state: &QueryState,
    fields: &[String],
    row: &[Value],
) -> ChainResult<Map<String, Value>> {
    let mut object = Map::with_capacity(row.len());
    for (i, value) in row.iter().enumerate() {
        let Some(field) = fields.get(i) else {
            continue;
        };
        let parsed = match state.parser_for(field) {
            Some(decode) if !value.is_null() => decode(value.clone())
                .map_err(|e| ChainError::decode(field, e.to_string()))?,
            _ => value.clone(),
        };
        object.insert(field.clone(), parsed);
    }
    for batch in state.batch_parsers.iter() {
        let mut holder = Value::Object(object);
        apply_batch(batch, &mut holder)?;
        object = match holder {
            Value::Object(map) => map,
            _ => unreachable!("batch parsing preserves the row object"),
        };
    }
    Ok(object)
}

fn parse_single_value(state: &QueryState, value: Value, fields: &[String]) -> ChainResult<Value> {
    if value.is_null() {
        return Ok(Value::Null);
    }
    if let Some(col) = &state.value_column {
        if let Some(decode) = &col.decode {
            return decode(value).map_err(|e| ChainError::decode(&col.name, e.to_string()));
        }
        return Ok(value);
    }
    match fields.first().and_then(|f| state.parser_for(f)) {
        Some(decode) => {
            let field = fields.first().map(String::as_str).unwrap_or("");
            decode(value).map_err(|e| ChainError::decode(field, e.to_string()))
        }
        None => Ok(value),
    }
}

fn parse_positional(
    state: &QueryState,
    index: usize,
    value: Value,
    fields: &[String],
) -> ChainResult<Value> {
    if value.is_null() {
        return Ok(Value::Null);
    }
    match fields.get(index).and_then(|f| state.parser_for(f)) {
        Some(decode) => decode(value)
            .map_err(|e| ChainError::decode(&fields[index], e.to_string())),
        None => Ok(value),
    }
}

/// Walk a batch parser's path into the row and apply the nested projection's
/// semantics. A missing or null destination is left untouched: SQL already
/// encoded absence.
fn apply_batch(batch: &BatchParser, root: &mut Value) -> ChainResult<()> {
    let mut cursor = root;
    for key in &batch.path {
        match cursor.get_mut(key) {
            Some(next) => cursor = next,
            None => return Ok(()),
        }
    }
    if cursor.is_null() {
        return Ok(());
    }
    apply_nested(batch, cursor)
}

fn apply_nested(batch: &BatchParser, value: &mut Value) -> ChainResult<()> {
    match batch.return_type {
        ReturnType::All | ReturnType::Rows => {
            if let Value::Array(rows) = value {
                for row in rows {
                    apply_nested_object(batch, row)?;
                }
            }
            Ok(())
        }
        ReturnType::One | ReturnType::OneOrThrow => apply_nested_object(batch, value),
        ReturnType::Pluck => {
            if let Value::Array(items) = value {
                if let Some(decode) = &batch.value_parser {
                    for item in items {
                        if !item.is_null() {
                            let parsed = decode(std::mem::take(item))
                                .map_err(|e| ChainError::decode("pluck", e.to_string()))?;
                            *item = parsed;
                        }
                    }
                }
            }
            Ok(())
        }
        ReturnType::Value | ReturnType::ValueOrThrow | ReturnType::Void => {
            if !value.is_null() {
                if let Some(decode) = &batch.value_parser {
                    let parsed = decode(std::mem::take(value))
                        .map_err(|e| ChainError::decode("value", e.to_string()))?;
                    *value = parsed;
                }
            }
            Ok(())
        }
    }
}

fn apply_nested_object(batch: &BatchParser, value: &mut Value) -> ChainResult<()> {
    let Value::Object(object) = value else {
        return Ok(());
    };
    for (field, decode) in &batch.parsers {
        if let Some(slot) = object.get_mut(field) {
            if !slot.is_null() {
                let parsed = decode(std::mem::take(slot))
                    .map_err(|e| ChainError::decode(field, e.to_string()))?;
                *slot = parsed;
            }
        }
    }
    for nested in &batch.nested {
        apply_batch(nested, value)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnDef, TableSchema};
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn output(fields: &[&str], rows: Vec<Vec<Value>>) -> QueryOutput {
        QueryOutput {
            fields: fields.iter().map(|s| s.to_string()).collect(),
            row_count: rows.len() as u64,
            rows,
        }
    }

    fn users() -> TableSchema {
        TableSchema::new("users")
            .column(ColumnDef::new("id").primary_key())
            .column(
                ColumnDef::new("age")
                    .not_null()
                    .decode_with(|v| Ok(json!(v.as_i64().unwrap() + 1))),
            )
    }

    #[test]
    fn all_parses_each_column() {
        let state = QueryState::new(users());
        let out = output(&["id", "age"], vec![vec![json!(1), json!(9)], vec![json!(2), json!(19)]]);
        let parsed = parse_result(&state, &out).unwrap();
        assert_eq!(parsed, json!([{"id": 1, "age": 10}, {"id": 2, "age": 20}]));
    }

    #[test]
    fn one_or_throw_raises_on_empty() {
        let mut state = QueryState::new(users());
        state.return_type = ReturnType::OneOrThrow;
        let out = output(&["id"], vec![]);
        let err = parse_result(&state, &out).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn one_returns_null_marker_on_empty() {
        let mut state = QueryState::new(users());
        state.return_type = ReturnType::One;
        let out = output(&["id"], vec![]);
        assert_eq!(parse_result(&state, &out).unwrap(), Value::Null);
    }

    #[test]
    fn value_or_throw_rejects_null_for_not_null_column() {
        let mut state = QueryState::new(users());
        state.return_type = ReturnType::ValueOrThrow;
        state.value_column = state.schema.shape.get("age").cloned();
        let out = output(&["age"], vec![vec![Value::Null]]);
        assert!(parse_result(&state, &out).unwrap_err().is_not_found());

        let some = output(&["age"], vec![vec![json!(4)]]);
        assert_eq!(parse_result(&state, &some).unwrap(), json!(5));
    }

    #[test]
    fn pluck_parses_column_zero_of_every_row() {
        let mut state = QueryState::new(users());
        state.return_type = ReturnType::Pluck;
        state.value_column = state.schema.shape.get("age").cloned();
        let out = output(&["age"], vec![vec![json!(1)], vec![json!(2)]]);
        assert_eq!(parse_result(&state, &out).unwrap(), json!([2, 3]));
    }

    #[test]
    fn void_yields_row_count() {
        let mut state = QueryState::new(users());
        state.return_type = ReturnType::Void;
        let out = QueryOutput {
            fields: vec![],
            rows: vec![],
            row_count: 7,
        };
        assert_eq!(parse_result(&state, &out).unwrap(), json!(7));
    }

    #[test]
    fn batch_parser_walks_nested_objects() {
        let mut state = QueryState::new(users());
        let mut parsers: BTreeMap<String, crate::schema::DecodeFn> = BTreeMap::new();
        parsers.insert(
            "n".to_string(),
            Arc::new(|v: Value| Ok(json!(v.as_i64().unwrap() * 10))),
        );
        state.batch_parsers_mut().push(BatchParser {
            path: vec!["profile".to_string()],
            return_type: ReturnType::One,
            parsers,
            value_parser: None,
            nested: vec![],
        });
        let out = output(
            &["id", "profile"],
            vec![vec![json!(1), json!({"n": 3})]],
        );
        let parsed = parse_result(&state, &out).unwrap();
        assert_eq!(parsed, json!([{"id": 1, "profile": {"n": 30}}]));
    }

    #[test]
    fn nested_pluck_runs_pluck_parsing_on_embedded_array() {
        let mut state = QueryState::new(users());
        state.batch_parsers_mut().push(BatchParser {
            path: vec!["tags".to_string()],
            return_type: ReturnType::Pluck,
            parsers: BTreeMap::new(),
            value_parser: Some(Arc::new(|v: Value| {
                Ok(json!(format!("#{}", v.as_str().unwrap())))
            })),
            nested: vec![],
        });
        let out = output(
            &["id", "tags"],
            vec![vec![json!(1), json!(["a", "b"])]],
        );
        let parsed = parse_result(&state, &out).unwrap();
        assert_eq!(parsed, json!([{"id": 1, "tags": ["#a", "#b"]}]));
    }

    #[test]
    fn null_nested_structure_is_left_alone() {
        let mut state = QueryState::new(users());
        state.batch_parsers_mut().push(BatchParser {
            path: vec!["profile".to_string()],
            return_type: ReturnType::One,
            parsers: BTreeMap::new(),
            value_parser: None,
            nested: vec![],
        });
        let out = output(&["id", "profile"], vec![vec![json!(1), Value::Null]]);
        let parsed = parse_result(&state, &out).unwrap();
        assert_eq!(parsed, json!([{"id": 1, "profile": null}]));
    }
}
