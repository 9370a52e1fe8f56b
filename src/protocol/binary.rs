//! Binary attachment deconstruction and reconstruction.
//!
//! Encoding a binary-typed packet walks its payload tree, replaces every
//! binary leaf with a placeholder marker `{"_placeholder":true,"num":n}` and
//! collects the raw buffers in placeholder index order. Decoding reverses
//! this exactly, substituting buffer `n` for each placeholder found in a
//! tree walk over arrays and plain objects.

use bytes::Bytes;
use serde_json::{Map, Value};

use crate::error::{ProtocolError, Result};

use super::packet::Data;

/// Whether the tree contains at least one binary leaf.
pub fn has_binary(data: &Data) -> bool {
    match data {
        Data::Binary(_) => true,
        Data::Value(_) => false,
        Data::Array(items) => items.iter().any(has_binary),
        Data::Object(entries) => entries.values().any(has_binary),
    }
}

/// Whether any element of an argument list contains binary.
pub fn args_have_binary(args: &[Data]) -> bool {
    args.iter().any(has_binary)
}

/// Replace binary leaves with placeholder markers, appending each buffer to
/// `buffers` in marker index order.
pub fn deconstruct_data(data: &Data, buffers: &mut Vec<Bytes>) -> Value {
    match data {
        Data::Binary(bytes) => {
            let mut placeholder = Map::new();
            placeholder.insert("_placeholder".to_string(), Value::Bool(true));
            placeholder.insert("num".to_string(), Value::from(buffers.len()));
            buffers.push(bytes.clone());
            Value::Object(placeholder)
        }
        Data::Value(value) => value.clone(),
        Data::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| deconstruct_data(item, buffers))
                .collect(),
        ),
        Data::Object(entries) => {
            let mut map = Map::new();
            for (key, value) in entries {
                map.insert(key.clone(), deconstruct_data(value, buffers));
            }
            Value::Object(map)
        }
    }
}

/// Substitute buffers back for placeholder markers.
///
/// Fails when a marker references a buffer index outside `buffers`.
pub fn reconstruct_data(value: Value, buffers: &[Bytes]) -> Result<Data> {
    match value {
        Value::Object(map) if is_placeholder(&map) => {
            let index = map
                .get("num")
                .and_then(Value::as_u64)
                .ok_or(ProtocolError::Parser)? as usize;
            let buffer = buffers.get(index).ok_or(ProtocolError::Parser)?;
            Ok(Data::Binary(buffer.clone()))
        }
        Value::Array(items) => items
            .into_iter()
            .map(|item| reconstruct_data(item, buffers))
            .collect::<Result<Vec<_>>>()
            .map(Data::Array),
        Value::Object(map) => {
            let mut entries = std::collections::BTreeMap::new();
            for (key, value) in map {
                entries.insert(key, reconstruct_data(value, buffers)?);
            }
            Ok(Data::Object(entries))
        }
        scalar => Ok(Data::Value(scalar)),
    }
}

fn is_placeholder(map: &Map<String, Value>) -> bool {
    map.get("_placeholder") == Some(&Value::Bool(true)) && map.contains_key("num")
}
