// Node outputs come back in two shapes: a plain sequence of slot values, or a
// mapping that wraps the sequence under a "result" key. Downstream code always
// wants "slot N", so this normalizes both.

use anyhow::{bail, Context, Result};
use serde_json::Value;

/// Returns the value at `index` of a node output.
///
/// Sequences are indexed directly. Mappings are tried with the stringified
/// index as a key first; failing that, the `"result"` entry is extracted and
/// indexed instead. Anything else is an error.
pub fn value_at_index(output: &Value, index: usize) -> Result<&Value> {
    match output {
        Value::Array(slots) => slots
            .get(index)
            .with_context(|| format!("slot {} out of range ({} outputs)", index, slots.len())),
        Value::Object(map) => {
            if let Some(value) = map.get(&index.to_string()) {
                return Ok(value);
            }
            match map.get("result") {
                Some(Value::Array(slots)) => slots.get(index).with_context(|| {
                    format!("slot {} out of range ({} results)", index, slots.len())
                }),
                Some(other) => bail!("\"result\" entry is not a sequence: {}", other),
                None => bail!("node output has neither slot {} nor a \"result\" entry", index),
            }
        }
        other => bail!("node output is neither a sequence nor a mapping: {}", other),
    }
}
