use anyhow::{bail, Context as _};
use serde_json::{json, Value};

use blockflow_core::types::Records;

use crate::function::{DataFunction, EmitOptions, FunctionArgs, Output};

// ── ImportRecords ───────────────────────────────────────────────

/// Static source: emits its `records` parameter on the first run only.
pub struct ImportRecords;

const IMPORTED_STATE_KEY: &str = "imported";

impl DataFunction for ImportRecords {
    fn call(&self, args: &mut FunctionArgs<'_>) -> anyhow::Result<Output> {
        let records = parse_records(args.param("records"))?;
        let schema = args.param_str("schema").map(str::to_string);

        let ctx = args.context()?;
        if ctx.get_state_value(IMPORTED_STATE_KEY, json!(false)) == json!(true) {
            return Ok(Output::None);
        }
        ctx.emit_state_value(IMPORTED_STATE_KEY, json!(true));

        match schema {
            Some(key) => {
                ctx.emit(records, EmitOptions::default().schema(&key))
                    .context("emitting imported records")?;
                Ok(Output::None)
            }
            None => Ok(Output::Records(records)),
        }
    }
}

fn parse_records(value: Option<&Value>) -> anyhow::Result<Records> {
    let rows = match value {
        None => return Ok(Records::new()),
        Some(Value::Array(rows)) => rows,
        Some(other) => bail!("records must be a list of objects, got {}", other),
    };
    rows.iter()
        .enumerate()
        .map(|(i, row)| match row {
            Value::Object(map) => Ok(map.clone()),
            other => bail!("record {} is not an object: {}", i, other),
        })
        .collect()
}
