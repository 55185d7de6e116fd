use std::collections::HashMap;

use anyhow::Context as _;

use blockflow_core::types::Records;

use crate::function::{DataFunction, FunctionArgs, InputBlock, Output};

// ── Accumulator ─────────────────────────────────────────────────

/// Re-emits its own previous output followed by every new input row.
pub struct Accumulator;

impl DataFunction for Accumulator {
    fn call(&self, args: &mut FunctionArgs<'_>) -> anyhow::Result<Output> {
        let mut rows = args
            .reference("previous")
            .map(InputBlock::into_records)
            .unwrap_or_default();
        if let Some(mut stream) = args.stream("input") {
            rows.extend(stream.read_all().context("reading input stream")?);
        }
        Ok(Output::Records(rows))
    }
}

// ── DedupeKeepLatest ────────────────────────────────────────────

/// Keeps the last row for each value of the `unique_on` column.
///
/// Rows lacking the column are kept. Without `unique_on` the block passes
/// through unchanged.
pub struct DedupeKeepLatest;

impl DataFunction for DedupeKeepLatest {
    fn call(&self, args: &mut FunctionArgs<'_>) -> anyhow::Result<Output> {
        let unique_on = args.param_str("unique_on").map(str::to_string);
        let rows = match args.block("input") {
            Some(block) => block.into_records(),
            None => return Ok(Output::None),
        };
        match unique_on {
            Some(column) => Ok(Output::Records(keep_latest(rows, &column))),
            None => Ok(Output::Records(rows)),
        }
    }
}

fn keep_latest(rows: Records, column: &str) -> Records {
    // Rows keep the position of their key's first occurrence.
    let mut out = Records::new();
    let mut by_key: HashMap<String, usize> = HashMap::new();
    for row in rows {
        let Some(key) = row.get(column).map(|v| v.to_string()) else {
            out.push(row);
            continue;
        };
        match by_key.get(&key) {
            Some(&idx) => out[idx] = row,
            None => {
                by_key.insert(key, out.len());
                out.push(row);
            }
        }
    }
    out
}

// ── Passthrough ─────────────────────────────────────────────────

pub struct Passthrough;

impl DataFunction for Passthrough {
    fn call(&self, args: &mut FunctionArgs<'_>) -> anyhow::Result<Output> {
        match args.block("input") {
            Some(block) => Ok(Output::Records(block.into_records())),
            None => Ok(Output::None),
        }
    }
}
