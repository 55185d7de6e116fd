use serde_json::{json, Value};
use tempfile::TempDir;

use blockflow_core::types::{Record, Records};

/// A record from a JSON object literal.
pub fn record(value: Value) -> Record {
    match value {
        Value::Object(map) => map,
        other => panic!("record fixture must be an object, got {}", other),
    }
}

/// `n` rows carrying `fields`, numbered from `start`. A field named `id`
/// holds the row number; every other field holds `"<field>-<n>"`.
pub fn generate_records(start: usize, n: usize, fields: &[&str]) -> Records {
    (start..start + n)
        .map(|i| {
            fields
                .iter()
                .map(|f| {
                    let value = if *f == "id" {
                        json!(i)
                    } else {
                        json!(format!("{}-{}", f, i))
                    };
                    (f.to_string(), value)
                })
                .collect()
        })
        .collect()
}

/// A temporary directory and the `file://` storage url rooted at it.
pub fn temp_file_storage() -> (TempDir, String) {
    let dir = TempDir::new().expect("create temp dir");
    let url = format!("file://{}", dir.path().display());
    (dir, url)
}
