use serde_json::json;

use blockflow::{
    EmitOptions, FunctionDef, NodeDef, Output, RunConfig, RunStatus, Signature,
    DEFAULT_OUTPUT_NAME,
};
use blockflow_test_utils::{generate_records, TestEnv};

/// Emits 10 rows per run; from the second run on every row has a fourth
/// field.
fn growing_source() -> FunctionDef {
    FunctionDef::new("test", "growing_source", Signature::new().unannotated("ctx"), |args| {
        let ctx = args.context()?;
        let run = ctx.get_state_value("run", json!(0)).as_u64().unwrap_or(0);
        ctx.emit_state_value("run", json!(run + 1));

        let fields: &[&str] = if run == 0 {
            &["id", "name", "city"]
        } else {
            &["id", "name", "city", "email"]
        };
        let rows = generate_records(run as usize * 10, 10, fields);
        ctx.emit(rows, EmitOptions::default())?;
        Ok(Output::None)
    })
    .unwrap()
}

#[test]
fn test_accumulated_rows_and_growing_schema() {
    let t = TestEnv::builder().function(growing_source()).build();
    let pipeline = t.pipeline(vec![
        NodeDef::new("source", "test.growing_source"),
        NodeDef::new("all", "core.accumulator").with_input("input", "source"),
    ]);

    let mut field_counts = Vec::new();
    for expected in [10u64, 20, 30, 40] {
        let results = pipeline.run_graph().unwrap();
        assert!(results.iter().all(|r| r.status == RunStatus::SuccessWithOutput));

        let acc = results[1].output_block(DEFAULT_OUTPUT_NAME).unwrap();
        assert_eq!(acc.block.record_count, Some(expected));

        let latest = t.env.latest_output("all").unwrap().unwrap();
        assert_eq!(latest.block.id, acc.block.id);
        let realized = latest.block.realized_schema_key.unwrap();
        let schema = t.env.registry().resolve_schema(&realized).unwrap();
        field_counts.push(schema.fields.len());
    }
    assert_eq!(field_counts, vec![3, 4, 4, 4]);

    // Every source block was consumed exactly once.
    let consumed = t.env.metadata().consumed_block_ids("all").unwrap();
    assert_eq!(consumed.len(), 4);
}

#[test]
fn test_optional_reference_without_upstream_output() {
    let annotate = FunctionDef::new(
        "test",
        "annotate",
        Signature::new()
            .param("input", "Stream")
            .param("lookup", "Optional[Reference]"),
        |args| {
            let has_lookup = args.reference("lookup").is_some();
            let mut rows = args.records("input")?;
            for row in &mut rows {
                row.insert("has_lookup".into(), json!(has_lookup));
            }
            Ok(Output::Records(rows))
        },
    )
    .unwrap();
    let silent = FunctionDef::new("test", "silent", Signature::new(), |_| Ok(Output::None)).unwrap();

    let t = TestEnv::builder().function(annotate).function(silent).build();
    let pipeline = t.pipeline(vec![
        NodeDef::new("src", "core.import_records")
            .with_param("records", json!([{"id": 1}, {"id": 2}])),
        NodeDef::new("lookup", "test.silent"),
        NodeDef::new("annotated", "test.annotate")
            .with_input("input", "src")
            .with_input("lookup", "lookup"),
    ]);

    let results = pipeline.run_graph().unwrap();
    let by_key = |key: &str| results.iter().find(|r| r.node_key == key).unwrap();
    assert_eq!(by_key("lookup").status, RunStatus::SuccessNoOutput);

    let annotated = by_key("annotated");
    assert_eq!(annotated.status, RunStatus::SuccessWithOutput);
    assert_eq!(annotated.bound_inputs, vec!["input".to_string()]);
    assert_eq!(annotated.input_blocks_consumed["input"], 1);

    let block = t.env.latest_output("annotated").unwrap().unwrap();
    let rows = t.env.read_records(&block).unwrap();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| r["has_lookup"] == json!(false)));
}

fn merge() -> FunctionDef {
    FunctionDef::new(
        "test",
        "merge",
        Signature::new().param("left", "Stream").param("right", "Stream"),
        |args| {
            let mut rows = args.records("left")?;
            rows.extend(args.records("right")?);
            Ok(Output::Records(rows))
        },
    )
    .unwrap()
}

fn merge_graph() -> Vec<NodeDef> {
    vec![
        NodeDef::new("a", "core.import_records").with_param("records", json!([{"id": 1}])),
        NodeDef::new("b", "core.import_records")
            .with_param("records", json!([{"id": 2}, {"id": 3}])),
        NodeDef::new("merged", "test.merge")
            .with_input("left", "a")
            .with_input("right", "b"),
    ]
}

#[test]
fn test_same_storage_target_needs_no_conversion() {
    let t = TestEnv::builder()
        .function(merge())
        .run_config(RunConfig {
            target_storage: Some("memory://_local".into()),
            ..RunConfig::default()
        })
        .build();
    let results = t.pipeline(merge_graph()).run_graph().unwrap();

    assert_eq!(results[2].node_key, "merged");
    assert_eq!(results[2].record_count(), 3);
    assert!(results[2].stored_blocks_created.is_empty());
    assert_eq!(t.conversion_calls(), 0);
}

#[test]
fn test_remote_target_goes_through_converters() {
    let t = TestEnv::builder()
        .function(merge())
        .run_config(RunConfig {
            target_storage: Some("sqlite://:memory:".into()),
            ..RunConfig::default()
        })
        .build();
    let results = t.pipeline(merge_graph()).run_graph().unwrap();

    let merged = &results[2];
    assert_eq!(merged.record_count(), 3);
    // Each upstream block was copied to local memory to be read.
    assert_eq!(merged.stored_blocks_created.len(), 2);
    let stored = &merged.output_blocks[0].stored_blocks[0];
    assert_eq!(stored.storage_url, "sqlite://:memory:");
    assert!(t.conversion_calls() > 0);
}
