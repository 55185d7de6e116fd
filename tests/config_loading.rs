use std::io::Write;

use blockflow::{EngineConfig, LogConfig};
use blockflow_core::config::ResultHandlerConfig;
use blockflow_core::storage::DataFormat;

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[metadata]
url = "sqlite:///var/lib/blockflow/meta.db"

[registry]
namespace_precedence = ["shop", "core"]
use_global_schema_lookup = false

[run]
target_storage = "sqlite:///var/lib/blockflow/data.db"
target_format = "table"
storages = ["memory://_local", "sqlite:///var/lib/blockflow/data.db"]
execution_timelimit_seconds = 60
abort_on_function_error = true
run_until_inputs_exhausted = true
compute_record_counts = false

[run.result_handler]
type = "remote_callback"
url = "https://hooks.example.com/blockflow"
headers = { Authorization = "Bearer token" }

[log]
level = "blockflow=debug"

[[storages]]
url = "file:///var/lib/blockflow/files"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = EngineConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.metadata.url, "sqlite:///var/lib/blockflow/meta.db");
    assert_eq!(config.registry.namespace_precedence, vec!["shop", "core"]);
    assert!(!config.registry.use_global_schema_lookup);

    let run = &config.run;
    assert_eq!(run.target_storage_url(), "sqlite:///var/lib/blockflow/data.db");
    assert_eq!(run.target_format, Some(DataFormat::Table));
    assert_eq!(run.execution_timelimit_seconds, Some(60));
    assert!(run.abort_on_function_error);
    assert!(run.run_until_inputs_exhausted);
    assert!(!run.compute_record_counts);
    match &run.result_handler {
        ResultHandlerConfig::RemoteCallback { url, headers } => {
            assert_eq!(url, "https://hooks.example.com/blockflow");
            assert_eq!(headers["Authorization"], "Bearer token");
        }
        other => panic!("unexpected handler {:?}", other),
    }

    assert_eq!(config.log.level, "blockflow=debug");
    let urls = config.all_storage_urls();
    assert_eq!(urls.len(), 3);
    assert!(urls.contains(&"file:///var/lib/blockflow/files".to_string()));
}

#[test]
fn test_env_var_expansion_in_config() {
    std::env::set_var("BLOCKFLOW_TEST_CALLBACK", "https://expanded.example.com");

    let toml_content = r#"
[run.result_handler]
type = "remote_callback"
url = "${BLOCKFLOW_TEST_CALLBACK}"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = EngineConfig::load(tmp.path()).expect("load config");
    assert_eq!(
        config.run.result_handler,
        ResultHandlerConfig::RemoteCallback {
            url: "https://expanded.example.com".into(),
            headers: Default::default(),
        }
    );

    std::env::remove_var("BLOCKFLOW_TEST_CALLBACK");
}

#[test]
fn test_minimal_config_uses_defaults() {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"[run]\n").expect("write toml");

    let config = EngineConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.metadata.url, "sqlite://:memory:");
    assert!(config.registry.use_global_schema_lookup);
    assert_eq!(config.run.target_storage, None);
    assert_eq!(config.run.local_storage, "memory://_local");
    assert_eq!(config.run.target_storage_url(), "memory://_local");
    assert!(config.run.storages.is_empty());
    assert!(!config.run.abort_on_function_error);
    assert!(!config.run.run_until_inputs_exhausted);
    assert!(config.run.compute_record_counts);
    assert_eq!(config.run.result_handler, ResultHandlerConfig::Metadata);
    assert_eq!(config.log.level, LogConfig::default().level);
}

#[test]
fn test_missing_config_file() {
    let err = EngineConfig::load(std::path::Path::new("/nonexistent/blockflow.toml")).unwrap_err();
    assert!(err.to_string().contains("not found"));
}

#[test]
fn test_invalid_result_handler_rejected() {
    let err = EngineConfig::from_toml_str("[run.result_handler]\ntype = \"carrier_pigeon\"\n")
        .unwrap_err();
    assert!(err.to_string().starts_with("Config error"));
}
