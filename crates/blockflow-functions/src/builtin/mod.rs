pub mod sources;
pub mod transforms;

use blockflow_core::error::Result;

use crate::function::FunctionDef;
use crate::interface::Signature;
use crate::registry::ComponentRegistry;

pub const CORE_NAMESPACE: &str = "core";

/// Register every `core.*` function.
pub fn register_builtins(registry: &mut ComponentRegistry) -> Result<()> {
    registry.register_function(
        FunctionDef::from_impl(
            CORE_NAMESPACE,
            "import_records",
            Signature::new()
                .unannotated("ctx")
                .param("records", "Json")
                .param("schema", "Optional[str]"),
            sources::ImportRecords,
        )?
        .with_description("Emit the `records` parameter once"),
    );
    registry.register_function(
        FunctionDef::from_impl(
            CORE_NAMESPACE,
            "accumulator",
            Signature::new()
                .param("input", "Stream")
                .param("previous", "Optional[SelfReference]"),
            transforms::Accumulator,
        )?
        .with_description("Previous output plus every new input row"),
    );
    registry.register_function(
        FunctionDef::from_impl(
            CORE_NAMESPACE,
            "dedupe_keep_latest",
            Signature::new()
                .param("input", "Block")
                .param("unique_on", "Optional[str]"),
            transforms::DedupeKeepLatest,
        )?
        .with_description("Keep the last row for each `unique_on` value"),
    );
    registry.register_function(FunctionDef::from_impl(
        CORE_NAMESPACE,
        "passthrough",
        Signature::new().unannotated("input"),
        transforms::Passthrough,
    )?);
    Ok(())
}
