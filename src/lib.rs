//! Incremental dataflow execution over append-only data blocks.
//!
//! Nodes bound to functions consume the blocks their upstream nodes emit,
//! each block at most once per consuming input, and emit new blocks of
//! their own. Progress is recorded in a metadata store so a graph can be
//! run again at any time and only processes what is new.

pub mod logging;

pub use blockflow_core::config::{EngineConfig, LogConfig, RunConfig};
pub use blockflow_core::error::{BlockflowError, Result};
pub use blockflow_core::schema::{Field, FieldType, Schema};
pub use blockflow_core::types::*;
pub use blockflow_exec::{
    Environment, Executable, ExecutionResult, Executor, Pipeline, ResultHandler, RunStatus,
};
pub use blockflow_functions::{
    ComponentRegistry, EmitOptions, ExecutionContext, FunctionArgs, FunctionDef, Output,
    Signature,
};
pub use blockflow_graph::{FlatGraph, GraphDef, NodeDef};
pub use blockflow_storage::{ConversionCost, ConversionEngine, Converter, StorageRegistry};
