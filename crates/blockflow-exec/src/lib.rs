pub mod binder;
pub mod context;
pub mod environment;
pub mod executor;
pub mod handler;
pub mod pipeline;
pub mod reader;
pub mod result;

pub use binder::{bind_inputs, BoundInputs};
pub use context::RunContext;
pub use environment::Environment;
pub use executor::{Executor, RunPhase};
pub use handler::{
    handler_for, DebugResultHandler, MetadataResultHandler, RemoteCallbackResultHandler,
    ResultHandler,
};
pub use pipeline::Pipeline;
pub use reader::LocalBlockReader;
pub use result::{Executable, ExecutionResult, RunStatus};
