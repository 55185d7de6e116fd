pub mod builtin;
pub mod function;
pub mod interface;
pub mod registry;

pub use function::{
    BlockStream, BoundInput, ConsumedBlocks, DataFunction, EmitOptions, ExecutionContext,
    FunctionArgs, FunctionDef, InputBlock, Output,
};
pub use interface::{
    extract_interface, FunctionInterface, InputDef, InputKind, OutputDef, ParameterDef,
    ParameterType, Signature,
};
pub use registry::ComponentRegistry;
