pub mod config;
pub mod error;
pub mod schema;
pub mod storage;
pub mod traits;
pub mod types;

pub use config::{EngineConfig, RunConfig};
pub use error::{BlockflowError, Result};
pub use schema::{Schema, ANY_SCHEMA_KEY};
pub use storage::{DataFormat, StorageApi, StorageFormat, StorageKind};
pub use types::*;
