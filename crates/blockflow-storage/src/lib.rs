pub mod conversion;
pub mod file;
pub mod memory;
pub mod registry;
pub mod sqlite;

pub use conversion::{ConversionCost, ConversionEngine, Converter};
pub use file::FileStorage;
pub use memory::MemoryStorage;
pub use registry::StorageRegistry;
pub use sqlite::SqliteStorage;
