//! Shared fixtures for Blockflow tests.

pub mod converter;
pub mod env;
pub mod records;

pub use converter::CountingConverter;
pub use env::{TestEnv, TestEnvBuilder};
pub use records::{generate_records, record, temp_file_storage};
