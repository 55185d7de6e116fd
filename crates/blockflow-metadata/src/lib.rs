pub mod store;

pub use store::SqliteMetadataStore;
