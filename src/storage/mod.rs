pub mod duckdb;
pub mod memory;
pub mod settings;
pub mod traits;

pub use self::duckdb::DuckDbStorage;
pub use memory::InMemoryStorage;
pub use settings::{
    load_or_create_install_id, InMemorySettings, JsonFileSettings, SettingsStore,
};
pub use traits::{LoadedBatch, LogStorage, StorageError};
