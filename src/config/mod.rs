mod server;

pub use server::{DEFAULT_BATCH_SIZE, IndexerConfig, ServerConfig};
