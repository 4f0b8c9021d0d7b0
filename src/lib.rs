//! # gitgate
//!
//! A git transport gateway that serves repositories over SSH and smart HTTP
//! and keeps a queryable index (commits, trees, blobs, changed files, ref
//! ancestry, full-text search) in step with every push.
//!
//! ## Library Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use gitgate::config::ServerConfig;
//! use gitgate::engine::GitEngine;
//! use gitgate::indexer::{IncrementalIndexer, IndexTrigger};
//! use gitgate::server::{AppState, create_router};
//! use gitgate::store::{SqliteStore, Store};
//!
//! let config = ServerConfig::default();
//! let store = Arc::new(SqliteStore::new(config.db_path())?);
//! store.initialize()?;
//! let engine = Arc::new(GitEngine::new());
//!
//! let indexer = IncrementalIndexer::new(engine.clone(), store.clone(), config.indexer.clone());
//! let trigger = Arc::new(IndexTrigger::new(
//!     indexer,
//!     engine.clone(),
//!     store.clone(),
//!     config.indexer.settle_delay(),
//! ));
//! let router = create_router(Arc::new(AppState { store, engine, trigger }));
//! // Serve with axum...
//! ```
//!
//! ## Feature Flags
//!
//! - `cli` (default): builds the `gitgate` binary.

pub mod auth;
pub mod config;
pub mod engine;
pub mod error;
pub mod indexer;
pub mod server;
pub mod store;
pub mod types;
