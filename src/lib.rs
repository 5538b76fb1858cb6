//! facade: a multi-tenant static-content origin.
//!
//! One replica answers HTTP requests for many frontend applications. A
//! request's host and path resolve to an application version whose content
//! is materialized on first access -- restored from a CDN-parked archive,
//! downloaded over http(s), or extracted from a container image -- and then
//! served from local disk or delegated to the CDN. Replicas discovered over
//! DNS keep each other consistent with token-guarded invalidations.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use facade::acquire::Acquirer;
//! use facade::cache::CacheDir;
//! use facade::config::OriginConfig;
//! use facade::server::{serve, Origin};
//! use facade::store::MemoryStore;
//! use facade::sync::Broadcaster;
//!
//! #[tokio::main]
//! async fn main() -> facade::Result<()> {
//!     let config = OriginConfig::default();
//!     let store = Arc::new(MemoryStore::new());
//!     let dir = Arc::new(CacheDir::new());
//!     let acquirer = Acquirer::new(config.clone(), store.clone(), None);
//!     let broadcaster = Broadcaster::from_config(&config.sync);
//!     serve(Arc::new(Origin::new(config, store, dir, acquirer, broadcaster))).await
//! }
//! ```

pub mod acquire;
pub mod archive;
pub mod cache;
pub mod cdn;
pub mod config;
pub mod error;
pub mod janitor;
pub mod mode;
pub mod server;
pub mod store;
pub mod sync;

pub use error::{Error, Result};
