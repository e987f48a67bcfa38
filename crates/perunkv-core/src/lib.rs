//! # PerunKV Core
//!
//! Durable in-memory key-value engine for a single-node data service.
//!
//! The engine keeps an integer-keyed table of opaque byte blobs in memory
//! (a Robin-Hood open-addressed hash map) and makes it durable with a
//! hybrid persistence layer:
//!
//! - an **append-only command log** with CRC-verified records, written
//!   either synchronously or through a bounded ring with group commit;
//! - **periodic full snapshots** with a checksum footer, replaced
//!   atomically via temp-then-rename;
//! - **crash recovery** by loading the newest snapshot and replaying the
//!   log on top of it, aborting on any corruption.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use perunkv_core::{Engine, EngineConfig};
//!
//! fn main() -> perunkv_core::Result<()> {
//!     let config = EngineConfig::new("./data");
//!     let engine = Engine::open(&config)?;
//!
//!     engine.put(7, br#"{"id":7,"name":"neo"}"#)?;
//!     assert!(engine.get(7).is_some());
//!
//!     engine.compact()?;
//!     engine.shutdown();
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![cfg_attr(test, allow(clippy::cast_possible_truncation))]

pub mod aof;
pub mod config;
pub mod crc32c;
pub mod engine;
pub mod error;
pub mod rdb;
pub mod store;

pub use aof::AofEngine;
pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{Error, Result};
pub use store::Store;
