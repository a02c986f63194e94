//! Physical storage engines for OfflineKit.
//!
//! An engine holds named, versioned databases of keyed JSON rows and applies
//! multi-table write batches atomically. Engines are resolved by name through
//! an [`EngineRegistry`] so the layers above stay backend agnostic.
//!
//! # Design Principles
//! - Engine isolation: no engine-specific logic above this crate
//! - Atomic batches: a commit is all-or-nothing across its declared tables
//! - Ordered reads: scans return rows in primary key order

pub mod engine;
pub mod memory;
pub mod registry;
pub mod schema;
pub mod sqlite;

pub use engine::{CommitReceipt, StorageEngine, WriteBatch, WriteOp};
pub use memory::MemoryEngine;
pub use registry::{create_default_registry, EngineFactory, EngineRegistry};
pub use schema::{DatabaseSchema, TableSchema};
pub use sqlite::SqliteEngine;
