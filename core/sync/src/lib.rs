//! OfflineKit Sync Engine
//!
//! Offline persistence for domain services, including:
//! - Local Store with handle invalidation and crash-safe recreate
//! - Schema convergence onto declared logical schemas
//! - Selector queries with membership filters and multi-key ordering
//! - Operation journal of pending mutations and fetch markers
//! - Offline identifier reconciliation across services
//! - Authoritative cache writes with pruning, and journal replay

pub mod context;
pub mod journal;
pub mod migration;
pub mod query;
pub mod reconcile;
pub mod replay;
pub mod service;
pub mod store;

// Re-export main types
pub use context::{ContextConfig, OfflineContext, Translation};
pub use journal::{JournalEntry, Operation, OperationJournal, JOURNAL_TABLE};
pub use migration::{LogicalSchema, LogicalTable, MigrationHook, MigrationReport, SchemaManager};
pub use query::{CollectSink, Criterion, Direction, QueryExecutor, ResultSink, Selector, SortOrder};
pub use reconcile::{Dependency, DependencyGraph, DependencyRecord, TranslationMap, KEYS_DATABASE, KEYS_TABLE};
pub use replay::{replay_pending, ReplayOutcome, ReplayTarget};
pub use service::{AuthoritativeWrite, OfflineService};
pub use store::{Database, LocalStore, RecreatePhase, RowTransform, Table};
