//! Replays pending journal entries to the backend.
//!
//! The backend itself is an external collaborator behind [`ReplayTarget`].
//! This layer only guarantees order, outbound identifier translation,
//! journal cleanup and reconciliation of server-assigned keys. Retrying is
//! left to the caller.

use async_trait::async_trait;
use tracing::{debug, info, warn};

use offlinekit_common::{Error, Key, Result};

use crate::context::OfflineContext;
use crate::journal::{JournalEntry, Operation};

/// Backend that performs the network operation of a journal entry.
#[async_trait]
pub trait ReplayTarget: Send + Sync {
    /// Perform one operation for `service`.
    ///
    /// For creates, returns the key the backend assigned, if any.
    async fn replay(&self, service: &str, entry: &JournalEntry) -> Result<Option<Key>>;
}

/// Result of [`replay_pending`].
#[derive(Debug, Default)]
pub struct ReplayOutcome {
    /// Entries replayed and cleared.
    pub replayed: usize,
    /// Offline identifiers translated to server keys, in replay order.
    pub translated: Vec<(String, Key)>,
    /// Entries still pending after a failure.
    pub remaining: usize,
    /// Failure that stopped the replay.
    pub failure: Option<Error>,
}

impl ReplayOutcome {
    /// Check if every pending entry was replayed.
    pub fn is_complete(&self) -> bool {
        self.failure.is_none()
    }
}

/// Replay the pending entries of one service in journal order.
///
/// Each entry is translated through the context's translation map, handed
/// to `target`, and cleared once the target accepts it. A create answered
/// with a different key triggers [`OfflineContext::translate_identifier`].
/// The first target failure stops the replay and is reported in the outcome.
///
/// # Errors
/// - `NotFound` when `service_name` is not registered
/// - Local storage or reconciliation failures
pub async fn replay_pending(
    context: &OfflineContext,
    service_name: &str,
    target: &dyn ReplayTarget,
) -> Result<ReplayOutcome> {
    let service = context
        .service(service_name)
        .await
        .ok_or_else(|| Error::NotFound(format!("Service '{}' is not registered", service_name)))?;

    let pending = service.read_pending().await?;
    let mut outcome = ReplayOutcome::default();

    for (position, entry) in pending.iter().enumerate() {
        let outgoing = context.translations().translate_entry(entry);
        let assigned = match target.replay(service_name, &outgoing).await {
            Ok(assigned) => assigned,
            Err(e) => {
                warn!(
                    "Replay of '{}' stopped at {} {} {}: {}",
                    service_name,
                    entry.operation.map(|o| o.to_string()).unwrap_or_default(),
                    entry.table,
                    entry.data_id,
                    e
                );
                outcome.remaining = pending.len() - position;
                outcome.failure = Some(e);
                break;
            }
        };

        service.clear_operations(std::slice::from_ref(entry)).await?;
        outcome.replayed += 1;
        debug!("Replayed entry {:?} of '{}'", entry.id, service_name);

        if entry.operation != Some(Operation::Create) {
            continue;
        }
        if let (Some(online), Key::Text(offline)) = (assigned, &outgoing.data_id) {
            if online != outgoing.data_id {
                context
                    .translate_identifier(offline, online.clone(), &entry.table, service_name)
                    .await?;
                outcome.translated.push((offline.clone(), online));
            }
        }
    }

    info!(
        "Replayed {} of {} pending entries of '{}'",
        outcome.replayed,
        pending.len(),
        service_name
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::{LogicalSchema, LogicalTable};
    use crate::query::Selector;
    use offlinekit_common::Row;
    use offlinekit_storage::MemoryEngine;
    use serde_json::{json, Value};
    use std::sync::{Arc, Mutex};

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    /// Backend stand-in assigning `srv-N` keys and failing on request.
    #[derive(Default)]
    struct Backend {
        seen: Mutex<Vec<(String, JournalEntry)>>,
        fail_at: Option<usize>,
    }

    #[async_trait]
    impl ReplayTarget for Backend {
        async fn replay(&self, service: &str, entry: &JournalEntry) -> Result<Option<Key>> {
            let mut seen = self.seen.lock().unwrap();
            if self.fail_at == Some(seen.len()) {
                return Err(Error::Storage("backend unavailable".to_string()));
            }
            seen.push((service.to_string(), entry.clone()));
            Ok(match entry.operation {
                Some(Operation::Create) => Some(Key::from(format!("srv-{}", seen.len()))),
                _ => None,
            })
        }
    }

    async fn context() -> OfflineContext {
        let context = OfflineContext::new(Arc::new(MemoryEngine::new())).unwrap();
        context
            .register_service("customers", LogicalSchema::new().table("Customer", LogicalTable::new("id")))
            .await
            .unwrap();
        context
            .register_service(
                "orders",
                LogicalSchema::new().table("Order", LogicalTable::new("id").foreign_keys(["customerId"])),
            )
            .await
            .unwrap();
        context
    }

    #[tokio::test]
    async fn test_replay_translates_and_clears() {
        let context = context().await;
        let customers = context.service("customers").await.unwrap();
        let orders = context.service("orders").await.unwrap();

        let customer = customers
            .create_local("Customer", vec![row(json!({"name": "Ada"}))], None)
            .await
            .unwrap();
        let u2 = customer[0]["id"].as_str().unwrap().to_string();
        let order = orders
            .create_local("Order", vec![row(json!({"customerId": u2}))], None)
            .await
            .unwrap();
        let u1 = order[0]["id"].as_str().unwrap().to_string();
        orders
            .update_local("Order", vec![row(json!({"id": u1, "customerId": u2, "paid": true}))], None)
            .await
            .unwrap();

        let backend = Backend::default();
        let outcome = replay_pending(&context, "customers", &backend).await.unwrap();
        assert!(outcome.is_complete());
        assert_eq!(outcome.translated, vec![(u2.clone(), Key::from("srv-1"))]);

        let outcome = replay_pending(&context, "orders", &backend).await.unwrap();
        assert_eq!(outcome.replayed, 2);
        assert_eq!(outcome.translated, vec![(u1.clone(), Key::from("srv-2"))]);

        let seen = backend.seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 3);
        let create = &seen[1].1;
        assert_eq!(create.changes.as_ref().unwrap()["customerId"], json!("srv-1"));
        let update = &seen[2].1;
        assert_eq!(update.data_id, Key::from("srv-2"));
        assert_eq!(update.changes.as_ref().unwrap()["customerId"], json!("srv-1"));

        assert!(orders.read_pending().await.unwrap().is_empty());
        let stored = orders
            .fetch_rows(&Selector::new("Order").with("id", "srv-2"))
            .await
            .unwrap();
        assert_eq!(stored[0]["customerId"], json!("srv-1"));
        assert_eq!(stored[0]["paid"], json!(true));
    }

    #[tokio::test]
    async fn test_replay_stops_at_first_failure() {
        let context = context().await;
        let customers = context.service("customers").await.unwrap();
        customers
            .create_local(
                "Customer",
                vec![row(json!({"id": 1})), row(json!({"id": 2})), row(json!({"id": 3}))],
                None,
            )
            .await
            .unwrap();

        let backend = Backend {
            fail_at: Some(1),
            ..Backend::default()
        };
        let outcome = replay_pending(&context, "customers", &backend).await.unwrap();
        assert_eq!(outcome.replayed, 1);
        assert_eq!(outcome.remaining, 2);
        assert!(matches!(outcome.failure, Some(Error::Storage(_))));

        let pending: Vec<Key> = customers
            .read_pending()
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.data_id)
            .collect();
        assert_eq!(pending, vec![Key::from(2i64), Key::from(3i64)]);
    }

    #[tokio::test]
    async fn test_unknown_service() {
        let context = context().await;
        let result = replay_pending(&context, "nobody", &Backend::default()).await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }
}
