// 12.0: warm restart state. the open-position set is dumped periodically to a
// blob repository and read back into the cache on start.

use crate::account_store::AccountStore;
use crate::cache::OrderCache;
use crate::position::Position;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

pub const STATE_CONTAINER: &str = "state";
pub const POSITIONS_BLOB: &str = "orders";

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage failure: {0}")]
    Storage(String),
}

#[async_trait]
pub trait BlobRepository: Send + Sync {
    async fn read(&self, container: &str, key: &str) -> Result<Option<Vec<u8>>, PersistenceError>;
    async fn write(&self, container: &str, key: &str, data: Vec<u8>) -> Result<(), PersistenceError>;
}

#[derive(Debug, Default)]
pub struct InMemoryBlobRepository {
    blobs: Mutex<HashMap<(String, String), Vec<u8>>>,
}

impl InMemoryBlobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn writes(&self) -> usize {
        self.blobs.lock().len()
    }
}

#[async_trait]
impl BlobRepository for InMemoryBlobRepository {
    async fn read(&self, container: &str, key: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
        Ok(self
            .blobs
            .lock()
            .get(&(container.to_string(), key.to_string()))
            .cloned())
    }

    async fn write(&self, container: &str, key: &str, data: Vec<u8>) -> Result<(), PersistenceError> {
        self.blobs
            .lock()
            .insert((container.to_string(), key.to_string()), data);
        Ok(())
    }
}

pub struct OrderCacheManager {
    cache: Arc<OrderCache>,
    accounts: Arc<AccountStore>,
    repository: Arc<dyn BlobRepository>,
}

impl OrderCacheManager {
    pub fn new(cache: Arc<OrderCache>, accounts: Arc<AccountStore>, repository: Arc<dyn BlobRepository>) -> Self {
        Self {
            cache,
            accounts,
            repository,
        }
    }

    /// Loads the last dump into the cache. Positions stored before legal
    /// entities were tracked get the owning account's one.
    pub async fn start(&self) -> Result<usize, PersistenceError> {
        let mut positions: Vec<Position> = match self.repository.read(STATE_CONTAINER, POSITIONS_BLOB).await? {
            Some(bytes) => serde_json::from_slice(&bytes)?,
            None => Vec::new(),
        };

        positions.retain_mut(|position| {
            if position.legal_entity.is_some() {
                return true;
            }
            match self.accounts.try_get(&position.account_id) {
                Some(account) => {
                    position.legal_entity = Some(account.legal_entity);
                    true
                }
                None => {
                    error!(
                        position_id = %position.id,
                        account_id = %position.account_id,
                        "skipping restored position, account unknown and no legal entity"
                    );
                    false
                }
            }
        });

        let count = positions.len();
        self.cache.init_positions(positions);
        info!(positions = count, "position cache restored");
        Ok(count)
    }

    pub async fn dump(&self) -> Result<usize, PersistenceError> {
        let positions = self.cache.positions().get_all();
        let bytes = serde_json::to_vec(&positions)?;
        self.repository.write(STATE_CONTAINER, POSITIONS_BLOB, bytes).await?;
        Ok(positions.len())
    }

    async fn dump_logged(&self) {
        if let Err(e) = self.dump().await {
            error!(error = %e, "failed to dump positions");
        }
    }

    /// Dumps every `period` until stopped, then once more.
    pub fn spawn_periodic_dump(self: Arc<Self>, period: Duration) -> PeriodicDump {
        let (shutdown, mut stopped) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // the first tick fires immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.dump_logged().await,
                    _ = stopped.changed() => break,
                }
            }
            self.dump_logged().await;
        });
        PeriodicDump { shutdown, handle }
    }
}

pub struct PeriodicDump {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl PeriodicDump {
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            error!(error = %e, "periodic dump task failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::MarginTradingAccount;
    use crate::order::{MatchedOrder, MatchedOrderCollection, Order};
    use crate::services::ManualClock;
    use crate::types::Timestamp;
    use rust_decimal_macros::dec;

    fn position(id: &str) -> Position {
        let now = Timestamp::from_millis(0);
        let mut order = Order::market(id, "a1", "EURUSD", dec!(10), now);
        order.start_execution(now, "MM").unwrap();
        order
            .execute(now, MatchedOrderCollection::new(vec![MatchedOrder::new("mm", dec!(1.1), dec!(10), now)]))
            .unwrap();
        Position::open(&order, order.matched_orders.clone(), now)
    }

    fn manager() -> (OrderCacheManager, Arc<OrderCache>, Arc<InMemoryBlobRepository>) {
        let cache = Arc::new(OrderCache::new());
        let accounts = Arc::new(AccountStore::new(Arc::new(ManualClock::new(Timestamp::from_millis(0)))));
        accounts.try_add_new(MarginTradingAccount::new("a1", "tc", "USD", dec!(100), "LE-1"));
        let repo = Arc::new(InMemoryBlobRepository::new());
        (
            OrderCacheManager::new(Arc::clone(&cache), accounts, repo.clone()),
            cache,
            repo,
        )
    }

    #[tokio::test]
    async fn restore_backfills_legal_entity() {
        let (manager, cache, repo) = manager();
        let mut legacy = position("p1");
        legacy.legal_entity = None;
        repo.write(STATE_CONTAINER, POSITIONS_BLOB, serde_json::to_vec(&vec![legacy]).unwrap())
            .await
            .unwrap();

        assert_eq!(manager.start().await.unwrap(), 1);
        let restored = cache.positions().try_get(&"p1".into()).unwrap();
        assert_eq!(restored.legal_entity.as_deref(), Some("LE-1"));
    }

    #[tokio::test]
    async fn restore_skips_orphan_without_legal_entity() {
        let (manager, cache, repo) = manager();
        let mut orphan = position("p1");
        orphan.account_id = "gone".into();
        orphan.legal_entity = None;
        let mut known = position("p2");
        known.account_id = "gone".into();
        known.legal_entity = Some("LE-2".to_string());
        repo.write(STATE_CONTAINER, POSITIONS_BLOB, serde_json::to_vec(&vec![orphan, known]).unwrap())
            .await
            .unwrap();

        assert_eq!(manager.start().await.unwrap(), 1);
        assert!(cache.positions().try_get(&"p1".into()).is_none());
        let kept = cache.positions().try_get(&"p2".into()).unwrap();
        assert_eq!(kept.legal_entity.as_deref(), Some("LE-2"));
    }

    #[tokio::test]
    async fn dump_then_start_round_trips_positions() {
        let (manager, cache, _) = manager();
        cache.positions().add(position("p1"));
        cache.positions().add(position("p2"));
        assert_eq!(manager.dump().await.unwrap(), 2);

        cache.init_positions(Vec::new());
        assert_eq!(manager.start().await.unwrap(), 2);
        assert_eq!(cache.positions().count(), 2);
    }

    #[tokio::test]
    async fn stopping_periodic_dump_writes_final_state() {
        let (manager, cache, repo) = manager();
        let manager = Arc::new(manager);
        let task = Arc::clone(&manager).spawn_periodic_dump(Duration::from_secs(3600));
        cache.positions().add(position("p1"));
        task.stop().await;

        let bytes = repo.read(STATE_CONTAINER, POSITIONS_BLOB).await.unwrap().unwrap();
        let dumped: Vec<Position> = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(dumped.len(), 1);
    }
}
