use crate::orchestrator::{Orchestrator, Outcome};
use relaydl_ipc::Envelope;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub const MAX_INBOUND_CONCURRENCY: usize = 8;
const SESSION_PURGE_INTERVAL_SECS: u64 = 60;

type ScopeLocks = Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>;

/// Spawns a handler task per envelope. At most `MAX_INBOUND_CONCURRENCY`
/// handlers run at once and events of the same user are handled in order.
#[derive(Clone)]
pub struct Dispatcher {
    orchestrator: Arc<Orchestrator>,
    semaphore: Arc<Semaphore>,
    scope_locks: ScopeLocks,
}

impl Dispatcher {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            orchestrator,
            semaphore: Arc::new(Semaphore::new(MAX_INBOUND_CONCURRENCY)),
            scope_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn run(self, mut inbound_rx: broadcast::Receiver<Envelope>) {
        let mut purge_interval =
            tokio::time::interval(Duration::from_secs(SESSION_PURGE_INTERVAL_SECS));

        loop {
            tokio::select! {
                result = inbound_rx.recv() => {
                    match result {
                        Ok(envelope) => {
                            self.dispatch(envelope);
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            info!("Event bus closed, stopping dispatcher");
                            break;
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Event bus lagged by {} messages", n);
                        }
                    }
                }
                _ = purge_interval.tick() => {
                    let purged = self.orchestrator.sessions().purge_expired().await;
                    if purged > 0 {
                        debug!(purged, "Expired pending requests removed");
                    }
                    self.prune_idle_scope_locks().await;
                }
            }
        }
    }

    pub fn dispatch(&self, envelope: Envelope) -> JoinHandle<()> {
        let orchestrator = Arc::clone(&self.orchestrator);
        let semaphore = Arc::clone(&self.semaphore);
        let scope_locks = Arc::clone(&self.scope_locks);
        let scope_key = envelope.scope_key();
        let trace_id = envelope.trace_id.clone();

        tokio::spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(err) => {
                    error!(
                        "Inbound worker semaphore closed (trace_id={}): {}",
                        trace_id, err
                    );
                    return;
                }
            };

            let scope_lock = get_or_create_scope_lock(&scope_locks, &scope_key).await;
            let _scope_guard = scope_lock.lock_owned().await;

            match orchestrator.handle(envelope).await {
                Ok(Outcome::Failed(reason)) => {
                    debug!(trace_id = %trace_id, "Request ended with {}", reason);
                }
                Ok(_) => {}
                Err(e) => {
                    error!(
                        "Error processing inbound event (trace_id={}): {}",
                        trace_id, e
                    );
                }
            }
        })
    }

    /// Locks nobody holds or waits for are dropped so the map stays bounded.
    async fn prune_idle_scope_locks(&self) {
        let mut locks = self.scope_locks.lock().await;
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }
}

async fn get_or_create_scope_lock(scope_locks: &ScopeLocks, scope_key: &str) -> Arc<Mutex<()>> {
    let mut locks = scope_locks.lock().await;
    locks
        .entry(scope_key.to_string())
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;
    use relaydl_ipc::EventBus;
    use std::sync::atomic::Ordering;

    fn slow_extractor() -> FakeExtractor {
        FakeExtractor {
            delay: Some(Duration::from_millis(50)),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn same_user_events_are_serialized() {
        let mut config = base_config();
        config.fetcher.workers = Some(4);
        let h = Harness::new(config, FakeTransport::default(), slow_extractor());
        h.orchestrator
            .handle(text(1, "https://example.com/a"))
            .await
            .expect("handle");

        let dispatcher = Dispatcher::new(Arc::clone(&h.orchestrator));
        let first = dispatcher.dispatch(callback(1, "dl:video:best", 10));
        let second = dispatcher.dispatch(callback(1, "dl:video:best", 10));
        first.await.expect("join");
        second.await.expect("join");

        assert_eq!(h.extractor.download_count(), 2);
        assert_eq!(h.extractor.peak_running.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn different_users_run_concurrently() {
        let mut config = base_config();
        config.fetcher.workers = Some(4);
        let h = Harness::new(config, FakeTransport::default(), slow_extractor());
        for user in [1, 2] {
            h.orchestrator
                .handle(text(user, "https://example.com/a"))
                .await
                .expect("handle");
        }

        let dispatcher = Dispatcher::new(Arc::clone(&h.orchestrator));
        let a = dispatcher.dispatch(callback(1, "dl:video:best", 10));
        let b = dispatcher.dispatch(callback(2, "dl:video:best", 11));
        a.await.expect("join");
        b.await.expect("join");

        assert_eq!(h.extractor.peak_running.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn run_loop_stops_when_bus_closes() {
        let h = Harness::new(base_config(), FakeTransport::default(), FakeExtractor::default());
        let bus = EventBus::new();
        let rx = bus.subscribe();
        let dispatcher = Dispatcher::new(Arc::clone(&h.orchestrator));
        let task = tokio::spawn(dispatcher.run(rx));

        bus.publish(command(3, "help", &[])).expect("publish");
        drop(bus);
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("dispatcher stops")
            .expect("join");
    }

    #[tokio::test]
    async fn idle_scope_locks_are_pruned() {
        let h = Harness::new(base_config(), FakeTransport::default(), FakeExtractor::default());
        let dispatcher = Dispatcher::new(Arc::clone(&h.orchestrator));
        dispatcher
            .dispatch(command(4, "help", &[]))
            .await
            .expect("join");
        assert_eq!(dispatcher.scope_locks.lock().await.len(), 1);
        dispatcher.prune_idle_scope_locks().await;
        assert!(dispatcher.scope_locks.lock().await.is_empty());
    }
}
