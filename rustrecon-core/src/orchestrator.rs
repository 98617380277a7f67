use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rustrecon_db::{DbError, Store};
use rustrecon_types::{QueueItem, QueueStatus};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{ActionError, OrchestratorError};
use crate::guard::SingleFlight;
use crate::registry::{ActionContext, ActionRegistry};
use crate::scheduler::{Scheduler, TickReport};

const NO_HANDLER: &str = "no handler registered for action";

/// Idle workers poll the queue this often.
const IDLE_POLL: Duration = Duration::from_millis(500);

/// Event emitted while the orchestrator runs.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    /// A scheduler pass finished.
    Tick(TickReport),
    /// A worker claimed a row and dispatched it.
    Started {
        id: i64,
        action: String,
        mac: String,
    },
    /// A dispatched row reached a terminal status.
    Finished {
        id: i64,
        action: String,
        status: QueueStatus,
    },
    /// Non-fatal error; the loop keeps going.
    Error(String),
}

/// Drives the queue: a scheduler loop, a pool of workers, and a stats refresher.
#[derive(Clone)]
pub struct Orchestrator {
    store: Arc<Store>,
    scheduler: Arc<Scheduler>,
    registry: Arc<ActionRegistry>,
    running: Arc<DashMap<i64, CancellationToken>>,
    stats_flight: SingleFlight,
    events: Option<mpsc::Sender<OrchestratorEvent>>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("registry", &self.registry)
            .field("running", &self.running.len())
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    pub fn new(scheduler: Scheduler, store: Arc<Store>, registry: ActionRegistry) -> Self {
        Self {
            store,
            scheduler: Arc::new(scheduler),
            registry: Arc::new(registry),
            running: Arc::new(DashMap::new()),
            stats_flight: SingleFlight::new(),
            events: None,
        }
    }

    /// Stream [`OrchestratorEvent`]s to `tx`. Events are dropped when the channel is full.
    pub fn with_events(mut self, tx: mpsc::Sender<OrchestratorEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Ids of rows currently being executed by this orchestrator.
    pub fn running_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.running.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    fn emit(&self, event: OrchestratorEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.try_send(event);
        }
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, OrchestratorError>
    where
        T: Send + 'static,
        F: FnOnce(&Store) -> Result<T, DbError> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| OrchestratorError::Join(e.to_string()))?
            .map_err(OrchestratorError::from)
    }

    /// Run until `cancel` fires. In-flight actions see their tokens cancelled
    /// and are recorded as cancelled before this returns.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), OrchestratorError> {
        let workers = self.scheduler.config().workers;
        info!(
            workers,
            handlers = self.registry.len(),
            controller = %self.scheduler.controller_mac(),
            "orchestrator starting"
        );

        let mut tasks: JoinSet<()> = JoinSet::new();
        {
            let this = self.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move { this.scheduler_loop(cancel).await });
        }
        {
            let this = self.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move { this.stats_loop(cancel).await });
        }
        for worker in 0..workers {
            let this = self.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move { this.worker_loop(worker, cancel).await });
        }

        let mut result = Ok(());
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "orchestrator task panicked");
                if result.is_ok() {
                    result = Err(OrchestratorError::Join(e.to_string()));
                }
                cancel.cancel();
            }
        }
        info!("orchestrator stopped");
        result
    }

    async fn scheduler_loop(&self, cancel: CancellationToken) {
        let interval = self.scheduler.config().tick_interval();
        loop {
            let scheduler = Arc::clone(&self.scheduler);
            match tokio::task::spawn_blocking(move || scheduler.tick()).await {
                Ok(Ok(report)) => self.emit(OrchestratorEvent::Tick(report)),
                Ok(Err(e)) => {
                    error!(error = %e, "scheduler tick failed");
                    self.emit(OrchestratorEvent::Error(e.to_string()));
                }
                Err(e) => {
                    error!(error = %e, "scheduler tick panicked");
                    self.emit(OrchestratorEvent::Error(e.to_string()));
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        debug!("scheduler loop stopped");
    }

    async fn stats_loop(&self, cancel: CancellationToken) {
        let interval = self.scheduler.config().stats_refresh();
        loop {
            if let Err(e) = self.refresh_stats().await {
                warn!(error = %e, "stats refresh failed");
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    /// Recompute the live counters unless a refresh is already running.
    /// Returns `false` when skipped.
    pub async fn refresh_stats(&self) -> Result<bool, OrchestratorError> {
        let Some(_guard) = self.stats_flight.try_enter() else {
            debug!("stats refresh already running, skipped");
            return Ok(false);
        };
        let stats = self.blocking(|store| store.recompute_livestats()).await?;
        debug!(?stats, "live stats refreshed");
        Ok(true)
    }

    async fn worker_loop(&self, worker: usize, cancel: CancellationToken) {
        debug!(worker, "worker started");
        while !cancel.is_cancelled() {
            let delay = match self.blocking(|store| store.claim_next()).await {
                Ok(Some(item)) => {
                    self.execute(item, &cancel).await;
                    continue;
                }
                Ok(None) => IDLE_POLL,
                Err(e) => {
                    warn!(worker, error = %e, "claiming next queue item failed");
                    self.emit(OrchestratorEvent::Error(e.to_string()));
                    self.scheduler.config().tick_interval()
                }
            };
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        debug!(worker, "worker stopped");
    }

    /// Dispatch one claimed row and record its outcome.
    async fn execute(&self, item: QueueItem, cancel: &CancellationToken) {
        let id = item.id;
        let action = item.action_name.clone();
        self.emit(OrchestratorEvent::Started {
            id,
            action: action.clone(),
            mac: item.mac_address.clone(),
        });

        let Some(handler) = self.registry.get(&action) else {
            warn!(id, action = %action, "no handler registered for action");
            self.report(id, &action, Err(ActionError::Failed(NO_HANDLER.into())))
                .await;
            return;
        };

        let lookup = action.clone();
        let definition = match self.blocking(move |store| store.get_action(&lookup)).await {
            Ok(def) => def,
            Err(e) => {
                warn!(id, action = %action, error = %e, "catalog lookup failed");
                None
            }
        };
        let timeout = item
            .metadata_timeout()
            .or(definition.as_ref().map(|d| d.timeout_secs))
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.scheduler.config().default_timeout());

        let token = cancel.child_token();
        self.running.insert(id, token.clone());
        info!(id, action = %action, mac = %item.mac_address, port = ?item.port, "dispatching");

        let ctx = ActionContext {
            item,
            definition,
            cancel: token.clone(),
            store: Arc::clone(&self.store),
        };
        let outcome = tokio::select! {
            _ = token.cancelled() => Err(ActionError::Cancelled),
            res = tokio::time::timeout(timeout, handler.execute(ctx)) => match res {
                Ok(outcome) => outcome,
                Err(_) => Err(ActionError::Timeout(timeout)),
            },
        };
        self.running.remove(&id);
        self.report(id, &action, outcome.map(|o| o.summary)).await;
    }

    async fn report(&self, id: i64, action: &str, outcome: Result<Option<String>, ActionError>) {
        let status = match &outcome {
            Ok(_) => QueueStatus::Success,
            Err(ActionError::Failed(_)) => QueueStatus::Failed,
            Err(ActionError::Timeout(_)) => QueueStatus::Expired,
            Err(ActionError::Cancelled) => QueueStatus::Cancelled,
        };
        let recorded = match outcome {
            Ok(summary) => {
                self.blocking(move |store| {
                    store.finish_running(id, QueueStatus::Success, None, summary.as_deref())
                })
                .await
            }
            Err(ActionError::Cancelled) => {
                self.blocking(move |store| store.cancel(id, Some("cancelled while running")))
                    .await
            }
            Err(e) => {
                let message = e.to_string();
                self.blocking(move |store| store.finish_running(id, status, Some(&message), None))
                    .await
            }
        };
        match recorded {
            Ok(true) => {
                info!(id, action, %status, "action finished");
                self.emit(OrchestratorEvent::Finished {
                    id,
                    action: action.to_string(),
                    status,
                });
            }
            // Stale sweep or operator cancel already closed the row.
            Ok(false) => {
                debug!(id, action, %status, "row already finished, outcome not recorded");
            }
            Err(e) => {
                warn!(id, action, %status, error = %e, "could not record outcome");
                self.emit(OrchestratorEvent::Error(e.to_string()));
            }
        }
    }

    /// Cancel a queued or running row. A running handler sees its token fire.
    pub async fn cancel_item(&self, id: i64) -> Result<bool, OrchestratorError> {
        let cancelled = self
            .blocking(move |store| store.cancel(id, Some("cancelled by operator")))
            .await?;
        if let Some((_, token)) = self.running.remove(&id) {
            token.cancel();
        }
        Ok(cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrchestratorConfig;
    use crate::registry::{ActionHandler, ActionOutcome};
    use async_trait::async_trait;
    use rustrecon_types::NewQueueItem;
    use serde_json::json;

    const MAC: &str = "aa:bb:cc:dd:ee:ff";

    struct Scripted {
        name: &'static str,
        behavior: Behavior,
    }

    enum Behavior {
        Succeed,
        Fail,
        Hang,
    }

    #[async_trait]
    impl ActionHandler for Scripted {
        fn name(&self) -> &str {
            self.name
        }

        async fn execute(&self, ctx: ActionContext) -> Result<ActionOutcome, ActionError> {
            match self.behavior {
                Behavior::Succeed => Ok(ActionOutcome::summary(format!(
                    "scanned {}",
                    ctx.item.ip.as_deref().unwrap_or("?")
                ))),
                Behavior::Fail => Err(ActionError::Failed("connection refused".into())),
                Behavior::Hang => {
                    ctx.cancel.cancelled().await;
                    Err(ActionError::Cancelled)
                }
            }
        }
    }

    fn orchestrator() -> Orchestrator {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let config = OrchestratorConfig {
            controller_mac: Some("b8:27:eb:00:00:01".into()),
            tick_interval_secs: 1,
            retry_failed: false,
            ..Default::default()
        };
        let scheduler = Scheduler::new(Arc::clone(&store), config).unwrap();
        let registry = ActionRegistry::new()
            .with(Arc::new(Scripted {
                name: "PortScan",
                behavior: Behavior::Succeed,
            }))
            .with(Arc::new(Scripted {
                name: "SSHBrute",
                behavior: Behavior::Fail,
            }))
            .with(Arc::new(Scripted {
                name: "Sniffer",
                behavior: Behavior::Hang,
            }));
        Orchestrator::new(scheduler, store, registry)
    }

    async fn wait_for(orch: &Orchestrator, id: i64, status: QueueStatus) -> QueueItem {
        for _ in 0..200 {
            let item = orch.store().get_item(id).unwrap().unwrap();
            if item.status == status {
                return item;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("item {id} never reached {status}");
    }

    #[tokio::test]
    async fn runs_items_and_records_outcomes() {
        let orch = orchestrator();
        let ok = orch
            .store()
            .enqueue_immediate(NewQueueItem::immediate("PortScan", MAC, Some("10.0.0.5")))
            .unwrap();
        let bad = orch
            .store()
            .enqueue_immediate(NewQueueItem::immediate("SSHBrute", MAC, None).port(22))
            .unwrap();
        let unknown = orch
            .store()
            .enqueue_immediate(NewQueueItem::immediate("Teleport", MAC, None))
            .unwrap();

        let cancel = CancellationToken::new();
        let handle = {
            let orch = orch.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { orch.run(cancel).await })
        };

        let done = wait_for(&orch, ok, QueueStatus::Success).await;
        assert_eq!(done.result_summary.as_deref(), Some("scanned 10.0.0.5"));
        let failed = wait_for(&orch, bad, QueueStatus::Failed).await;
        assert_eq!(failed.error_message.as_deref(), Some("connection refused"));
        assert_eq!(failed.retry_count, 1);
        let missing = wait_for(&orch, unknown, QueueStatus::Failed).await;
        assert_eq!(missing.error_message.as_deref(), Some(NO_HANDLER));

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn slow_actions_expire_on_timeout() {
        let orch = orchestrator();
        let id = orch
            .store()
            .enqueue_immediate(
                NewQueueItem::immediate("Sniffer", MAC, None).metadata(json!({"timeout": 1})),
            )
            .unwrap();
        let cancel = CancellationToken::new();
        let handle = {
            let orch = orch.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { orch.run(cancel).await })
        };
        let item = wait_for(&orch, id, QueueStatus::Expired).await;
        assert_eq!(item.error_message.as_deref(), Some("timed out after 1s"));
        assert_eq!(item.retry_count, 1);
        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn outcome_for_a_closed_row_is_ignored() {
        let (tx, mut rx) = mpsc::channel(8);
        let orch = orchestrator().with_events(tx);
        let id = orch
            .store()
            .enqueue_immediate(NewQueueItem::immediate("PortScan", MAC, None))
            .unwrap();
        assert!(orch.store().claim(id).unwrap());
        orch.store()
            .update_status(id, QueueStatus::Expired, Some("timed out while running"), None)
            .unwrap();

        orch.report(id, "PortScan", Ok(Some("late".into()))).await;
        orch.report(id, "PortScan", Err(ActionError::Timeout(Duration::from_secs(1))))
            .await;

        let item = orch.store().get_item(id).unwrap().unwrap();
        assert_eq!(item.status, QueueStatus::Expired);
        assert_eq!(item.retry_count, 1);
        assert_eq!(item.error_message.as_deref(), Some("timed out while running"));
        assert!(item.result_summary.is_none());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn cancel_item_interrupts_running_handler() {
        let orch = orchestrator();
        let id = orch
            .store()
            .enqueue_immediate(NewQueueItem::immediate("Sniffer", MAC, None))
            .unwrap();
        let cancel = CancellationToken::new();
        let handle = {
            let orch = orch.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { orch.run(cancel).await })
        };

        wait_for(&orch, id, QueueStatus::Running).await;
        for _ in 0..200 {
            if orch.running_ids() == vec![id] {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(orch.cancel_item(id).await.unwrap());
        let item = wait_for(&orch, id, QueueStatus::Cancelled).await;
        assert_eq!(item.error_message.as_deref(), Some("cancelled by operator"));
        assert!(orch.running_ids().is_empty());

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn shutdown_cancels_in_flight_work() {
        let orch = orchestrator();
        let id = orch
            .store()
            .enqueue_immediate(NewQueueItem::immediate("Sniffer", MAC, None))
            .unwrap();
        let cancel = CancellationToken::new();
        let handle = {
            let orch = orch.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { orch.run(cancel).await })
        };
        wait_for(&orch, id, QueueStatus::Running).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(
            orch.store().get_item(id).unwrap().unwrap().status,
            QueueStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn overlapping_stats_refresh_is_skipped() {
        let orch = orchestrator();
        orch.store().update_ports_current(MAC, &[22, 80]).unwrap();
        let guard = orch.stats_flight.try_enter().unwrap();
        assert!(!orch.refresh_stats().await.unwrap());
        drop(guard);
        assert!(orch.refresh_stats().await.unwrap());
        assert_eq!(orch.store().get_livestats().unwrap().total_open_ports, 2);
    }

    #[tokio::test]
    async fn events_are_streamed() {
        let (tx, mut rx) = mpsc::channel(64);
        let orch = orchestrator().with_events(tx);
        let id = orch
            .store()
            .enqueue_immediate(NewQueueItem::immediate("PortScan", MAC, None))
            .unwrap();
        let cancel = CancellationToken::new();
        let handle = {
            let orch = orch.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { orch.run(cancel).await })
        };

        let mut started = false;
        let finished = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(event) = rx.recv().await {
                match event {
                    OrchestratorEvent::Started { id: got, .. } if got == id => started = true,
                    OrchestratorEvent::Finished { id: got, status, .. } if got == id => {
                        return status;
                    }
                    _ => {}
                }
            }
            QueueStatus::Failed
        })
        .await
        .unwrap();
        assert!(started);
        assert_eq!(finished, QueueStatus::Success);

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }
}
