use std::sync::Arc;

use rustrecon_db::{DbError, Store};
use rustrecon_types::{ActionDefinition, Host, NewQueueItem};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::backoff::RetryPolicy;
use crate::config::OrchestratorConfig;
use crate::error::OrchestratorError;
use crate::requirement::Requirement;
use crate::trigger::{EvalTarget, Trigger};

/// What one scheduler pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub promoted: usize,
    pub published: usize,
    pub globals_queued: usize,
    pub queued: usize,
    pub expired: usize,
    pub retried: usize,
    pub purged: usize,
}

impl TickReport {
    pub fn is_idle(&self) -> bool {
        *self == TickReport::default()
    }
}

/// An enabled catalog action with its conditions parsed.
#[derive(Debug, Clone)]
struct Planned {
    def: ActionDefinition,
    trigger: Trigger,
    requires: Option<Requirement>,
}

/// Turns catalog triggers and inventory state into queue rows.
///
/// Stateless between ticks: every decision is re-derived from the store.
#[derive(Debug)]
pub struct Scheduler {
    store: Arc<Store>,
    config: OrchestratorConfig,
    controller_mac: String,
    retry: RetryPolicy,
}

impl Scheduler {
    pub fn new(store: Arc<Store>, config: OrchestratorConfig) -> Result<Self, OrchestratorError> {
        config.validate()?;
        let controller_mac = config.controller_mac()?;
        store.ensure_host(&controller_mac)?;
        let retry = RetryPolicy::from_config(&config);
        Ok(Self {
            store,
            config,
            controller_mac,
            retry,
        })
    }

    pub fn controller_mac(&self) -> &str {
        &self.controller_mac
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// One full pass: promote due rows, publish interval runs, queue global
    /// start actions, evaluate host triggers, then maintain the queue.
    pub fn tick(&self) -> Result<TickReport, OrchestratorError> {
        let mut report = TickReport {
            promoted: self.store.promote_due_scheduled()?,
            ..TickReport::default()
        };

        let plan = self.load_plan()?;
        let hosts = self.store.list_hosts()?;
        report.published = self.publish_intervals(&plan, &hosts)?;
        report.globals_queued = self.queue_global_start(&plan)?;
        report.queued = self.evaluate_hosts(&plan, &hosts);
        self.maintain(&mut report)?;

        if !report.is_idle() {
            debug!(?report, "scheduler tick");
        }
        Ok(report)
    }

    fn load_plan(&self) -> Result<Vec<Planned>, OrchestratorError> {
        let mut plan = Vec::new();
        for def in self.store.enabled_actions()? {
            let Some(raw) = def.trigger.as_deref().filter(|t| !t.trim().is_empty()) else {
                continue;
            };
            let trigger = match raw.parse::<Trigger>() {
                Ok(trigger) => trigger,
                Err(e) => {
                    warn!(action = %def.name, error = %e, "skipping action with bad trigger");
                    continue;
                }
            };
            let requires = match Requirement::parse(def.requires.as_deref().unwrap_or_default()) {
                Ok(requires) => requires,
                Err(e) => {
                    warn!(action = %def.name, error = %e, "skipping action with bad requirement");
                    continue;
                }
            };
            plan.push(Planned {
                def,
                trigger,
                requires,
            });
        }
        Ok(plan)
    }

    fn metadata(&self, def: &ActionDefinition, global: bool) -> serde_json::Value {
        json!({
            "trigger": def.trigger.clone().unwrap_or_default(),
            "requirements": def.requires.clone().unwrap_or_default(),
            "timeout": def.timeout_secs,
            "is_global": global,
        })
    }

    /// Keep one upcoming row per interval action and target, due one
    /// interval after the last completion (or now if it never ran).
    fn publish_intervals(&self, plan: &[Planned], hosts: &[Host]) -> Result<usize, DbError> {
        let now = self.store.now();
        let mut published = 0;
        for planned in plan {
            let Some(interval) = planned.trigger.interval() else {
                continue;
            };
            let def = &planned.def;
            let targets: Vec<(&str, Option<&str>)> = if def.is_global() {
                vec![(self.controller_mac.as_str(), None)]
            } else {
                hosts
                    .iter()
                    .filter(|h| h.alive && h.mac_address != self.controller_mac)
                    .map(|h| (h.mac_address.as_str(), h.primary_ip()))
                    .collect()
            };
            for (mac, ip) in targets {
                if self.store.has_active(&def.name, mac, None)? {
                    continue;
                }
                let scope = if def.is_global() { None } else { Some(mac) };
                let run_at = self
                    .store
                    .last_completion(&def.name, scope)?
                    .map_or(now, |last| last.saturating_add(interval as i64));
                let mut metadata = self.metadata(def, def.is_global());
                metadata["interval"] = json!(interval);
                let request = NewQueueItem::scheduled(&def.name, mac, ip, run_at)
                    .priority(def.priority)
                    .tags(def.tags.clone())
                    .metadata(metadata)
                    .max_retries(def.max_retries);
                if self.store.enqueue_scheduled(request)? {
                    debug!(action = %def.name, mac, run_at, "interval run published");
                    published += 1;
                }
            }
        }
        Ok(published)
    }

    /// Global `on_start` actions run once against the controller.
    fn queue_global_start(&self, plan: &[Planned]) -> Result<usize, DbError> {
        let now = self.store.now();
        let mut queued = 0;
        for planned in plan {
            let def = &planned.def;
            if !def.is_global() || planned.trigger != Trigger::OnStart {
                continue;
            }
            if self.store.last_completion(&def.name, None)?.is_some() {
                continue;
            }
            let request = NewQueueItem::immediate(&def.name, &self.controller_mac, None)
                .priority(def.priority)
                .max_retries(def.max_retries)
                .expires_at(now.saturating_add(def.timeout_secs as i64))
                .trigger(def.trigger.as_deref().unwrap_or("on_start"))
                .tags(def.tags.clone())
                .metadata(self.metadata(def, true));
            if let Some(id) = self.store.enqueue_unless_active(&request)? {
                info!(id, action = %def.name, "global action queued");
                queued += 1;
            }
        }
        Ok(queued)
    }

    /// Evaluate every per-host action against every host except the
    /// controller. A failure on one pair is logged and does not stop the others.
    fn evaluate_hosts(&self, plan: &[Planned], hosts: &[Host]) -> usize {
        let mut queued = 0;
        for host in hosts.iter().filter(|h| h.mac_address != self.controller_mac) {
            for planned in plan {
                if planned.def.is_global() || planned.trigger.interval().is_some() {
                    continue;
                }
                match self.consider(planned, host) {
                    Ok(true) => queued += 1,
                    Ok(false) => {}
                    Err(e) => warn!(
                        action = %planned.def.name,
                        mac = %host.mac_address,
                        error = %e,
                        "trigger evaluation failed"
                    ),
                }
            }
        }
        queued
    }

    fn consider(&self, planned: &Planned, host: &Host) -> Result<bool, DbError> {
        let def = &planned.def;
        let target = EvalTarget {
            store: &self.store,
            host,
            action: &def.name,
        };
        if !planned.trigger.evaluate(&target)? {
            return Ok(false);
        }
        if let Some(requires) = &planned.requires
            && !requires.evaluate(&target)?
        {
            return Ok(false);
        }
        let (port, service) = self.resolve_target(def, host)?;
        if !self.should_queue(def, &host.mac_address, port)? {
            return Ok(false);
        }

        let now = self.store.now();
        let mut metadata = self.metadata(def, false);
        metadata["ports_snapshot"] = json!(host.ports);
        let mut request = NewQueueItem::immediate(&def.name, &host.mac_address, host.primary_ip())
            .maybe_port(port)
            .priority(def.priority)
            .max_retries(def.max_retries)
            .expires_at(now.saturating_add(def.timeout_secs as i64))
            .trigger(def.trigger.as_deref().unwrap_or_default())
            .tags(def.tags.clone())
            .metadata(metadata);
        request.service = service;
        request.hostname = host.primary_hostname().map(str::to_string);

        match self.store.enqueue_unless_active(&request)? {
            Some(id) => {
                info!(
                    id,
                    action = %def.name,
                    mac = %host.mac_address,
                    port = ?port,
                    "action queued"
                );
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Port and service an action should hit on a host. A listed service
    /// that is open wins; otherwise the catalog port if the host has it.
    fn resolve_target(
        &self,
        def: &ActionDefinition,
        host: &Host,
    ) -> Result<(Option<u16>, Option<String>), DbError> {
        for service in &def.services {
            if let Some(port) = self.store.open_service_port(&host.mac_address, service)? {
                return Ok((Some(port), Some(service.to_ascii_lowercase())));
            }
        }
        Ok((def.port.filter(|p| host.has_port(*p)), None))
    }

    /// Duplicate, retry-flag, cooldown and rate-limit guards for a trigger hit.
    fn should_queue(
        &self,
        def: &ActionDefinition,
        mac: &str,
        port: Option<u16>,
    ) -> Result<bool, DbError> {
        if self.store.has_active(&def.name, mac, port)? {
            return Ok(false);
        }

        if let Some(last) = self.store.attempt_history(&def.name, mac, port, 1)?.first() {
            // Failures come back only through the retry policy.
            if last.status.is_failure() {
                return Ok(false);
            }
            if last.status == rustrecon_types::QueueStatus::Success && !self.config.retry_success {
                return Ok(false);
            }
        }

        let now = self.store.now();
        if def.cooldown_secs > 0
            && let Some(last) = self.store.last_completion(&def.name, Some(mac))?
            && now - last < def.cooldown_secs as i64
        {
            return Ok(false);
        }

        if let Some((limit, window)) = def.parsed_rate_limit() {
            let since = now - window as i64;
            if self.store.count_created_since(&def.name, Some(mac), since)? >= limit {
                debug!(action = %def.name, mac, "rate limited");
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Expire overdue and stale rows, schedule retries, purge old history.
    fn maintain(&self, report: &mut TickReport) -> Result<(), DbError> {
        report.expired = self.store.expire_overdue_pending()?
            + self.store.expire_stale_running(
                self.config.default_timeout_secs,
                self.config.stale_grace_secs(),
            )?;
        report.retried = self.schedule_retries()?;
        report.purged = self.store.purge_completed(self.config.purge_after_secs)?;
        Ok(())
    }

    fn schedule_retries(&self) -> Result<usize, DbError> {
        if !self.retry.enabled {
            return Ok(0);
        }
        let now = self.store.now();
        let mut retried = 0;
        for item in self.store.retry_candidates()? {
            let Some(request) = self.retry.retry_for(&item, now) else {
                continue;
            };
            if let Some(id) = self.store.enqueue_unless_active(&request)? {
                info!(
                    id,
                    retry_of = item.id,
                    action = %item.action_name,
                    mac = %item.mac_address,
                    attempt = item.retry_count + 1,
                    run_at = ?request.scheduled_for,
                    "retry scheduled"
                );
                retried += 1;
            }
        }
        Ok(retried)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustrecon_db::{ManualClock, StoreConfig};
    use rustrecon_types::{ActionScope, HostUpdate, QueueStatus};

    const CTRL: &str = "b8:27:eb:00:00:01";
    const MAC: &str = "aa:bb:cc:dd:ee:ff";
    const T0: i64 = 1_700_000_000;

    fn setup(config: OrchestratorConfig) -> (Arc<Store>, Scheduler, ManualClock) {
        let clock = ManualClock::new(T0);
        let store = Arc::new(
            Store::open_in_memory_with(StoreConfig::default(), Arc::new(clock.clone())).unwrap(),
        );
        let config = OrchestratorConfig {
            controller_mac: Some(CTRL.into()),
            ..config
        };
        let scheduler = Scheduler::new(Arc::clone(&store), config).unwrap();
        (store, scheduler, clock)
    }

    fn action(name: &str, trigger: &str) -> ActionDefinition {
        let mut def = ActionDefinition::new(name);
        def.trigger = Some(trigger.into());
        def
    }

    fn alive_host(store: &Store, mac: &str, ip: &str, ports: &[u16]) {
        store
            .update_host(mac, &HostUpdate::default().ip(ip).alive(true))
            .unwrap();
        store.update_ports_current(mac, ports).unwrap();
    }

    fn rows(store: &Store, action: &str) -> Vec<rustrecon_types::QueueItem> {
        store
            .list_action_queue(&[])
            .unwrap()
            .into_iter()
            .filter(|i| i.action_name == action)
            .collect()
    }

    fn finish(store: &Store, id: i64, status: QueueStatus) {
        store.update_status(id, QueueStatus::Running, None, None).unwrap();
        let error = (status != QueueStatus::Success).then_some("boom");
        store.update_status(id, status, error, None).unwrap();
    }

    #[test]
    fn new_rejects_missing_controller() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let err = Scheduler::new(store, OrchestratorConfig::default()).unwrap_err();
        assert!(matches!(err, OrchestratorError::Config(_)));
    }

    #[test]
    fn service_trigger_queues_once_with_resolved_port() {
        let (store, scheduler, _clock) = setup(OrchestratorConfig::default());
        alive_host(&store, MAC, "10.0.0.5", &[22, 80]);
        let mut ssh = action("SSHBrute", "on_service:ssh");
        ssh.services = vec!["ssh".into()];
        ssh.priority = 70;
        store.sync_actions(&[ssh]).unwrap();

        let report = scheduler.tick().unwrap();
        assert_eq!(report.queued, 1);
        let queued = rows(&store, "SSHBrute");
        assert_eq!(queued.len(), 1);
        let item = &queued[0];
        assert_eq!(item.status, QueueStatus::Pending);
        assert_eq!(item.port, Some(22));
        assert_eq!(item.service.as_deref(), Some("ssh"));
        assert_eq!(item.ip.as_deref(), Some("10.0.0.5"));
        assert_eq!(item.priority, 70);
        assert_eq!(item.metadata_timeout(), Some(300));

        assert_eq!(scheduler.tick().unwrap().queued, 0);
        assert_eq!(rows(&store, "SSHBrute").len(), 1);
    }

    #[test]
    fn requirements_gate_queueing() {
        let (store, scheduler, _clock) = setup(OrchestratorConfig::default());
        alive_host(&store, MAC, "10.0.0.5", &[445]);
        let mut smb = action("SMBBrute", "on_new_port:445");
        smb.requires = Some("PortScan:success".into());
        smb.port = Some(445);
        store.sync_actions(&[smb]).unwrap();

        assert_eq!(scheduler.tick().unwrap().queued, 0);
        let id = store
            .enqueue_immediate(NewQueueItem::immediate("PortScan", MAC, None))
            .unwrap();
        finish(&store, id, QueueStatus::Success);
        assert_eq!(scheduler.tick().unwrap().queued, 1);
        assert_eq!(rows(&store, "SMBBrute")[0].port, Some(445));
    }

    #[test]
    fn success_blocks_requeue_unless_allowed_and_cooldown_applies() {
        let (store, scheduler, clock) = setup(OrchestratorConfig {
            retry_success: true,
            ..Default::default()
        });
        alive_host(&store, MAC, "10.0.0.5", &[80]);
        let mut web = action("WebEnum", "on_web_service");
        web.cooldown_secs = 600;
        store.sync_actions(&[web]).unwrap();

        scheduler.tick().unwrap();
        let id = rows(&store, "WebEnum")[0].id;
        finish(&store, id, QueueStatus::Success);

        clock.advance(60);
        assert_eq!(scheduler.tick().unwrap().queued, 0, "inside cooldown");
        clock.advance(600);
        assert_eq!(scheduler.tick().unwrap().queued, 1, "cooldown over");

        let (store, scheduler, clock) = setup(OrchestratorConfig::default());
        alive_host(&store, MAC, "10.0.0.5", &[80]);
        store.sync_actions(&[action("WebEnum", "on_web_service")]).unwrap();
        scheduler.tick().unwrap();
        let id = rows(&store, "WebEnum")[0].id;
        finish(&store, id, QueueStatus::Success);
        clock.advance(3600);
        assert_eq!(scheduler.tick().unwrap().queued, 0, "retry_success is off");
    }

    #[test]
    fn rate_limit_counts_recent_rows() {
        let (store, scheduler, clock) = setup(OrchestratorConfig {
            retry_success: true,
            ..Default::default()
        });
        alive_host(&store, MAC, "10.0.0.5", &[80]);
        let mut web = action("WebEnum", "on_host_alive");
        web.rate_limit = Some("2/3600".into());
        store.sync_actions(&[web]).unwrap();

        for _ in 0..2 {
            assert_eq!(scheduler.tick().unwrap().queued, 1);
            let id = rows(&store, "WebEnum")
                .into_iter()
                .find(|i| i.status == QueueStatus::Pending)
                .unwrap()
                .id;
            finish(&store, id, QueueStatus::Success);
            clock.advance(10);
        }
        assert_eq!(scheduler.tick().unwrap().queued, 0);
        clock.advance(3600);
        assert_eq!(scheduler.tick().unwrap().queued, 1);
    }

    #[test]
    fn failures_retry_with_backoff_until_exhausted() {
        let (store, scheduler, clock) = setup(OrchestratorConfig::default());
        alive_host(&store, MAC, "10.0.0.5", &[22]);
        let mut ssh = action("SSHBrute", "on_service:ssh");
        ssh.services = vec!["ssh".into()];
        ssh.max_retries = 2;
        store.sync_actions(&[ssh]).unwrap();

        scheduler.tick().unwrap();
        let first = rows(&store, "SSHBrute")[0].id;
        finish(&store, first, QueueStatus::Failed);

        let report = scheduler.tick().unwrap();
        assert_eq!(report.retried, 1);
        assert_eq!(report.queued, 0, "trigger must not duplicate the retry");
        let retry = rows(&store, "SSHBrute")
            .into_iter()
            .find(|i| i.status == QueueStatus::Scheduled)
            .unwrap();
        assert_eq!(retry.scheduled_for, Some(T0 + 60 * 2));
        assert_eq!(retry.retry_count, 1);
        assert_eq!(retry.port, Some(22));
        assert_eq!(retry.metadata.as_ref().unwrap()["retry_of"], json!(first));

        clock.advance(120);
        assert_eq!(scheduler.tick().unwrap().promoted, 1);
        finish(&store, retry.id, QueueStatus::Failed);
        let exhausted = store.get_item(retry.id).unwrap().unwrap();
        assert_eq!(exhausted.retry_count, 2);

        clock.advance(3600);
        let report = scheduler.tick().unwrap();
        assert_eq!(report.retried, 0);
        assert_eq!(report.queued, 0);
        assert!(
            rows(&store, "SSHBrute")
                .iter()
                .all(|i| i.status == QueueStatus::Failed)
        );
    }

    #[test]
    fn retries_disabled_leave_failures_alone() {
        let (store, scheduler, _clock) = setup(OrchestratorConfig {
            retry_failed: false,
            ..Default::default()
        });
        let id = store
            .enqueue_immediate(NewQueueItem::immediate("Recon", MAC, None))
            .unwrap();
        finish(&store, id, QueueStatus::Failed);
        assert_eq!(scheduler.tick().unwrap().retried, 0);
        assert_eq!(rows(&store, "Recon").len(), 1);
    }

    #[test]
    fn interval_actions_publish_one_upcoming_row() {
        let (store, scheduler, clock) = setup(OrchestratorConfig::default());
        alive_host(&store, MAC, "10.0.0.5", &[]);
        alive_host(&store, "aa:bb:cc:dd:ee:01", "10.0.0.6", &[]);
        store.set_alive("aa:bb:cc:dd:ee:01", false).unwrap();
        let mut sweep = action("NetworkScanner", "on_interval:600");
        sweep.scope = ActionScope::Global;
        store
            .sync_actions(&[sweep, action("Ping", "on_interval:300")])
            .unwrap();

        let report = scheduler.tick().unwrap();
        // Global sweep on the controller plus Ping on the one alive host.
        assert_eq!(report.published, 2);
        assert_eq!(report.promoted, 0);

        let report = scheduler.tick().unwrap();
        assert_eq!(report.published, 0);
        assert_eq!(report.promoted, 2, "both rows were due immediately");

        let sweep_row = rows(&store, "NetworkScanner").remove(0);
        assert_eq!(sweep_row.mac_address, CTRL);
        assert_eq!(sweep_row.scheduled_for, Some(T0));
        assert_eq!(sweep_row.metadata.as_ref().unwrap()["interval"], json!(600));
        assert!(rows(&store, "Ping").iter().all(|i| i.mac_address == MAC));

        finish(&store, sweep_row.id, QueueStatus::Success);
        clock.advance(5);
        assert_eq!(scheduler.tick().unwrap().published, 1);
        let next = rows(&store, "NetworkScanner")
            .into_iter()
            .find(|i| i.status == QueueStatus::Scheduled)
            .unwrap();
        assert_eq!(next.scheduled_for, Some(T0 + 600));
    }

    #[test]
    fn global_on_start_runs_once() {
        let (store, scheduler, _clock) = setup(OrchestratorConfig::default());
        let mut boot = action("Bootstrap", "on_start");
        boot.scope = ActionScope::Global;
        store.sync_actions(&[boot]).unwrap();

        assert_eq!(scheduler.tick().unwrap().globals_queued, 1);
        assert_eq!(scheduler.tick().unwrap().globals_queued, 0);
        let id = rows(&store, "Bootstrap")[0].id;
        assert_eq!(rows(&store, "Bootstrap")[0].mac_address, CTRL);
        finish(&store, id, QueueStatus::Success);
        assert_eq!(scheduler.tick().unwrap().globals_queued, 0);
        assert_eq!(rows(&store, "Bootstrap").len(), 1);
    }

    #[test]
    fn bad_catalog_entries_are_skipped() {
        let (store, scheduler, _clock) = setup(OrchestratorConfig::default());
        alive_host(&store, MAC, "10.0.0.5", &[80]);
        let mut broken = action("Broken", "on_alive");
        broken.requires = Some("{oops".into());
        store
            .sync_actions(&[action("Weird", "on_moon_phase"), broken, action("Ok", "on_alive")])
            .unwrap();
        let report = scheduler.tick().unwrap();
        assert_eq!(report.queued, 1);
        assert_eq!(rows(&store, "Ok").len(), 1);
    }

    #[test]
    fn maintenance_expires_and_purges() {
        let (store, scheduler, clock) = setup(OrchestratorConfig {
            retry_failed: false,
            ..Default::default()
        });
        let stale = store
            .enqueue_immediate(
                NewQueueItem::immediate("Sniffer", MAC, None).metadata(json!({"timeout": 30})),
            )
            .unwrap();
        store.update_status(stale, QueueStatus::Running, None, None).unwrap();
        store
            .enqueue_immediate(NewQueueItem::immediate("Recon", MAC, None).expires_at(T0 + 10))
            .unwrap();

        clock.advance(60);
        assert_eq!(scheduler.tick().unwrap().expired, 2);
        assert_eq!(
            store.get_item(stale).unwrap().unwrap().status,
            QueueStatus::Expired
        );

        clock.advance(8 * 24 * 3600);
        assert_eq!(scheduler.tick().unwrap().purged, 2);
    }

    #[test]
    fn stale_sweep_waits_a_tick_past_the_timeout() {
        let (store, scheduler, clock) = setup(OrchestratorConfig {
            retry_failed: false,
            ..Default::default()
        });
        let id = store
            .enqueue_immediate(
                NewQueueItem::immediate("Sniffer", MAC, None).metadata(json!({"timeout": 30})),
            )
            .unwrap();
        assert!(store.claim(id).unwrap());

        clock.advance(31);
        assert_eq!(scheduler.tick().unwrap().expired, 0);
        assert_eq!(store.get_item(id).unwrap().unwrap().status, QueueStatus::Running);

        clock.advance(5);
        assert_eq!(scheduler.tick().unwrap().expired, 1);
        assert_eq!(store.get_item(id).unwrap().unwrap().status, QueueStatus::Expired);
    }

    #[test]
    fn presence_actions_alternate_with_liveness() {
        let (store, scheduler, clock) = setup(OrchestratorConfig {
            retry_success: true,
            ..Default::default()
        });
        alive_host(&store, MAC, "10.0.0.5", &[]);
        store
            .sync_actions(&[
                action("PresenceJoin", "on_join"),
                action("PresenceLeave", "on_leave"),
            ])
            .unwrap();

        assert_eq!(scheduler.tick().unwrap().queued, 1);
        let join = rows(&store, "PresenceJoin").remove(0).id;
        finish(&store, join, QueueStatus::Success);
        clock.advance(10);
        assert_eq!(scheduler.tick().unwrap().queued, 0);

        store.set_alive(MAC, false).unwrap();
        assert_eq!(scheduler.tick().unwrap().queued, 1);
        let leave = rows(&store, "PresenceLeave");
        assert_eq!(leave.len(), 1);
        finish(&store, leave[0].id, QueueStatus::Success);
        clock.advance(10);
        assert_eq!(scheduler.tick().unwrap().queued, 0);

        store.set_alive(MAC, true).unwrap();
        assert_eq!(scheduler.tick().unwrap().queued, 1);
        assert_eq!(rows(&store, "PresenceJoin").len(), 2);
    }
}
