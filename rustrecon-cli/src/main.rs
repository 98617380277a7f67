mod args;
mod config;
mod output;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use args::{ActionsCommand, Args, Command, QueueCommand, RunArgs};
use config::FileConfig;
use rustrecon_core::{
    ActionRegistry, CancellationToken, DryRunHandler, Orchestrator, OrchestratorEvent, Scheduler,
};
use rustrecon_db::{Store, SystemClock};
use rustrecon_types::{ActionCatalog, NewQueueItem};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = match args.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut cfg = config::load(args.config.as_deref())?;
    let db_path = cfg.db_path(args.db.as_deref());

    match args.command {
        Command::Run(ref run) => {
            cfg.apply_run_flags(run);
            run_orchestrator(&cfg, &db_path, run).await
        }
        Command::Queue(ref cmd) => queue_command(&open_store(&cfg, &db_path)?, cmd, args.json),
        Command::Hosts => {
            let hosts = open_store(&cfg, &db_path)?
                .list_hosts()
                .context("failed to list hosts")?;
            if args.json {
                output::print_json(&hosts)
            } else {
                output::print_hosts(&hosts);
                Ok(())
            }
        }
        Command::Stats { refresh } => {
            let store = open_store(&cfg, &db_path)?;
            if refresh {
                store
                    .recompute_livestats()
                    .context("failed to recompute live stats")?;
            }
            let stats = store
                .get_display_stats()
                .context("failed to read stats")?;
            if args.json {
                output::print_json(&stats)
            } else {
                output::print_stats(&stats);
                Ok(())
            }
        }
        Command::Actions(ref cmd) => actions_command(&open_store(&cfg, &db_path)?, cmd, args.json),
        Command::Maintain => {
            let report = maintain(&open_store(&cfg, &db_path)?, &cfg)?;
            if args.json {
                output::print_json(&report)
            } else {
                report.print();
                Ok(())
            }
        }
    }
}

fn open_store(cfg: &FileConfig, path: &Path) -> Result<Store> {
    Store::open_with(path, cfg.store.clone(), Arc::new(SystemClock))
        .with_context(|| format!("failed to open database '{}'", path.display()))
}

async fn run_orchestrator(cfg: &FileConfig, db_path: &Path, run: &RunArgs) -> Result<()> {
    let store = Arc::new(open_store(cfg, db_path)?);
    let scheduler = Scheduler::new(Arc::clone(&store), cfg.orchestrator.clone())
        .context("invalid orchestrator settings")?;

    let catalog = store
        .enabled_actions()
        .context("failed to load action catalog")?;
    let registry = if run.dry_run {
        DryRunHandler::registry_for(&catalog)
    } else {
        ActionRegistry::new()
    };
    if catalog.is_empty() {
        warn!("no enabled actions in the catalog; nothing will be scheduled");
    } else if registry.is_empty() {
        warn!(
            actions = catalog.len(),
            "no action handlers registered; claimed items will fail (use --dry-run to simulate)"
        );
    }

    let (tx, mut rx) = mpsc::channel(256);
    let orchestrator = Orchestrator::new(scheduler, store, registry).with_events(tx);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("ctrl-c received, shutting down"),
                Err(e) => warn!(error = %e, "failed to listen for ctrl-c"),
            }
            cancel.cancel();
        });
    }

    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                OrchestratorEvent::Tick(report) if !report.is_idle() => {
                    eprintln!(
                        "tick: promoted {} published {} queued {} globals {} \
                         expired {} retried {} purged {}",
                        report.promoted,
                        report.published,
                        report.queued,
                        report.globals_queued,
                        report.expired,
                        report.retried,
                        report.purged
                    );
                }
                OrchestratorEvent::Tick(_) => {}
                OrchestratorEvent::Started { id, action, mac } => {
                    eprintln!("[{id}] {action} -> {mac} started");
                }
                OrchestratorEvent::Finished { id, action, status } => {
                    eprintln!("[{id}] {action} {status}");
                }
                OrchestratorEvent::Error(e) => eprintln!("error: {e}"),
            }
        }
    });

    let result = orchestrator.run(cancel).await;
    drop(orchestrator);
    let _ = printer.await;
    result.context("orchestrator stopped with an error")
}

fn queue_command(store: &Store, cmd: &QueueCommand, json: bool) -> Result<()> {
    match cmd {
        QueueCommand::List { status } => {
            let items = store
                .list_action_queue(status)
                .context("failed to list queue")?;
            if json {
                return output::print_json(&items);
            }
            output::print_queue(&items);
        }
        QueueCommand::Upcoming => {
            let upcoming = store
                .get_upcoming_actions_summary()
                .context("failed to read upcoming actions")?;
            if json {
                return output::print_json(&upcoming);
            }
            output::print_upcoming(&upcoming);
        }
        QueueCommand::Next => {
            let next = store.get_next().context("failed to peek queue")?;
            if json {
                return output::print_json(&next);
            }
            match next {
                Some(item) => output::print_item(&item),
                None => println!("No pending work."),
            }
        }
        QueueCommand::Enqueue {
            action,
            mac,
            ip,
            port,
            priority,
            at,
        } => {
            let id = enqueue(store, action, mac, ip, *port, *priority, *at)?;
            if json {
                return output::print_json(&serde_json::json!({ "id": id }));
            }
            match id {
                Some(id) => println!("Queued {action} for {mac} as #{id}."),
                None => println!("{action} for {mac} is already scheduled."),
            }
        }
        QueueCommand::Cancel { id } => {
            let cancelled = store
                .cancel(*id, Some("cancelled by operator"))
                .with_context(|| format!("failed to cancel #{id}"))?;
            if json {
                return output::print_json(&serde_json::json!({ "id": id, "cancelled": cancelled }));
            }
            if cancelled {
                println!("Cancelled #{id}.");
            } else {
                println!("#{id} had already finished.");
            }
        }
        QueueCommand::History {
            action,
            mac,
            port,
            limit,
        } => {
            let history = store
                .attempt_history(action, mac, *port, *limit)
                .context("failed to read attempt history")?;
            if json {
                return output::print_json(&history);
            }
            output::print_history(&history);
        }
        QueueCommand::Status { mac } => {
            let statuses = store
                .last_statuses_for_mac(mac)
                .context("failed to read action statuses")?;
            if json {
                return output::print_json(&statuses);
            }
            output::print_statuses(mac, &statuses);
        }
    }
    Ok(())
}

/// Operator enqueue. Immediate rows are always inserted; deferred ones are
/// dropped when the same target already has an upcoming schedule.
fn enqueue(
    store: &Store,
    action: &str,
    mac: &str,
    ip: &str,
    port: Option<u16>,
    priority: Option<i32>,
    at: Option<i64>,
) -> Result<Option<i64>> {
    let mut request = match at {
        Some(run_at) => NewQueueItem::scheduled(action, mac, Some(ip), run_at),
        None => NewQueueItem::immediate(action, mac, Some(ip)),
    }
    .maybe_port(port)
    .trigger("cli");
    if let Some(priority) = priority {
        request = request.priority(priority);
    }
    if let Some(def) = store.get_action(action).context("failed to read catalog")? {
        request = request.max_retries(def.max_retries);
        if priority.is_none() {
            request = request.priority(def.priority);
        }
    }
    let id = if at.is_some() {
        store.enqueue_generic(&request)
    } else {
        store.enqueue_immediate(request).map(Some)
    };
    id.with_context(|| format!("failed to queue {action} for {mac}"))
}

fn actions_command(store: &Store, cmd: &ActionsCommand, json: bool) -> Result<()> {
    match cmd {
        ActionsCommand::List => {
            let actions = store.list_actions().context("failed to list actions")?;
            if json {
                return output::print_json(&actions);
            }
            output::print_actions(&actions);
        }
        ActionsCommand::Sync { file } => {
            let content = std::fs::read_to_string(file)
                .with_context(|| format!("failed to read catalog '{}'", file.display()))?;
            let catalog: ActionCatalog = toml::from_str(&content)
                .with_context(|| format!("failed to parse catalog '{}'", file.display()))?;
            if catalog.actions.is_empty() {
                bail!("catalog '{}' has no [[action]] entries", file.display());
            }
            let synced = store
                .sync_actions(&catalog.actions)
                .context("failed to sync catalog")?;
            if json {
                return output::print_json(&serde_json::json!({ "synced": synced }));
            }
            println!("Synced {synced} action(s) from {}.", file.display());
        }
        ActionsCommand::Enable { name } | ActionsCommand::Disable { name } => {
            let enabled = matches!(cmd, ActionsCommand::Enable { .. });
            store
                .set_action_enabled(name, enabled)
                .with_context(|| format!("failed to update action '{name}'"))?;
            if json {
                return output::print_json(&serde_json::json!({ "name": name, "enabled": enabled }));
            }
            println!("{name}: {}", if enabled { "enabled" } else { "disabled" });
        }
        ActionsCommand::Remove { name } => {
            let removed = store
                .delete_action(name)
                .with_context(|| format!("failed to remove action '{name}'"))?;
            if json {
                return output::print_json(&serde_json::json!({ "name": name, "removed": removed }));
            }
            if removed {
                println!("Removed {name}.");
            } else {
                println!("{name} is not in the catalog.");
            }
        }
    }
    Ok(())
}

/// Counts from one `rustrecon maintain` pass.
#[derive(Debug, Default, Serialize)]
struct MaintenanceReport {
    expired_pending: usize,
    expired_running: usize,
    purged: usize,
    vulnerability_duplicates: usize,
    vulnerability_history_fixed: usize,
    cpes_migrated: usize,
}

impl MaintenanceReport {
    fn print(&self) {
        println!("{:<28} {}", "expired pending", self.expired_pending);
        println!("{:<28} {}", "expired running", self.expired_running);
        println!("{:<28} {}", "purged", self.purged);
        println!("{:<28} {}", "vulnerability duplicates", self.vulnerability_duplicates);
        println!("{:<28} {}", "vulnerability history fixed", self.vulnerability_history_fixed);
        println!("{:<28} {}", "cpes migrated", self.cpes_migrated);
    }
}

fn maintain(store: &Store, cfg: &FileConfig) -> Result<MaintenanceReport> {
    let orch = &cfg.orchestrator;
    let report = MaintenanceReport {
        expired_pending: store
            .expire_overdue_pending()
            .context("failed to expire pending rows")?,
        expired_running: store
            .expire_stale_running(orch.default_timeout_secs, orch.stale_grace_secs())
            .context("failed to expire running rows")?,
        purged: store
            .purge_completed(orch.purge_after_secs)
            .context("failed to purge finished rows")?,
        vulnerability_duplicates: store
            .cleanup_vulnerability_duplicates()
            .context("failed to remove duplicate vulnerabilities")?,
        vulnerability_history_fixed: store
            .fix_vulnerability_history_nulls()
            .context("failed to repair vulnerability history")?,
        cpes_migrated: store
            .migrate_cpe_from_vulnerabilities()
            .context("failed to migrate CPEs")?,
    };
    info!(?report, "maintenance finished");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustrecon_types::{ActionDefinition, QueueStatus};

    const MAC: &str = "aa:bb:cc:dd:ee:ff";

    fn store() -> Store {
        Store::open_in_memory().unwrap()
    }

    #[test]
    fn enqueue_uses_catalog_defaults() {
        let store = store();
        let mut def = ActionDefinition::new("SSHBrute");
        def.priority = 7;
        def.max_retries = 5;
        store.sync_actions(&[def]).unwrap();

        let id = enqueue(&store, "SSHBrute", MAC, "10.0.0.5", Some(22), None, None)
            .unwrap()
            .unwrap();
        let item = store.get_item(id).unwrap().unwrap();
        assert_eq!(item.status, QueueStatus::Pending);
        assert_eq!(item.priority, 7);
        assert_eq!(item.max_retries, 5);
        assert_eq!(item.port, Some(22));
        assert_eq!(item.trigger_source.as_deref(), Some("cli"));
    }

    #[test]
    fn explicit_priority_wins_over_catalog() {
        let store = store();
        let mut def = ActionDefinition::new("PortScan");
        def.priority = 7;
        store.sync_actions(&[def]).unwrap();
        let id = enqueue(&store, "PortScan", MAC, "10.0.0.5", None, Some(90), None)
            .unwrap()
            .unwrap();
        assert_eq!(store.get_item(id).unwrap().unwrap().priority, 90);
    }

    #[test]
    fn deferred_enqueue_is_deduplicated() {
        let store = store();
        let at = store.now() + 3_600;
        let deferred = |store: &Store| {
            enqueue(store, "PortScan", MAC, "10.0.0.5", None, None, Some(at)).unwrap()
        };
        let first = deferred(&store);
        let second = deferred(&store);
        assert!(first.is_some());
        assert!(second.is_none());
        let item = store.get_item(first.unwrap()).unwrap().unwrap();
        assert_eq!(item.status, QueueStatus::Scheduled);
        assert_eq!(item.scheduled_for, Some(at));
    }

    #[test]
    fn maintenance_on_empty_store_is_a_no_op() {
        let report = maintain(&store(), &FileConfig::default()).unwrap();
        assert_eq!(report.expired_pending, 0);
        assert_eq!(report.purged, 0);
        assert_eq!(report.cpes_migrated, 0);
    }
}
