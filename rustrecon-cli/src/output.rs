use std::collections::BTreeMap;

use anyhow::Result;
use chrono::DateTime;
use rustrecon_types::{
    ActionDefinition, AttemptRecord, DisplayStats, Host, QueueItem, StatusSnapshot, UpcomingAction,
};
use serde::Serialize;

/// Epoch seconds as `YYYY-MM-DD HH:MM:SS` UTC.
pub fn format_ts(ts: i64) -> String {
    DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ts.to_string())
}

fn format_opt_ts(ts: Option<i64>) -> String {
    ts.map(format_ts).unwrap_or_else(|| "-".to_string())
}

fn dash(value: Option<&str>) -> &str {
    value.filter(|v| !v.is_empty()).unwrap_or("-")
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{cut}...")
    }
}

pub fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn print_queue(items: &[QueueItem]) {
    if items.is_empty() {
        println!("Queue is empty.");
        return;
    }
    println!(
        "{:<6} {:<20} {:<18} {:<6} {:<10} {:<5} {:<7} {:<20} NOTE",
        "ID", "ACTION", "MAC", "PORT", "STATUS", "PRIO", "RETRY", "WHEN"
    );
    for item in items {
        let when = item
            .completed_at
            .or(item.started_at)
            .or(item.scheduled_for)
            .unwrap_or(item.created_at);
        let note = item
            .error_message
            .as_deref()
            .or(item.result_summary.as_deref())
            .unwrap_or("");
        println!(
            "{:<6} {:<20} {:<18} {:<6} {:<10} {:<5} {:<7} {:<20} {}",
            item.id,
            truncate(&item.action_name, 20),
            item.mac_address,
            item.port.map(|p| p.to_string()).unwrap_or_else(|| "-".into()),
            item.status.as_str(),
            item.priority_effective,
            format!("{}/{}", item.retry_count, item.max_retries),
            format_ts(when),
            truncate(note, 48),
        );
    }
}

pub fn print_upcoming(upcoming: &[UpcomingAction]) {
    if upcoming.is_empty() {
        println!("Nothing scheduled.");
        return;
    }
    println!("{:<24} {:<20} COUNT", "ACTION", "NEXT RUN");
    for u in upcoming {
        println!(
            "{:<24} {:<20} {}",
            truncate(&u.action_name, 24),
            format_ts(u.next_run_at),
            u.scheduled_count
        );
    }
}

pub fn print_item(item: &QueueItem) {
    println!("id:         {}", item.id);
    println!("action:     {}", item.action_name);
    println!("target:     {} ({})", item.mac_address, dash(item.ip.as_deref()));
    if let Some(port) = item.port {
        println!("port:       {port}");
    }
    if let Some(service) = item.service.as_deref() {
        println!("service:    {service}");
    }
    println!("status:     {}", item.status);
    println!(
        "priority:   {} (effective {})",
        item.priority, item.priority_effective
    );
    println!("retries:    {}/{}", item.retry_count, item.max_retries);
    println!("created:    {}", format_ts(item.created_at));
    println!("scheduled:  {}", format_opt_ts(item.scheduled_for));
    println!("expires:    {}", format_opt_ts(item.expires_at));
    println!("trigger:    {}", dash(item.trigger_source.as_deref()));
}

pub fn print_history(history: &[AttemptRecord]) {
    if history.is_empty() {
        println!("No attempts recorded.");
        return;
    }
    println!("{:<6} {:<10} {:<7} {:<20} NOTE", "ID", "STATUS", "RETRY", "AT");
    for a in history {
        let note = a
            .error_message
            .as_deref()
            .or(a.result_summary.as_deref())
            .unwrap_or("");
        println!(
            "{:<6} {:<10} {:<7} {:<20} {}",
            a.id,
            a.status.as_str(),
            format!("{}/{}", a.retry_count, a.max_retries),
            format_ts(a.at),
            truncate(note, 60),
        );
    }
}

pub fn print_statuses(mac: &str, statuses: &BTreeMap<String, StatusSnapshot>) {
    if statuses.is_empty() {
        println!("No actions recorded for {mac}.");
        return;
    }
    println!("{:<24} {:<10} RAW", "ACTION", "STATUS");
    for (action, snap) in statuses {
        println!("{:<24} {:<10} {}", truncate(action, 24), snap.status.as_str(), snap.raw);
    }
}

pub fn print_hosts(hosts: &[Host]) {
    if hosts.is_empty() {
        println!("No hosts known.");
        return;
    }
    println!(
        "{:<18} {:<16} {:<24} {:<6} {:<20} PORTS",
        "MAC", "IP", "HOSTNAME", "ALIVE", "LAST SEEN"
    );
    for h in hosts {
        let ports = h
            .ports
            .iter()
            .map(u16::to_string)
            .collect::<Vec<_>>()
            .join(",");
        println!(
            "{:<18} {:<16} {:<24} {:<6} {:<20} {}",
            h.mac_address,
            dash(h.primary_ip()),
            truncate(dash(h.primary_hostname()), 24),
            if h.alive { "yes" } else { "no" },
            format_opt_ts(h.last_seen),
            truncate(&ports, 40),
        );
    }
}

pub fn print_stats(stats: &DisplayStats) {
    let rows: [(&str, u64); 10] = [
        ("alive hosts", stats.live.alive_hosts_count),
        ("known hosts", stats.live.all_known_hosts_count),
        ("open ports", stats.live.total_open_ports),
        ("vulnerabilities", stats.live.vulnerabilities_count),
        ("credentials", stats.credentials_count),
        ("actions", stats.actions_count),
        ("zombies", stats.zombie_count),
        ("pending", stats.pending_count),
        ("running", stats.running_count),
        ("scheduled", stats.scheduled_count),
    ];
    for (label, value) in rows {
        println!("{label:<16} {value}");
    }
    println!("{:<16} {}", "updated", format_ts(stats.updated_at));
}

pub fn print_actions(actions: &[ActionDefinition]) {
    if actions.is_empty() {
        println!("Catalog is empty. Use `rustrecon actions sync <file>` to load one.");
        return;
    }
    println!(
        "{:<24} {:<4} {:<7} {:<5} {:<8} {:<6} TRIGGER",
        "NAME", "ON", "SCOPE", "PRIO", "TIMEOUT", "PORT"
    );
    for a in actions {
        println!(
            "{:<24} {:<4} {:<7} {:<5} {:<8} {:<6} {}",
            truncate(&a.name, 24),
            if a.enabled { "yes" } else { "no" },
            a.scope.to_string(),
            a.priority,
            format!("{}s", a.timeout_secs),
            a.port.map(|p| p.to_string()).unwrap_or_else(|| "-".into()),
            truncate(dash(a.trigger.as_deref()), 40),
        );
    }
}
