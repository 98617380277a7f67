pub mod action;
pub mod finding;
pub mod host;
pub mod queue;
pub mod service;
pub mod stats;

pub use action::{ActionCatalog, ActionDefinition, ActionScope, RiskLevel};
pub use finding::{
    Credential, DetectedSoftware, Finding, FindingKind, FindingSummary, NewCredential,
    PresenceEvent, PresenceRecord, Vulnerability,
};
pub use host::{
    Host, HostUpdate, HostnameRecord, STUB_MAC_PREFIX, is_stub_mac, normalize_mac, stub_mac_for,
};
pub use queue::{
    AGING_STEP_SECS, AttemptRecord, DEFAULT_MAX_RETRIES, DEFAULT_PRIORITY,
    DEFAULT_SCHEDULED_PRIORITY, MAX_PRIORITY, NewQueueItem, ParseStatusError, QueueItem,
    QueueStatus, StatusSnapshot, TargetKey, UpcomingAction, effective_priority,
};
pub use service::{
    ParseEnumError, PortService, PortServiceChange, PortServiceUpdate, PortState, Protocol,
    well_known_ports,
};
pub use stats::{DisplayStats, LiveStats};
