use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use rustrecon_db::Store;
use rustrecon_types::{ActionDefinition, QueueItem};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::ActionError;

/// Everything a handler gets for one claimed queue row.
#[derive(Debug, Clone)]
pub struct ActionContext {
    pub item: QueueItem,
    /// Catalog entry, when the action is still in the catalog.
    pub definition: Option<ActionDefinition>,
    /// Cancelled when the orchestrator stops or the row is cancelled.
    pub cancel: CancellationToken,
    pub store: Arc<Store>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionOutcome {
    pub summary: Option<String>,
}

impl ActionOutcome {
    pub fn summary(text: impl Into<String>) -> Self {
        Self {
            summary: Some(text.into()),
        }
    }
}

/// Implementation of one catalog action.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// Catalog name this handler runs.
    fn name(&self) -> &str;

    async fn execute(&self, ctx: ActionContext) -> Result<ActionOutcome, ActionError>;
}

/// Action name to handler lookup, built once at startup.
#[derive(Clone, Default)]
pub struct ActionRegistry {
    handlers: HashMap<String, Arc<dyn ActionHandler>>,
}

impl std::fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("actions", &self.names())
            .finish()
    }
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under its own name, replacing any previous one.
    pub fn register(&mut self, handler: Arc<dyn ActionHandler>) {
        let name = handler.name().to_string();
        if self.handlers.insert(name.clone(), handler).is_some() {
            debug!(action = %name, "handler replaced");
        }
    }

    pub fn with(mut self, handler: Arc<dyn ActionHandler>) -> Self {
        self.register(handler);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ActionHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Drop handlers whose action is missing from `enabled`.
    pub fn retain_enabled(&mut self, enabled: &[ActionDefinition]) -> usize {
        let before = self.handlers.len();
        self.handlers
            .retain(|name, _| enabled.iter().any(|def| def.enabled && def.name == *name));
        let dropped = before - self.handlers.len();
        if dropped > 0 {
            info!(
                dropped,
                kept = self.handlers.len(),
                "handlers without an enabled catalog entry dropped"
            );
        }
        dropped
    }
}

/// Handler that only logs what would run. Used by `run --dry-run`.
#[derive(Debug, Clone)]
pub struct DryRunHandler {
    name: String,
}

impl DryRunHandler {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }

    /// One dry-run handler per enabled catalog action.
    pub fn registry_for(catalog: &[ActionDefinition]) -> ActionRegistry {
        catalog
            .iter()
            .filter(|def| def.enabled)
            .fold(ActionRegistry::new(), |registry, def| {
                registry.with(Arc::new(DryRunHandler::new(&def.name)))
            })
    }
}

#[async_trait]
impl ActionHandler for DryRunHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: ActionContext) -> Result<ActionOutcome, ActionError> {
        let item = &ctx.item;
        info!(
            id = item.id,
            action = %item.action_name,
            mac = %item.mac_address,
            port = ?item.port,
            "dry run"
        );
        Ok(ActionOutcome::summary("dry run"))
    }
}
