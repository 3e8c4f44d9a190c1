//! Hook plugin contract and the registry that owns loaded hooks.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{error, info};

use crate::error::HookError;
use crate::record::HookPayload;

/// A notification plugin.
///
/// Hooks only ever see the serialized [`HookPayload`], so they can live in
/// another process.
#[async_trait]
pub trait Hook: Send + Sync {
    fn name(&self) -> &str;

    /// Handle an execution event.
    async fn handle(&self, payload: &HookPayload) -> Result<(), HookError>;

    /// Handle a system event.
    async fn handle_system(&self, payload: &HookPayload) -> Result<(), HookError>;

    /// Handle a payload built from the synthetic test context.
    async fn test(&self, payload: &HookPayload) -> Result<(), HookError> {
        self.handle(payload).await
    }
}

/// Produces hooks for the registry.
#[async_trait]
pub trait HookLoader: Send + Sync {
    /// Where the hooks come from, for logs.
    fn source(&self) -> String;

    async fn load(&self) -> Result<Vec<Arc<dyn Hook>>, HookError>;
}

/// Hooks registered in-process.
pub struct StaticHookLoader {
    hooks: Vec<Arc<dyn Hook>>,
}

impl StaticHookLoader {
    pub fn new(hooks: Vec<Arc<dyn Hook>>) -> Self {
        Self { hooks }
    }
}

#[async_trait]
impl HookLoader for StaticHookLoader {
    fn source(&self) -> String {
        "static".to_string()
    }

    async fn load(&self) -> Result<Vec<Arc<dyn Hook>>, HookError> {
        Ok(self.hooks.clone())
    }
}

/// Result of a registry refresh.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RefreshSummary {
    pub loaded: usize,
    /// `source: error` for each loader that failed.
    pub failed: Vec<String>,
}

/// Explicitly owned table of hooks by name.
///
/// Built at startup with [`refresh`](Self::refresh), refreshed on demand and
/// emptied with [`clear`](Self::clear) at shutdown.
pub struct HookRegistry {
    loaders: Vec<Arc<dyn HookLoader>>,
    hooks: RwLock<HashMap<String, Arc<dyn Hook>>>,
}

impl HookRegistry {
    pub fn new(loaders: Vec<Arc<dyn HookLoader>>) -> Self {
        Self {
            loaders,
            hooks: RwLock::new(HashMap::new()),
        }
    }

    /// Reload every hook from the loaders.
    ///
    /// A failing loader is logged and skipped; the other loaders still
    /// populate the registry.
    pub async fn refresh(&self) -> RefreshSummary {
        let mut summary = RefreshSummary::default();
        let mut loaded = HashMap::new();

        for loader in &self.loaders {
            match loader.load().await {
                Ok(hooks) => {
                    for hook in hooks {
                        loaded.insert(hook.name().to_string(), hook);
                    }
                }
                Err(e) => {
                    error!(source = %loader.source(), error = %e, "failed to load hooks");
                    summary.failed.push(format!("{}: {e}", loader.source()));
                }
            }
        }

        summary.loaded = loaded.len();
        *self.hooks.write().await = loaded;
        info!(hooks = summary.loaded, failed = summary.failed.len(), "hook registry refreshed");
        summary
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn Hook>> {
        self.hooks.read().await.get(name).cloned()
    }

    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.hooks.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn clear(&self) {
        self.hooks.write().await.clear();
        info!("hook registry cleared");
    }
}
