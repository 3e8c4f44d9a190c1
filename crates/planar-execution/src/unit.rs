//! Execution unit contract and the catalog that resolves units by kind.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::channel::JobChannel;
use crate::error::{ChannelError, ExecutionError};
use crate::failure::FailureInfo;
use crate::process::ProcessUnit;
use crate::rest::RestUnit;

/// How an execution unit signals failure.
#[derive(Debug, Error)]
pub enum UnitError {
    /// The unit's own logic failed.
    #[error("{0}")]
    Failed(FailureInfo),

    /// The channel to the host broke.
    #[error("transport failure: {0}")]
    Transport(#[from] ChannelError),
}

impl From<FailureInfo> for UnitError {
    fn from(failure: FailureInfo) -> Self {
        UnitError::Failed(failure)
    }
}

/// Code that runs for one fire instance.
///
/// The unit receives a [`JobChannel`] and signals completion by returning.
#[async_trait]
pub trait ExecutionUnit: Send + Sync {
    /// Kind name recorded as the job type.
    fn kind(&self) -> &str;

    /// Run the unit to completion.
    async fn execute(&self, channel: JobChannel) -> Result<(), UnitError>;
}

fn default_method() -> String {
    "GET".to_string()
}

/// Declarative description of a job's unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UnitKind {
    /// An in-process unit registered in the [`UnitCatalog`] under `name`.
    Registered { name: String },
    /// An external process speaking the line protocol on stdio.
    Process {
        program: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: BTreeMap<String, String>,
        #[serde(default)]
        working_dir: Option<PathBuf>,
    },
    /// A single HTTP request.
    Rest {
        url: String,
        #[serde(default = "default_method")]
        method: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
        #[serde(default)]
        body: Option<String>,
    },
}

impl UnitKind {
    /// Job type name for this kind.
    pub fn type_name(&self) -> &str {
        match self {
            UnitKind::Registered { name } => name,
            UnitKind::Process { .. } => "process",
            UnitKind::Rest { .. } => "rest",
        }
    }
}

/// Resolves [`UnitKind`]s to runnable units.
pub struct UnitCatalog {
    registered: DashMap<String, Arc<dyn ExecutionUnit>>,
    http: reqwest::Client,
    stop_grace: Duration,
}

impl UnitCatalog {
    pub fn new(stop_grace: Duration) -> Self {
        Self {
            registered: DashMap::new(),
            http: reqwest::Client::new(),
            stop_grace,
        }
    }

    /// Register an in-process unit under `name`.
    pub fn register(&self, name: impl Into<String>, unit: Arc<dyn ExecutionUnit>) {
        self.registered.insert(name.into(), unit);
    }

    /// Names of registered in-process units.
    pub fn registered_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.registered.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Build or look up the unit for `kind`.
    pub fn resolve(&self, kind: &UnitKind) -> Result<Arc<dyn ExecutionUnit>, ExecutionError> {
        match kind {
            UnitKind::Registered { name } => self
                .registered
                .get(name)
                .map(|u| Arc::clone(u.value()))
                .ok_or_else(|| ExecutionError::UnknownUnit(name.clone())),
            UnitKind::Process {
                program,
                args,
                env,
                working_dir,
            } => Ok(Arc::new(
                ProcessUnit::new(program.clone())
                    .args(args.clone())
                    .envs(env.clone())
                    .working_dir(working_dir.clone())
                    .stop_grace(self.stop_grace),
            )),
            UnitKind::Rest {
                url,
                method,
                headers,
                body,
            } => Ok(Arc::new(RestUnit::new(
                self.http.clone(),
                method.clone(),
                url.clone(),
                headers.clone(),
                body.clone(),
            ))),
        }
    }
}

impl Default for UnitCatalog {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}
