//! Worker runtime profile parsing.
//!
//! ```kdl
//! worker "translation" {
//!     command "/opt/dubflow/envs/translation/bin/python"
//!     args "-m" "dub_workers.translate"
//!     working-dir "/opt/dubflow/workers"
//!     timeout-secs 600
//!     env "HF_HOME" "/opt/dubflow/models"
//! }
//! ```

use kdl::{KdlDocument, KdlNode};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{ConfigError, ConfigResult};
use dubflow_core::Stage;
use dubflow_core::worker::default_timeout;

/// Runtime profile of one stage's external worker.
#[derive(Debug, Clone)]
pub struct WorkerProfile {
    pub stage: Stage,
    pub command: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub timeout: Option<Duration>,
}

/// All configured profiles, keyed by stage.
#[derive(Debug, Clone, Default)]
pub struct RuntimeProfiles {
    profiles: HashMap<Stage, WorkerProfile>,
}

impl RuntimeProfiles {
    /// Parse a KDL document of `worker` nodes.
    pub fn parse(text: &str) -> ConfigResult<Self> {
        let doc: KdlDocument = text.parse()?;
        let mut profiles = HashMap::new();

        for node in doc.nodes() {
            if node.name().value() != "worker" {
                return Err(ConfigError::InvalidValue {
                    field: node.name().value().to_string(),
                    message: "expected a `worker` node".to_string(),
                });
            }
            let profile = parse_worker(node)?;
            let stage = profile.stage;
            if profiles.insert(stage, profile).is_some() {
                return Err(ConfigError::Duplicate(format!(
                    "worker profile for {stage} defined twice"
                )));
            }
        }

        Ok(Self { profiles })
    }

    /// Load profiles from a file. A missing file yields the empty set: every
    /// stage then runs with bare defaults and fails as `worker-unavailable`
    /// at invocation time if the binary is absent.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::parse(&text),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(err.into()),
        }
    }

    /// Build a profile set without going through KDL.
    pub fn from_profiles(profiles: impl IntoIterator<Item = WorkerProfile>) -> Self {
        Self {
            profiles: profiles.into_iter().map(|p| (p.stage, p)).collect(),
        }
    }

    pub fn profile(&self, stage: Stage) -> Option<&WorkerProfile> {
        self.profiles.get(&stage)
    }

    /// Effective wall-clock limit for a stage: profile override or the
    /// built-in default.
    pub fn timeout(&self, stage: Stage) -> Duration {
        self.profiles
            .get(&stage)
            .and_then(|p| p.timeout)
            .unwrap_or_else(|| default_timeout(stage))
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

fn first_string(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(String::from)
}

fn parse_worker(node: &KdlNode) -> ConfigResult<WorkerProfile> {
    let stage_name = first_string(node)
        .ok_or_else(|| ConfigError::MissingField("worker stage name".to_string()))?;
    let stage =
        Stage::parse(&stage_name).ok_or_else(|| ConfigError::UnknownStage(stage_name.clone()))?;

    let mut command = None;
    let mut args = Vec::new();
    let mut working_dir = None;
    let mut env = HashMap::new();
    let mut timeout = None;

    let children = node.children().map(KdlDocument::nodes).unwrap_or_default();
    for child in children {
        match child.name().value() {
            "command" => {
                command = Some(PathBuf::from(first_string(child).ok_or_else(|| {
                    ConfigError::MissingField(format!("{stage_name}: command value"))
                })?));
            }
            "args" => {
                for entry in child.entries() {
                    let value =
                        entry
                            .value()
                            .as_string()
                            .ok_or_else(|| ConfigError::InvalidValue {
                                field: format!("{stage_name}: args"),
                                message: "arguments must be strings".to_string(),
                            })?;
                    args.push(value.to_string());
                }
            }
            "working-dir" => {
                working_dir = Some(PathBuf::from(first_string(child).ok_or_else(|| {
                    ConfigError::MissingField(format!("{stage_name}: working-dir value"))
                })?));
            }
            "timeout-secs" => {
                let secs = child
                    .entries()
                    .first()
                    .and_then(|e| e.value().as_integer())
                    .filter(|s| *s > 0)
                    .ok_or_else(|| ConfigError::InvalidValue {
                        field: format!("{stage_name}: timeout-secs"),
                        message: "expected a positive integer".to_string(),
                    })?;
                timeout = Some(Duration::from_secs(secs as u64));
            }
            "env" => {
                let values: Vec<&str> = child
                    .entries()
                    .iter()
                    .filter_map(|e| e.value().as_string())
                    .collect();
                match values.as_slice() {
                    [key, value] => {
                        env.insert(key.to_string(), value.to_string());
                    }
                    _ => {
                        return Err(ConfigError::InvalidValue {
                            field: format!("{stage_name}: env"),
                            message: "expected `env \"KEY\" \"VALUE\"`".to_string(),
                        });
                    }
                }
            }
            other => {
                return Err(ConfigError::InvalidValue {
                    field: format!("{stage_name}: {other}"),
                    message: "unknown worker setting".to_string(),
                });
            }
        }
    }

    Ok(WorkerProfile {
        stage,
        command: command
            .ok_or_else(|| ConfigError::MissingField(format!("{stage_name}: command")))?,
        args,
        working_dir,
        env,
        timeout,
    })
}
