use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fmt::Formatter;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use async_trait::async_trait;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use l2lab_schemas::inventory::Inventory;
use l2lab_schemas::pod_config::PodConfig;
use l2lab_schemas::settings::LabSettings;
use crate::error::DispatchError;
use crate::orchestration::ssh::{RemoteOutput, SSHClient, SSH_CONNECTION_FAILURE};

/// How the run on one pod ended
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PodStatus {
    Succeeded,
    Failed {
        exit_code: Option<i32>,
        stderr: String,
    },
    Unreachable {
        reason: String,
    },
    /// a run for this pod was already in flight, nothing was dispatched
    Busy,
}

impl PodStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, PodStatus::Succeeded)
    }
}

impl fmt::Display for PodStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            PodStatus::Succeeded => write!(f, "succeeded"),
            PodStatus::Failed { exit_code: Some(code), stderr } => {
                write!(f, "failed with exit code {code}: {}", stderr.trim())
            }
            PodStatus::Failed { exit_code: None, stderr } => write!(f, "failed: {}", stderr.trim()),
            PodStatus::Unreachable { reason } => write!(f, "unreachable: {reason}"),
            PodStatus::Busy => write!(f, "busy, a run is already in flight"),
        }
    }
}

/// Gets a compiled config onto a pod and runs the reconciler there
#[async_trait]
pub trait PodDispatch: Send + Sync {
    async fn dispatch(&self, pod: &str, host: &str, config: &PodConfig) -> Result<RemoteOutput, DispatchError>;
}

/// Pipes the config as json into the pod agent over ssh
pub struct SshDispatch {
    pub settings: LabSettings,
}

impl SshDispatch {
    pub fn new(settings: LabSettings) -> Self {
        Self { settings }
    }

    async fn write_logs(&self, pod: &str, output: &RemoteOutput) -> anyhow::Result<()> {
        write_pod_logs(&self.settings.log_dir, pod, output).await
    }
}

#[async_trait]
impl PodDispatch for SshDispatch {
    async fn dispatch(&self, pod: &str, host: &str, config: &PodConfig) -> Result<RemoteOutput, DispatchError> {
        let input = serde_json::to_vec(config).map_err(|err| DispatchError::Encoding {
            pod: pod.to_string(),
            reason: err.to_string(),
        })?;

        tracing::info!("dispatching config to pod {pod} at {host}");
        let client = SSHClient::new(host, &self.settings);
        let output = client.run_with_stdin(&self.settings.agent_command, &input).await
            .map_err(|err| DispatchError::PeerUnreachable {
                pod: pod.to_string(),
                host: host.to_string(),
                reason: format!("{err:#}"),
            })?;
        if let Err(err) = self.write_logs(pod, &output).await {
            tracing::warn!("could not write logs for pod {pod}: {err:#}");
        }
        remote_outcome(pod, host, output)
    }
}

/// ssh itself exits 255 when it cannot reach the pod, any other exit code is the agent's
pub fn remote_outcome(pod: &str, host: &str, output: RemoteOutput) -> Result<RemoteOutput, DispatchError> {
    if output.exit_code == Some(SSH_CONNECTION_FAILURE) {
        return Err(DispatchError::PeerUnreachable {
            pod: pod.to_string(),
            host: host.to_string(),
            reason: output.stderr.trim().to_string(),
        });
    }
    Ok(output)
}

/// Write the agent's output to `<log_dir>/<pod>.stdout` and `<log_dir>/<pod>.stderr`
pub async fn write_pod_logs(log_dir: &Path, pod: &str, output: &RemoteOutput) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(log_dir).await?;
    tokio::fs::write(log_dir.join(format!("{pod}.stdout")), &output.stdout).await?;
    tokio::fs::write(log_dir.join(format!("{pod}.stderr")), &output.stderr).await?;
    Ok(())
}

/// Runs the reconciler on every pod at once and collects how each one went. A pod failing never
/// stops the others.
pub struct FanOut<D: PodDispatch> {
    dispatch: D,
    in_flight: Arc<Mutex<BTreeSet<String>>>,
}

/// Marks a pod as in flight until dropped
pub struct InFlight {
    pod: String,
    in_flight: Arc<Mutex<BTreeSet<String>>>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner).remove(&self.pod);
    }
}

impl<D: PodDispatch> FanOut<D> {
    pub fn new(dispatch: D) -> Self {
        Self {
            dispatch,
            in_flight: Arc::new(Mutex::new(BTreeSet::new())),
        }
    }

    /// Claim a pod for a run, `None` if it is already claimed
    pub fn claim(&self, pod: &str) -> Option<InFlight> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if !in_flight.insert(pod.to_string()) {
            return None;
        }
        Some(InFlight {
            pod: pod.to_string(),
            in_flight: self.in_flight.clone(),
        })
    }

    pub async fn apply(
        &self,
        configs: &BTreeMap<String, PodConfig>,
        inventory: &Inventory,
    ) -> BTreeMap<String, PodStatus> {
        // the name list is in the same order as the futures
        let mut futures = Vec::new();
        let mut res_name_list = Vec::new();
        for (pod, config) in configs {
            futures.push(self.run_pod(pod, inventory, config));
            res_name_list.push(pod.clone());
        }
        let results = join_all(futures).await;
        res_name_list.into_iter().zip(results).collect()
    }

    async fn run_pod(&self, pod: &str, inventory: &Inventory, config: &PodConfig) -> PodStatus {
        let Some(host) = inventory.pod(pod).map(|p| p.host.as_str()) else {
            tracing::error!("pod {pod} is not in the inventory");
            return PodStatus::Unreachable {
                reason: format!("pod {pod} is not in the inventory"),
            };
        };
        let Some(_claim) = self.claim(pod) else {
            tracing::warn!("pod {pod} already has a run in flight, skipping");
            return PodStatus::Busy;
        };

        let status = match self.dispatch.dispatch(pod, host, config).await {
            Ok(output) if output.success() => PodStatus::Succeeded,
            Ok(output) => PodStatus::Failed {
                exit_code: output.exit_code,
                stderr: output.stderr,
            },
            Err(err @ DispatchError::PeerUnreachable { .. }) => PodStatus::Unreachable {
                reason: err.to_string(),
            },
            Err(err @ DispatchError::Encoding { .. }) => PodStatus::Failed {
                exit_code: None,
                stderr: err.to_string(),
            },
        };
        if status.is_success() {
            tracing::info!("pod {pod}: {status}");
        } else {
            tracing::error!("pod {pod}: {status}");
        }
        status
    }
}
