use std::fmt;
use std::fmt::Formatter;
use std::path::{Path, PathBuf};
use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Settings for the machine driving the lab. Every field has a default so a missing settings file
/// is the same as an empty one.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct LabSettings {
    /// username for ssh into the pods
    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,
    /// private key for ssh into the pods, otherwise ssh picks its own
    #[serde(default)]
    pub identity_file: Option<PathBuf>,
    /// what to run on the pod, the compiled config is piped to its stdin
    #[serde(default = "default_agent_command")]
    pub agent_command: Vec<String>,
    /// per pod stdout and stderr of the agent land here
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// compiled pod configs land here
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

impl Default for LabSettings {
    fn default() -> Self {
        Self {
            ssh_user: default_ssh_user(),
            identity_file: None,
            agent_command: default_agent_command(),
            log_dir: default_log_dir(),
            output_dir: default_output_dir(),
        }
    }
}

fn default_ssh_user() -> String {"root".to_string()}
fn default_agent_command() -> Vec<String> {
    ["sudo", "l2lab", "reconcile", "--config", "-"].iter().map(|s| s.to_string()).collect()
}
fn default_log_dir() -> PathBuf {PathBuf::from("logs")}
fn default_output_dir() -> PathBuf {PathBuf::from("out")}

impl fmt::Display for LabSettings {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let json = serde_json::to_string_pretty(&self).map_err(|_| fmt::Error)?;
        f.write_str(&json)
    }
}

impl LabSettings {
    pub async fn read(path: Option<&Path>) -> anyhow::Result<LabSettings> {
        let Some(path) = path else {
            return Ok(LabSettings::default());
        };
        tracing::trace!("expected settings json location: {:?}", path);
        let text = tokio::fs::read_to_string(path).await
            .with_context(|| format!("could not read settings from {path:?}"))?;
        let settings: LabSettings = serde_json::from_str(&text).context("parsing settings json")?;
        Ok(settings)
    }
}
