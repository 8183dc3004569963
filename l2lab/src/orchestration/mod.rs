use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use anyhow::{bail, Context};
use tokio::process::Command;
use l2lab_schemas::pod_config::PodConfig;

pub mod ssh;
pub mod fanout;

/// Run a local command to completion, the stdout is returned. A non zero exit status is an error
/// carrying the command's stderr.
pub async fn run_subprocess_command(
    starting_command: &str,
    command_string: Vec<&str>,
) -> anyhow::Result<String> {
    tracing::debug!("running command: {} {}", starting_command, command_string.join(" "));
    let sub_process = Command::new(starting_command)
        .args(&command_string)
        .output()
        .await
        .with_context(|| format!("spawning {starting_command}"))?;

    if !sub_process.status.success() {
        let std_err = std::str::from_utf8(&sub_process.stderr)?;
        bail!("{}", std_err.trim());
    }
    let std_out = std::str::from_utf8(&sub_process.stdout)?.to_string();
    Ok(std_out)
}

/// Where the compiled config for a pod is written
pub fn pod_config_path(out_dir: &Path, pod: &str) -> PathBuf {
    out_dir.join(format!("{pod}.json"))
}

/// Write every compiled pod config as `<out_dir>/<pod>.json`, returns the written paths
pub async fn write_pod_configs(
    out_dir: &Path,
    configs: &BTreeMap<String, PodConfig>,
) -> anyhow::Result<Vec<PathBuf>> {
    tokio::fs::create_dir_all(out_dir).await
        .with_context(|| format!("creating output folder {out_dir:?}"))?;
    let mut written = Vec::new();
    for (pod, config) in configs {
        let path = pod_config_path(out_dir, pod);
        config.save_to(&path).await
            .with_context(|| format!("writing config for pod {pod}"))?;
        tracing::info!("wrote config for pod {pod} to {path:?}");
        written.push(path);
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use l2lab_schemas::pod_config::{BridgeConfig, WanBridge};
    use crate::vec_of_strings;
    use super::*;

    #[tokio::test]
    async fn test_run_subprocess_command() {
        let out = run_subprocess_command("echo", vec!["a", "b"]).await.unwrap();
        assert_eq!(out, "a b\n");
        let err = run_subprocess_command("sh", vec!["-c", "echo broken >&2; exit 3"]).await.unwrap_err();
        assert_eq!(err.to_string(), "broken");
        assert!(run_subprocess_command("/nonexistent/l2lab-binary", vec![]).await.is_err());
    }

    #[tokio::test]
    async fn test_write_pod_configs() {
        let dir = tempfile::tempdir().unwrap();
        let out_dir = dir.path().join("out");
        let mut config = PodConfig::new(
            WanBridge { name: "br0".to_string(), members: vec_of_strings!["eth0"] },
            vec_of_strings!["eth0"],
        );
        config.bridges.insert("guest".to_string(), BridgeConfig::new(2));
        let mut configs = BTreeMap::new();
        configs.insert("pod1".to_string(), config.clone());
        configs.insert("pod2".to_string(), PodConfig::new(
            WanBridge { name: "br-wan".to_string(), members: vec![] },
            vec![],
        ));

        let written = write_pod_configs(&out_dir, &configs).await.unwrap();
        assert_eq!(written, vec![out_dir.join("pod1.json"), out_dir.join("pod2.json")]);
        let read_back = PodConfig::load_from_file(out_dir.join("pod1.json")).await.unwrap();
        assert_eq!(read_back, config);
    }
}
