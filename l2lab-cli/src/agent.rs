use std::fs::{File, OpenOptions};
use std::path::Path;
use anyhow::{anyhow, bail, Context};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use nix::unistd::Uid;
use tokio::io::AsyncReadExt;
use l2lab_lib::netops::NetlinkOps;
use l2lab_lib::reconciler::reconcile;
use l2lab_schemas::cli_models::ReconcileCmd;
use l2lab_schemas::pod_config::PodConfig;

/// The pod side of `create`: reconcile the local kernel to the config handed over on stdin
pub async fn run_agent(cmd: &ReconcileCmd) -> anyhow::Result<()> {
    if !Uid::effective().is_root() {
        bail!("reconcile changes the kernel network state and must run as root");
    }
    let _lock = take_lock(&cmd.lock_file)?;
    let config = read_config(&cmd.config).await?;
    let pod = match &cmd.pod {
        Some(pod) => pod.clone(),
        None => nix::unistd::gethostname()?
            .into_string()
            .map_err(|name| anyhow!("hostname {name:?} is not valid utf-8"))?,
    };

    let kernel = NetlinkOps::connect()?;
    let report = reconcile(&kernel, &pod, &config).await;
    println!("{report}");
    if !report.is_success() {
        for failure in &report.failures {
            eprintln!("{failure}");
        }
        bail!("{} of {} operations failed on {pod}", report.failures.len(), report.operations.len());
    }
    Ok(())
}

/// Hold an exclusive lock for the whole run so two runs on one pod cannot interleave
fn take_lock(path: &Path) -> anyhow::Result<Flock<File>> {
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)
        .with_context(|| format!("opening lock file {path:?}"))?;
    match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
        Ok(lock) => Ok(lock),
        Err((_, Errno::EWOULDBLOCK)) => bail!("another reconcile is already running ({path:?} is locked)"),
        Err((_, errno)) => Err(anyhow!(errno).context(format!("locking {path:?}"))),
    }
}

async fn read_config(source: &str) -> anyhow::Result<PodConfig> {
    if source == "-" {
        let mut text = String::new();
        tokio::io::stdin().read_to_string(&mut text).await.context("reading pod config from stdin")?;
        return PodConfig::from_json(&text);
    }
    PodConfig::load_from_file(source).await
        .with_context(|| format!("reading pod config {source}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("l2lab.lock");
        let lock = take_lock(&path).unwrap();
        let err = take_lock(&path).unwrap_err();
        assert!(err.to_string().contains("already running"));
        drop(lock);
        assert!(take_lock(&path).is_ok());
    }

    #[tokio::test]
    async fn test_read_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pod1.json");
        tokio::fs::write(&path, r#"{"wan_bridge": {"name": "br0", "members": ["eth0"]}}"#).await.unwrap();
        let config = read_config(path.to_str().unwrap()).await.unwrap();
        assert_eq!(config.wan_bridge.name, "br0");
        assert!(config.bridges.is_empty());
        assert!(read_config("/nonexistent/pod1.json").await.is_err());
    }
}
