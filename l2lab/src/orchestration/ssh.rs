use std::path::PathBuf;
use std::process::Stdio;
use anyhow::Context;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use l2lab_schemas::settings::LabSettings;

/// ssh exits with this when it could not reach or authenticate to the remote end
pub const SSH_CONNECTION_FAILURE: i32 = 255;

/// Runs commands on a pod over the system ssh client. Key based auth only, ssh is never allowed
/// to prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SSHClient {
    pub host: String,
    pub user: String,
    pub identity_file: Option<PathBuf>,
}

/// Everything a finished remote command left behind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteOutput {
    /// `None` when the process was killed by a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl RemoteOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

impl SSHClient {
    pub fn new(host: &str, settings: &LabSettings) -> Self {
        Self {
            host: host.to_string(),
            user: settings.ssh_user.clone(),
            identity_file: settings.identity_file.clone(),
        }
    }

    fn address(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// Arguments to `ssh` for running `remote_cmd` on this host
    pub fn command_args(&self, remote_cmd: &[String], interactive: bool) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(key) = &self.identity_file {
            args.push("-i".to_string());
            args.push(key.to_string_lossy().to_string());
        }
        if interactive {
            args.push("-t".to_string());
        }
        args.extend(_get_ssh_opts().into_iter().map(str::to_string));
        args.push(self.address());
        args.extend(remote_cmd.iter().cloned());
        args
    }

    /// Run `remote_cmd` on the host with `input` on its stdin. A failing remote command is not an
    /// error here, the caller decides from the exit code.
    pub async fn run_with_stdin(&self, remote_cmd: &[String], input: &[u8]) -> anyhow::Result<RemoteOutput> {
        let args = self.command_args(remote_cmd, false);
        tracing::debug!("running remote command: ssh {}", args.join(" "));
        pipe_to_command("ssh", &args, input).await
    }

    /// Hand the terminal over to `remote_cmd` on the host until it exits
    pub async fn run_interactive(&self, remote_cmd: &[String]) -> anyhow::Result<Option<i32>> {
        let args = self.command_args(remote_cmd, true);
        tracing::debug!("opening interactive session: ssh {}", args.join(" "));
        let status = Command::new("ssh")
            .args(&args)
            .status()
            .await
            .context("spawning ssh")?;
        Ok(status.code())
    }
}

/// Spawn `program`, feed it `input` and collect its output once it exits
pub async fn pipe_to_command(program: &str, args: &[String], input: &[u8]) -> anyhow::Result<RemoteOutput> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("spawning {program}"))?;

    if let Some(mut stdin) = child.stdin.take() {
        // the remote end may exit without reading everything, that shows up in the exit code
        if let Err(err) = stdin.write_all(input).await {
            tracing::warn!("{program} did not take all of its input: {err:#}");
        }
    }
    let output = child.wait_with_output().await
        .with_context(|| format!("waiting for {program}"))?;
    Ok(RemoteOutput {
        exit_code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

fn _get_ssh_opts<'a>() -> Vec<&'a str> {
    // TODO - pods are reimaged often, pin host keys once the inventory carries them
    vec!["-o", "BatchMode=yes", "-o", "StrictHostKeyChecking=no", "-o", "UserKnownHostsFile=/dev/null"]
}
