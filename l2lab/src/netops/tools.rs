use crate::error::OpError;
use crate::netops::{CommandRunner, SubprocessRunner};
use crate::vec_of_strings;

const FORWARD_BLOCK: [&str; 6] = ["-i", "gretap+", "-o", "gretap+", "-j", "DROP"];

/// The parts of a pod that rtnetlink does not reach: wireless radios through `iw` and the bridge
/// firewall through `ebtables`.
pub struct HostTools<R: CommandRunner = SubprocessRunner> {
    runner: R,
}

impl HostTools<SubprocessRunner> {
    pub fn new() -> Self {
        Self { runner: SubprocessRunner }
    }
}

impl Default for HostTools<SubprocessRunner> {
    fn default() -> Self {
        Self::new()
    }
}

/// `iw list` prints one `Wiphy phyN` header per radio
fn parse_wiphys(out: &str) -> Vec<String> {
    out.lines()
        .filter(|line| line.starts_with("Wiphy"))
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(str::to_string)
        .collect()
}

/// cfg80211 not loaded or `iw` not installed, either way there is no radio to find
fn no_wireless_stack(reason: &str) -> bool {
    reason.contains("nl80211 not found") || reason.contains("exec of \"iw\" failed")
}

impl<R: CommandRunner> HostTools<R> {
    pub fn with_runner(runner: R) -> Self {
        Self { runner }
    }

    async fn exec(&self, cmd: Vec<String>) -> Result<String, OpError> {
        let operation = cmd.join(" ");
        tracing::debug!("running {operation}");
        self.runner.run(cmd).await
            .map_err(|err| OpError::new(operation, format!("{err:#}").trim().to_string()))
    }

    pub async fn namespace_phys(&self, namespace: &str) -> Result<Vec<String>, OpError> {
        match self.exec(vec_of_strings!["ip", "netns", "exec", namespace, "iw", "list"]).await {
            Ok(out) => Ok(parse_wiphys(&out)),
            Err(err) if no_wireless_stack(&err.reason) => {
                tracing::debug!("no wireless support in {namespace}: {}", err.reason);
                Ok(Vec::new())
            }
            Err(err) => Err(err),
        }
    }

    pub async fn move_phy_to_namespace(&self, phy: &str, namespace: &str) -> Result<(), OpError> {
        self.exec(vec_of_strings!["iw", "phy", phy, "set", "netns", "name", namespace]).await?;
        Ok(())
    }

    pub async fn rescue_phy(&self, namespace: &str, phy: &str) -> Result<(), OpError> {
        // netns 1 is the pid of init, so the radio goes back to the default namespace
        self.exec(vec_of_strings!["ip", "netns", "exec", namespace, "iw", "phy", phy, "set", "netns", "1"]).await?;
        Ok(())
    }

    pub async fn forward_block_installed(&self) -> Result<bool, OpError> {
        let out = self.exec(vec_of_strings!["ebtables", "-t", "filter", "-L", "FORWARD"]).await?;
        Ok(out.contains(&FORWARD_BLOCK.join(" ")))
    }

    pub async fn install_forward_block(&self) -> Result<(), OpError> {
        let mut cmd = vec_of_strings!["ebtables", "-t", "filter", "-A", "FORWARD"];
        cmd.extend(FORWARD_BLOCK.iter().map(|s| s.to_string()));
        self.exec(cmd).await?;
        Ok(())
    }
}
