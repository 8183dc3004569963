use std::collections::BTreeMap;
use std::path::Path;
use anyhow::Context;
use l2lab_schemas::inventory::Inventory;
use l2lab_schemas::pod_config::PodConfig;
use l2lab_schemas::topology::DesiredTopology;

pub mod compiler;
pub mod error;
pub mod netops;
pub mod orchestration;
pub mod power;
pub mod reconciler;

#[cfg(test)]
mod fixtures;

/// The two lab descriptions every driver side command starts from
#[derive(Debug, Clone)]
pub struct Lab {
    pub inventory: Inventory,
    pub topology: DesiredTopology,
}

impl Lab {
    pub async fn load(hardware: &Path, topology: &Path) -> anyhow::Result<Self> {
        tracing::trace!("loading hardware from {hardware:?} and topology from {topology:?}");
        let inventory = Inventory::load_from_file(hardware).await
            .with_context(|| format!("loading hardware inventory {hardware:?}"))?;
        let topology = DesiredTopology::load_from_file(topology).await
            .with_context(|| format!("loading topology {topology:?}"))?;
        Ok(Self { inventory, topology })
    }

    /// Compile the topology into one config per pod of the inventory
    pub fn compile(&self) -> anyhow::Result<BTreeMap<String, PodConfig>> {
        let configs = compiler::compile(&self.inventory, &self.topology)
            .context("compiling topology")?;
        tracing::info!(
            "compiled {} logical bridges into configs for {} pods",
            self.topology.bridges.len(),
            configs.len(),
        );
        Ok(configs)
    }
}

/// What to run on a pod to get a shell inside a simulated client
pub fn client_shell_command(namespace: &str) -> Vec<String> {
    vec_of_strings!["sudo", "ip", "netns", "exec", namespace, "bash"]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_load_and_compile_lab() {
        let dir = tempfile::tempdir().unwrap();
        let hardware = dir.path().join("hardware.yaml");
        let topology = dir.path().join("topology.yaml");
        tokio::fs::write(&hardware, fixtures::HARDWARE).await.unwrap();
        tokio::fs::write(&topology, fixtures::GUEST_TOPOLOGY).await.unwrap();

        let lab = Lab::load(&hardware, &topology).await.unwrap();
        let configs = lab.compile().unwrap();
        assert_eq!(configs.len(), 5);
        assert!(configs["pod1"].bridges.contains_key("br0"));

        let err = Lab::load(&dir.path().join("missing.yaml"), &topology).await.unwrap_err();
        assert!(format!("{err:#}").contains("loading hardware inventory"));
    }

    #[test]
    fn test_compile_error_is_reported() {
        let lab = Lab {
            inventory: fixtures::inventory(),
            topology: fixtures::topology(r#"
bridges:
  lost:
    members:
      - { type: dut, dut_name: nope, dut_port: lan1 }
"#),
        };
        let err = lab.compile().unwrap_err();
        assert_eq!(format!("{err:#}"), "compiling topology: DUT port nope:lan1 is not cabled to any pod");
    }

    #[test]
    fn test_client_shell_command() {
        assert_eq!(client_shell_command("c1").join(" "), "sudo ip netns exec c1 bash");
    }
}
