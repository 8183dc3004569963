use std::collections::{BTreeMap, BTreeSet};
use serde::{Deserialize, Serialize};
use strum_macros::Display;
use l2lab_schemas::inventory::Inventory;
use l2lab_schemas::topology::{DesiredTopology, Member};

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PowerState {
    On,
    Off,
}

/// Which DUTs should be powered for a topology. Every DUT with a smart plug gets an entry, it is
/// on when the topology cables it into a logical bridge or lists it under `power_on`.
pub fn power_plan(inventory: &Inventory, topology: &DesiredTopology) -> BTreeMap<String, PowerState> {
    let mut wanted: BTreeSet<&str> = topology.power_on.iter().map(String::as_str).collect();
    for (_, bridge) in topology.bridges.iter() {
        for member in &bridge.members {
            if let Member::Dut { dut_name, .. } = member {
                wanted.insert(dut_name.as_str());
            }
        }
    }
    for dut in wanted.iter().filter(|dut| !inventory.power.contains_key(**dut)) {
        tracing::warn!("DUT {dut} should be on but has no smart plug in the inventory");
    }

    inventory.power.keys()
        .map(|dut| {
            let state = if wanted.contains(dut.as_str()) { PowerState::On } else { PowerState::Off };
            (dut.clone(), state)
        })
        .collect()
}
