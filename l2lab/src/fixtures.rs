//! Lab descriptions shared by the unit tests

use l2lab_schemas::inventory::Inventory;
use l2lab_schemas::topology::DesiredTopology;

pub const HARDWARE: &str = r#"
sites:
  lab-a:
    tunneling_pod: pod1
    pods:
      pod1:
        host: 10.0.0.1
        wan_bridge: { name: br0, members: [eth0, eth1] }
        trunk_ports: [eth1]
        ethernet:
          eth2: { dut_name: ap1, dut_port: lan1 }
          eth3: { dut_name: ap1, dut_port: wan }
        console:
          serial:
            A9X3: { dut_name: ap1 }
      pod4:
        host: 10.0.0.4
        wan_bridge: { name: br0, members: [eth0] }
        trunk_ports: [eth0]
        ethernet:
          eth2: { dut_name: ap3, dut_port: lan1 }
  lab-b:
    tunneling_pod: pod2
    pods:
      pod2:
        host: 10.0.1.2
        wan_bridge: { name: br-wan, members: [eth0] }
        ethernet:
          eth2: { dut_name: ap2, dut_port: lan1 }
        console:
          tty:
            ttyUSB0: { dut_name: ap2 }
  lab-c:
    tunneling_pod: pod3
    pods:
      pod3:
        host: 10.0.2.3
        wan_bridge: { name: br0, members: [eth0] }
  lab-d:
    pods:
      pod5:
        host: 10.0.3.5
        wan_bridge: { name: br0 }
power:
  ap1: { host: 10.0.0.50, type: tasmota }
  ap2: { host: 10.0.1.50, type: tp-link }
  ap3: { host: 10.0.0.51, type: tasmota }
"#;

/// DUT on pod1 in lab-a, a wired client on pod2 in lab-b, egress through lab-a
pub const GUEST_TOPOLOGY: &str = r#"
bridges:
  guest:
    wan: lab-a
    members:
      - { type: dut, dut_name: ap1, dut_port: lan1 }
      - { type: sim_wired_client, pod: pod2, namespace: c1 }
"#;

pub fn inventory() -> Inventory {
    Inventory::from_yaml(HARDWARE).unwrap()
}

pub fn topology(text: &str) -> DesiredTopology {
    DesiredTopology::from_yaml(text).unwrap()
}
