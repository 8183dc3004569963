use thiserror::Error;

/// Reasons a topology cannot be compiled. All of these are fatal and raised before any pod is
/// touched.
#[derive(Error, PartialEq, Eq, Debug, Clone)]
pub enum CompileError {
    #[error("DUT port {dut_name}:{dut_port} is not cabled to any pod")]
    UnknownMember {
        dut_name: String,
        dut_port: String,
    },
    #[error("Pod {pod} is not in the inventory")]
    UnknownPod {
        pod: String,
    },
    #[error("Site {site} is not in the inventory")]
    UnknownSite {
        site: String,
    },
    #[error("Site {site} has no tunneling pod but a logical bridge spans it")]
    NoTunnelingPod {
        site: String,
    },
    #[error("Namespace {namespace} is declared twice on pod {pod}")]
    DuplicateNamespace {
        pod: String,
        namespace: String,
    },
    #[error("Logical bridge {bridge} clashes with a device of the same name on pod {pod}")]
    ReservedBridgeName {
        bridge: String,
        pod: String,
    },
    #[error("No 802.1Q tag is left for logical bridge {bridge}")]
    VlanSpaceExhausted {
        bridge: String,
    },
}

/// A single kernel primitive that did not go through
#[derive(Error, PartialEq, Eq, Debug, Clone)]
#[error("{operation}: {reason}")]
pub struct OpError {
    pub operation: String,
    pub reason: String,
}

impl OpError {
    pub fn new(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Error, PartialEq, Eq, Debug, Clone)]
pub enum ReconcileError {
    #[error("Pod {pod}: operation {operation} failed: {reason}")]
    PrimitiveOperationFailed {
        pod: String,
        operation: String,
        reason: String,
    },
}

#[derive(Error, PartialEq, Eq, Debug, Clone)]
pub enum DispatchError {
    #[error("Pod {pod} at {host} is unreachable: {reason}")]
    PeerUnreachable {
        pod: String,
        host: String,
        reason: String,
    },
    #[error("Config for pod {pod} could not be encoded: {reason}")]
    Encoding {
        pod: String,
        reason: String,
    },
}
