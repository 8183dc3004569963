use std::collections::BTreeSet;
use std::fmt;
use std::fmt::Formatter;
use l2lab_schemas::pod_config::PodConfig;
use crate::error::{OpError, ReconcileError};
use crate::netops::NetworkOps;

mod build;
mod clean;

/// What a reconciliation run did on one pod
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub pod: String,
    /// every primitive operation attempted, in order
    pub operations: Vec<String>,
    pub failures: Vec<ReconcileError>,
}

impl ReconcileReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

impl fmt::Display for ReconcileReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "pod {}: {} operations, {} failed", self.pod, self.operations.len(), self.failures.len())
    }
}

/// Bring the pod's kernel to exactly the state described by `config`. Whatever the pod had before
/// is torn down first, except for the WAN bridge which is only pruned. Failed operations are
/// recorded and the run carries on, the same config can simply be applied again.
pub async fn reconcile<N: NetworkOps + ?Sized>(kernel: &N, pod: &str, config: &PodConfig) -> ReconcileReport {
    let mut reconciler = Reconciler {
        kernel,
        config,
        report: ReconcileReport {
            pod: pod.to_string(),
            ..Default::default()
        },
    };
    tracing::info!("reconciling pod {pod}");

    reconciler.clean().await;
    reconciler.isolate_tunnels().await;
    reconciler.build().await;
    reconciler.populate_namespaces().await;

    let report = reconciler.report;
    if report.is_success() {
        tracing::info!("{report}");
    } else {
        tracing::warn!("{report}");
    }
    report
}

struct Reconciler<'a, N: NetworkOps + ?Sized> {
    kernel: &'a N,
    config: &'a PodConfig,
    report: ReconcileReport,
}

impl<'a, N: NetworkOps + ?Sized> Reconciler<'a, N> {
    /// Note the outcome of one operation, returns whether it went through
    fn record<T>(&mut self, operation: String, result: Result<T, OpError>) -> Option<T> {
        tracing::debug!("{}: {operation}", self.report.pod);
        self.report.operations.push(operation.clone());
        match result {
            Ok(value) => Some(value),
            Err(err) => {
                tracing::error!("pod {}: {operation} failed: {}", self.report.pod, err.reason);
                self.report.failures.push(ReconcileError::PrimitiveOperationFailed {
                    pod: self.report.pod.clone(),
                    operation,
                    reason: err.reason,
                });
                None
            }
        }
    }

    async fn is_attached(&mut self, bridge: &str, member: &str) -> bool {
        let ports = self.kernel.bridge_ports(bridge).await;
        self.record(format!("list ports of {bridge}"), ports)
            .map(|ports| ports.iter().any(|p| p == member))
            .unwrap_or(false)
    }

    /// Enslave `member` unless it already is, returns whether it ends up on the bridge
    async fn attach(&mut self, bridge: &str, member: &str) -> bool {
        if self.is_attached(bridge, member).await {
            return true;
        }
        let res = self.kernel.attach(bridge, member).await;
        self.record(format!("attach {member} to {bridge}"), res).is_some()
    }

    async fn isolate_tunnels(&mut self) {
        let installed = self.kernel.forward_block_installed().await;
        if let Some(false) = self.record("check gretap forwarding block".to_string(), installed) {
            let res = self.kernel.install_forward_block().await;
            self.record("install gretap forwarding block".to_string(), res);
        }
    }
}

/// Names that `attempted` has not seen yet, so a device that disappeared as a side effect of an
/// earlier deletion is never tried twice
fn pending<'n>(live: &'n [String], attempted: &BTreeSet<String>) -> Option<&'n String> {
    live.iter().find(|name| !attempted.contains(*name))
}
