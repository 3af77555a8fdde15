//! Reconciliation Metrics
//!
//! Prometheus metrics for reconciliation passes, registered in a registry
//! owned by the caller so several daemons (or tests) never collide.

use crate::error::Result;
use prometheus::{Histogram, HistogramOpts, IntCounterVec, Opts, Registry};

/// Metrics recorded by the reconciler
#[derive(Clone)]
pub struct ReconcileMetrics {
    /// Passes by phase
    pub reconciliations: IntCounterVec,
    /// Failed mount/unmount attempts of single entries
    pub entry_failures: IntCounterVec,
    /// Wall time of a pass
    pub duration: Histogram,
}

impl ReconcileMetrics {
    /// Create metrics and register them in `registry`
    pub fn new(registry: &Registry) -> Result<Self> {
        let metrics = Self::unregistered()?;
        registry.register(Box::new(metrics.reconciliations.clone()))?;
        registry.register(Box::new(metrics.entry_failures.clone()))?;
        registry.register(Box::new(metrics.duration.clone()))?;
        Ok(metrics)
    }

    /// Create metrics that are not exported anywhere
    pub fn unregistered() -> Result<Self> {
        Ok(Self {
            reconciliations: IntCounterVec::new(
                Opts::new(
                    "mount_daemon_reconciliations_total",
                    "Reconciliation passes by phase",
                ),
                &["phase"],
            )?,
            entry_failures: IntCounterVec::new(
                Opts::new(
                    "mount_daemon_entry_failures_total",
                    "Failed mount or unmount attempts of single entries",
                ),
                &["operation"],
            )?,
            duration: Histogram::with_opts(HistogramOpts::new(
                "mount_daemon_reconcile_duration_seconds",
                "Duration of reconciliation passes",
            ))?,
        })
    }
}
