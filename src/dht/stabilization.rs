#![warn(missing_docs)]

//! Stabilization runs daemons to maintain the ring.
//!
//! Churn leaves successor pointers, predecessor slots and finger slots
//! stale; nothing repairs them synchronously. One [Stabilizer] per process
//! periodically walks every hosted virtual node and runs the repair
//! protocol: reconcile with the successor, fix one finger slot, and probe
//! the predecessor. Each task has its own interval.

use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use crate::consts;
use crate::error::Result;
use crate::node::Node;
use crate::rpc::PeerRpc;

/// Intervals of the maintenance tasks.
#[derive(Debug, Clone)]
pub struct StabilizeConfig {
    /// Successor reconciliation and successor-list refresh.
    pub stabilize_interval: Duration,
    /// Finger repair, one slot per virtual node per round.
    pub fix_fingers_interval: Duration,
    /// Predecessor liveness probe.
    pub check_predecessor_interval: Duration,
}

impl Default for StabilizeConfig {
    fn default() -> Self {
        Self {
            stabilize_interval: Duration::from_millis(consts::DEFAULT_STABILIZE_INTERVAL_MS),
            fix_fingers_interval: Duration::from_millis(consts::DEFAULT_FIX_FINGERS_INTERVAL_MS),
            check_predecessor_interval: Duration::from_millis(
                consts::DEFAULT_CHECK_PREDECESSOR_INTERVAL_MS,
            ),
        }
    }
}

/// The stabilization runner of one process.
pub struct Stabilizer {
    node: Arc<Node>,
    config: StabilizeConfig,
}

impl Stabilizer {
    /// Create a runner with default intervals.
    pub fn new(node: Arc<Node>) -> Self {
        Self::with_config(node, StabilizeConfig::default())
    }

    /// Create a runner with caller-chosen intervals.
    pub fn with_config(node: Arc<Node>, config: StabilizeConfig) -> Self {
        Self { node, config }
    }

    /// Run successor reconciliation once for every hosted virtual node. The
    /// virtual node set is snapshotted per pass, so a node removed from the
    /// process is gone from maintenance in the same step.
    pub async fn stabilize(&self) -> Result<()> {
        let via: &dyn PeerRpc = self.node.as_ref();
        for vnode in self.node.vnodes()? {
            tracing::debug!("STABILIZATION stabilize {}", vnode.key());
            if let Err(e) = vnode.stabilize(via).await {
                tracing::error!("[stabilize] failed on {}: {}", vnode.key(), e);
            }
        }
        Ok(())
    }

    /// Repair one finger slot of every hosted virtual node.
    pub async fn fix_fingers(&self) -> Result<()> {
        let via: &dyn PeerRpc = self.node.as_ref();
        for vnode in self.node.vnodes()? {
            tracing::debug!("STABILIZATION fix_fingers {}", vnode.key());
            if let Err(e) = vnode.fix_fingers(via).await {
                tracing::error!("[fix_fingers] failed on {}: {}", vnode.key(), e);
            }
        }
        Ok(())
    }

    /// Probe the predecessor of every hosted virtual node, clearing dead
    /// ones.
    pub async fn check_predecessor(&self) -> Result<()> {
        let via: &dyn PeerRpc = self.node.as_ref();
        for vnode in self.node.vnodes()? {
            tracing::debug!("STABILIZATION check_predecessor {}", vnode.key());
            if let Err(e) = vnode.check_predecessor(via).await {
                tracing::error!("[check_predecessor] failed on {}: {}", vnode.key(), e);
            }
        }
        Ok(())
    }
}

mod runner {
    use futures::future::FutureExt;
    use futures::pin_mut;
    use futures::select;
    use futures_timer::Delay;

    use super::*;

    impl Stabilizer {
        /// Run the maintenance loop forever. The tick is the smallest
        /// configured interval; each task fires when its own interval has
        /// elapsed.
        pub async fn wait(self: Arc<Self>) {
            let tick = self
                .config
                .stabilize_interval
                .min(self.config.fix_fingers_interval)
                .min(self.config.check_predecessor_interval);
            let mut last_stabilize = Instant::now();
            let mut last_fix = Instant::now();
            let mut last_check = Instant::now();
            loop {
                let timeout = Delay::new(tick).fuse();
                pin_mut!(timeout);
                select! {
                    _ = timeout => {
                        if last_stabilize.elapsed() >= self.config.stabilize_interval {
                            last_stabilize = Instant::now();
                            self.stabilize()
                                .await
                                .unwrap_or_else(|e| tracing::error!("failed to stabilize {:?}", e));
                        }
                        if last_fix.elapsed() >= self.config.fix_fingers_interval {
                            last_fix = Instant::now();
                            self.fix_fingers()
                                .await
                                .unwrap_or_else(|e| tracing::error!("failed to fix fingers {:?}", e));
                        }
                        if last_check.elapsed() >= self.config.check_predecessor_interval {
                            last_check = Instant::now();
                            self.check_predecessor()
                                .await
                                .unwrap_or_else(|e| tracing::error!("failed to check predecessor {:?}", e));
                        }
                    }
                }
            }
        }
    }
}
