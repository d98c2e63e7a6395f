//! Data-plane collaborator contract.
//!
//! The tap/tun device and the UDP encapsulation path live outside the
//! daemon core. The core starts and stops the plane around its own
//! lifecycle (startup, reload, shutdown), hands it per-node packet keys
//! negotiated over the mesh, and periodically observes per-node traffic
//! counters for the topology tables and the traffic dump.

use crate::error::Result;
use crate::topology::TrafficCounters;

/// Counter deltas attributed to one node since the last poll.
#[derive(Debug, Clone)]
pub struct NodeTraffic {
    pub node: String,
    pub delta: TrafficCounters,
}

/// Contract between the daemon core and the packet-ferrying plane.
pub trait DataPlane: Send {
    /// Bring the plane up. Called once at startup and again after a
    /// reload tears it down.
    fn start(&mut self) -> Result<()>;

    /// Tear the plane down. Must be idempotent.
    fn stop(&mut self);

    /// Install or replace the packet key for a node.
    fn install_key(&mut self, node: &str, key: &[u8]);

    /// Drain per-node counter deltas accumulated since the last call.
    fn poll_counters(&mut self) -> Vec<NodeTraffic>;
}

/// Plane used when no packet path is wired in: counts nothing, ferries
/// nothing, but keeps the lifecycle observable in the logs.
#[derive(Debug, Default)]
pub struct NullDataPlane {
    running: bool,
}

impl NullDataPlane {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DataPlane for NullDataPlane {
    fn start(&mut self) -> Result<()> {
        self.running = true;
        log::debug!("Data plane up (null)");
        Ok(())
    }

    fn stop(&mut self) {
        if self.running {
            self.running = false;
            log::debug!("Data plane down (null)");
        }
    }

    fn install_key(&mut self, node: &str, _key: &[u8]) {
        log::trace!("Discarding packet key for {node} (null plane)");
    }

    fn poll_counters(&mut self) -> Vec<NodeTraffic> {
        Vec::new()
    }
}
