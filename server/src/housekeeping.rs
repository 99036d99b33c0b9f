//! Idle session eviction.

use log::info;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::registry::{ConnectionId, SessionRegistry};

/// Finds sessions that have been quiet for longer than the idle timeout.
///
/// The housekeeper only picks victims; the caller runs them through the same
/// cleanup path as an explicit disconnect.
pub struct Housekeeper {
    clock: Arc<dyn Clock>,
    timeout: Duration,
}

impl Housekeeper {
    pub fn new(clock: Arc<dyn Clock>, timeout: Duration) -> Self {
        Self { clock, timeout }
    }

    pub fn sweep(&self, registry: &SessionRegistry) -> Vec<ConnectionId> {
        let idle = registry.idle_connections(self.clock.now(), self.timeout);
        if !idle.is_empty() {
            info!(
                "Evicting {} idle session(s) after {:?}",
                idle.len(),
                self.timeout
            );
        }
        idle
    }
}
