//! Sequential fan-out of state updates.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{trace, warn};

use super::Notifier;
use crate::types::{DeploymentInfo, WorkflowState};

/// Counters kept by a [`StateReceiver`].
#[derive(Debug, Default)]
pub struct ReceiverStats {
    signals_received: AtomicU64,
    notifier_failures: AtomicU64,
}

impl ReceiverStats {
    pub fn signals_received(&self) -> u64 {
        self.signals_received.load(Ordering::Relaxed)
    }

    pub fn notifier_failures(&self) -> u64 {
        self.notifier_failures.load(Ordering::Relaxed)
    }
}

/// Hands each workflow state to the internal notifiers, then the external ones.
#[derive(Clone, Default)]
pub struct StateReceiver {
    internal: Vec<Arc<dyn Notifier>>,
    external: Vec<Arc<dyn Notifier>>,
    stats: Arc<ReceiverStats>,
}

impl StateReceiver {
    pub fn new(internal: Vec<Arc<dyn Notifier>>, external: Vec<Arc<dyn Notifier>>) -> Self {
        StateReceiver {
            internal,
            external,
            stats: Arc::default(),
        }
    }

    pub fn stats(&self) -> &ReceiverStats {
        &self.stats
    }

    /// Delivers `state` to every notifier, in order. Never fails.
    pub async fn receive(&self, state: WorkflowState, info: &DeploymentInfo) {
        self.stats.signals_received.fetch_add(1, Ordering::Relaxed);
        trace!(deployment = %info.id, complete = state.is_complete(), "workflow state received");

        for notifier in self.internal.iter().chain(self.external.iter()) {
            if let Err(e) = notifier.notify(info, &state).await {
                self.stats.notifier_failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    notifier = notifier.name(),
                    deployment = %info.id,
                    error = %e,
                    "notifier failed"
                );
            }
        }
    }
}
