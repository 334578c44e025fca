use crate::error::Result;
use crate::locks::PodLocks;
use crate::reconciler::{is_expected_race, ResourceReconciler};
use podlink_core::{PodEvent, PodRecord};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Dispatches pod lifecycle events to the reconciler, one at a time, each
/// under its pod's lock.
pub struct PodEventProcessor {
    reconciler: Arc<ResourceReconciler>,
    locks: Arc<PodLocks>,
}

impl PodEventProcessor {
    pub fn new(reconciler: Arc<ResourceReconciler>, locks: Arc<PodLocks>) -> Self {
        Self { reconciler, locks }
    }

    /// Drain `events` until the channel closes or the token is cancelled
    pub async fn run(
        &self,
        mut events: mpsc::Receiver<PodEvent>,
        token: CancellationToken,
    ) -> Result<()> {
        info!("Starting pod event processor");

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("Pod event processor shutting down");
                    return Ok(());
                }
                event = events.recv() => match event {
                    Some(event) => self.handle(event).await,
                    None => {
                        info!("Pod event channel closed");
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Process one event, logging instead of returning failures
    pub async fn handle(&self, event: PodEvent) {
        let kind = event.type_name().to_string();
        let uid = event.uid().unwrap_or("-").to_string();

        match self.process(event).await {
            Ok(()) => {}
            Err(e) if is_expected_race(&e) => {
                info!("{} event for pod {} deferred: {}", kind, uid, e);
            }
            Err(e) => {
                error!("Failed to process {} event for pod {}: {}", kind, uid, e);
            }
        }
    }

    /// Process one event. Only failures the reconciler could not absorb are
    /// returned.
    pub async fn process(&self, event: PodEvent) -> Result<()> {
        match event {
            PodEvent::Added(pod) => self.apply(&pod, true).await,
            PodEvent::Modified(pod) => self.apply(&pod, false).await,
            PodEvent::Deleted(deleted) => {
                let _guard = self.locks.lock(&deleted.uid).await;
                debug!("Deleting pod {}", deleted.uid);
                self.reconciler.delete(&deleted.uid).await
            }
            PodEvent::Unknown { event_type } => {
                warn!("Ignoring pod event of unknown type {}", event_type);
                Ok(())
            }
        }
    }

    async fn apply(&self, pod: &PodRecord, added: bool) -> Result<()> {
        if pod.host_network {
            debug!(
                "Pod {}/{} uses the host network, skipping",
                pod.namespace, pod.name
            );
            return Ok(());
        }

        let _guard = self.locks.lock(&pod.uid).await;

        let host_port = if self.reconciler.config().nested_mode {
            match self.reconciler.nested().resolve_host_port(&pod.uid).await? {
                Some(port) => Some(port),
                None => {
                    info!(
                        "Host port of nested pod {}/{} not known yet, deferring",
                        pod.namespace, pod.name
                    );
                    return Ok(());
                }
            }
        } else {
            None
        };

        let labels = self.reconciler.labels().effective(pod);
        if added {
            self.reconciler.add(pod, &labels, host_port.as_ref()).await
        } else {
            self.reconciler.update(pod, &labels, host_port.as_ref()).await
        }
    }
}
