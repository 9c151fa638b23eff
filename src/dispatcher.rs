//! Broadcast Dispatcher
//!
//! Fans one line out to every registered connection except its sender and
//! evicts recipients whose write fails.

use futures_util::future::join_all;
use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::registry::RegistryHandle;

#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: RegistryHandle,
}

impl Dispatcher {
    pub fn new(registry: RegistryHandle) -> Self {
        Self { registry }
    }

    /// Send `text` to everyone except `sender`
    ///
    /// Returns the number of recipients that received the line. A failed
    /// recipient is closed and removed from the registry; the failure is
    /// never reported to the sender and does not affect other recipients.
    pub async fn broadcast(&self, sender: &Connection, text: &str) -> usize {
        let targets = match self.registry.snapshot_broadcast_targets(sender.id()).await {
            Ok(targets) => targets,
            Err(e) => {
                warn!("Broadcast from {} skipped: {}", sender.id(), e);
                return 0;
            }
        };

        let results = join_all(targets.iter().map(|target| async move {
            let delivered = target.send(text).await;
            (target, delivered)
        }))
        .await;

        let mut delivered = 0;
        for (target, ok) in results {
            if ok {
                delivered += 1;
                continue;
            }

            info!(
                "Evicting connection {} ({}) after failed send",
                target.id(),
                target.display_name()
            );
            target.close().await;
            if let Err(e) = self.registry.remove(target.id()).await {
                warn!("Could not remove connection {}: {}", target.id(), e);
            }
        }

        debug!("Message forwarded to {} clients", delivered);
        delivered
    }
}
