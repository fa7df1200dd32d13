use tracing::warn;

use crate::cluster::SimpleTcpCluster;
use crate::message::{ClusterMessage, ClusterMessageBody};

pub trait ClusterListener: Send + Sync + 'static {
    fn accept(&self, message: &ClusterMessage) -> bool;

    fn message_received(&self, cluster: &SimpleTcpCluster, message: ClusterMessage) -> anyhow::Result<()>;
}

/// Routes session deltas and expiries to the manager named in the message.
#[derive(Debug, Default)]
pub struct ClusterSessionListener;

impl ClusterListener for ClusterSessionListener {
    fn accept(&self, message: &ClusterMessage) -> bool {
        matches!(
            message.body,
            ClusterMessageBody::SessionDelta { .. } | ClusterMessageBody::SessionExpired { .. }
        )
    }

    fn message_received(&self, cluster: &SimpleTcpCluster, message: ClusterMessage) -> anyhow::Result<()> {
        match cluster.manager(&message.context_name) {
            Some(manager) => manager.message_received(message),
            None => {
                warn!("context manager {} doesn't exist, dropping {}", message.context_name, message);
                Ok(())
            }
        }
    }
}
