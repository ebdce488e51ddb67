use tracing::{debug, error};

use crate::broker::QueueInfo;
use crate::client::Channel;
use crate::transport::message::{ErrorCode, QueueOptions};
use crate::utils::error::BusError;

/// Declares `queue` durable, shared and never auto-deleted.
///
/// Safe to call any number of times from any service. A queue that already
/// exists with other parameters is reported as `DeclareConflict`.
pub async fn ensure_queue(channel: &Channel, queue: &str) -> Result<QueueInfo, BusError> {
    match channel.declare_queue(queue, QueueOptions::DURABLE).await {
        Ok(info) => {
            debug!(
                queue,
                messages = info.message_count,
                consumers = info.consumer_count,
                "queue declared"
            );
            Ok(info)
        }
        Err(BusError::Remote {
            code: ErrorCode::PreconditionFailed,
            message,
        }) => {
            error!(queue, "queue exists with incompatible parameters: {message}");
            Err(BusError::DeclareConflict {
                queue: queue.to_string(),
                message,
            })
        }
        Err(e) => Err(e),
    }
}
