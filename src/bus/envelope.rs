use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::transport::message::MessageProperties;
use crate::utils::error::BusError;

pub const CONTENT_TYPE_JSON: &str = "application/json";

/// A payload together with the metadata it travels with.
///
/// The body is the JSON of the payload alone; its type is implied by the
/// queue it is published on.
///
/// ```
/// use salesbus::bus::Envelope;
///
/// let envelope = Envelope::seal(&vec![1, 2, 3]).unwrap();
/// assert_eq!(envelope.body, "[1,2,3]");
/// assert!(envelope.persistent);
/// let back: Vec<i32> = envelope.open().unwrap();
/// assert_eq!(back, vec![1, 2, 3]);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub message_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub content_type: String,
    pub persistent: bool,
    pub body: String,
}

impl Envelope {
    /// Serializes `payload` into a new persistent envelope with a fresh id.
    pub fn seal<T: Serialize>(payload: &T) -> Result<Self, BusError> {
        Ok(Self {
            message_id: Uuid::new_v4(),
            created_at: Utc::now(),
            content_type: CONTENT_TYPE_JSON.to_string(),
            persistent: true,
            body: serde_json::to_string(payload)?,
        })
    }

    pub fn open<T: DeserializeOwned>(&self) -> Result<T, BusError> {
        Ok(serde_json::from_str(&self.body)?)
    }

    pub fn properties(&self) -> MessageProperties {
        MessageProperties {
            message_id: self.message_id.to_string(),
            timestamp: self.created_at.timestamp_millis(),
            content_type: self.content_type.clone(),
            persistent: self.persistent,
        }
    }

    /// Rebuilds the envelope of a delivered message.
    pub fn from_delivery(properties: &MessageProperties, body: String) -> Result<Self, BusError> {
        let invalid = |reason: String| BusError::InvalidEnvelope {
            message_id: properties.message_id.clone(),
            reason,
        };

        let message_id = Uuid::parse_str(&properties.message_id)
            .map_err(|e| invalid(format!("message id: {e}")))?;
        let created_at = DateTime::from_timestamp_millis(properties.timestamp)
            .ok_or_else(|| invalid(format!("timestamp {} out of range", properties.timestamp)))?;
        if properties.content_type != CONTENT_TYPE_JSON {
            return Err(invalid(format!(
                "unsupported content type '{}'",
                properties.content_type
            )));
        }

        Ok(Self {
            message_id,
            created_at,
            content_type: properties.content_type.clone(),
            persistent: properties.persistent,
            body,
        })
    }
}
