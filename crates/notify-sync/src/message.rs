//! Persistent-channel message envelopes.
//!
//! Inbound payloads are JSON objects discriminated by a `type` field. They
//! decode into [`InboundMessage`], one variant per message kind, so routing
//! is an exhaustive match rather than string comparison.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::config::Destinations;
use crate::error::Result;
use crate::model::{Notification, NotificationId, timestamp};

/// A message received over the persistent channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InboundMessage {
    /// A notification addressed to this user.
    NewNotification {
        notification: Notification,
        #[serde(default, with = "timestamp::option")]
        timestamp: Option<DateTime<Utc>>,
    },
    /// A notification sent to every user.
    BroadcastNotification {
        notification: Notification,
        #[serde(default, with = "timestamp::option")]
        timestamp: Option<DateTime<Utc>>,
    },
    /// Server-side unread counter changed.
    #[serde(rename_all = "camelCase")]
    UnreadCountUpdate {
        unread_count: u32,
        #[serde(default, with = "timestamp::option")]
        timestamp: Option<DateTime<Utc>>,
    },
    /// Server asks the client to re-fetch its unread counter.
    UnreadCountUpdateRequest {
        #[serde(default, with = "timestamp::option")]
        timestamp: Option<DateTime<Utc>>,
    },
    /// Server acknowledged a mark-read sent over the channel.
    #[serde(rename_all = "camelCase")]
    MarkReadAck {
        #[serde(default)]
        notification_id: Option<NotificationId>,
        #[serde(default, with = "timestamp::option")]
        timestamp: Option<DateTime<Utc>>,
    },
    ConnectAck {
        #[serde(default)]
        message: Option<String>,
        #[serde(default, with = "timestamp::option")]
        timestamp: Option<DateTime<Utc>>,
    },
    ConnectError {
        #[serde(default)]
        message: Option<String>,
        #[serde(default, with = "timestamp::option")]
        timestamp: Option<DateTime<Utc>>,
    },
}

impl InboundMessage {
    /// Decode a JSON message body.
    pub fn decode(body: &str) -> Result<Self> {
        Ok(serde_json::from_str(body)?)
    }

    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NewNotification { .. } => "NEW_NOTIFICATION",
            Self::BroadcastNotification { .. } => "BROADCAST_NOTIFICATION",
            Self::UnreadCountUpdate { .. } => "UNREAD_COUNT_UPDATE",
            Self::UnreadCountUpdateRequest { .. } => "UNREAD_COUNT_UPDATE_REQUEST",
            Self::MarkReadAck { .. } => "MARK_READ_ACK",
            Self::ConnectAck { .. } => "CONNECT_ACK",
            Self::ConnectError { .. } => "CONNECT_ERROR",
        }
    }
}

/// A message the client publishes to the application destinations.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    Connect {
        user_id: String,
        timestamp: DateTime<Utc>,
    },
    Disconnect {
        user_id: String,
    },
    MarkRead {
        id: NotificationId,
    },
    MarkBatchRead {
        ids: Vec<NotificationId>,
    },
    MarkAllRead,
    GetUnreadCount,
}

impl OutboundMessage {
    /// Destination this message is published to.
    pub fn destination(&self, destinations: &Destinations) -> String {
        let action = match self {
            Self::Connect { .. } => "connect",
            Self::Disconnect { .. } => "disconnect",
            Self::MarkRead { .. } => "markRead",
            Self::MarkBatchRead { .. } => "markBatchRead",
            Self::MarkAllRead => "markAllRead",
            Self::GetUnreadCount => "getUnreadCount",
        };
        format!("{}/{}", destinations.app_prefix.trim_end_matches('/'), action)
    }

    /// JSON payload for this message.
    pub fn payload(&self) -> Value {
        match self {
            Self::Connect { user_id, timestamp } => json!({
                "userId": user_id,
                "timestamp": timestamp.to_rfc3339(),
            }),
            Self::Disconnect { user_id } => json!({ "userId": user_id }),
            Self::MarkRead { id } => json!({ "notificationId": id }),
            Self::MarkBatchRead { ids } => json!({ "notificationIds": ids }),
            Self::MarkAllRead | Self::GetUnreadCount => json!({}),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Category;

    #[test]
    fn test_decode_new_notification() {
        let body = r#"{
            "type": "NEW_NOTIFICATION",
            "notification": {"id": 3, "title": "Archive due", "type": "archive", "read": false, "createdAt": "2024-05-01T08:00:00"},
            "timestamp": "2024-05-01T08:00:01"
        }"#;
        match InboundMessage::decode(body).unwrap() {
            InboundMessage::NewNotification {
                notification,
                timestamp,
            } => {
                assert_eq!(notification.id, NotificationId::Number(3));
                assert_eq!(notification.category, Category::Archive);
                assert!(timestamp.is_some());
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_decode_count_update() {
        let msg = InboundMessage::decode(r#"{"type":"UNREAD_COUNT_UPDATE","unreadCount":7}"#).unwrap();
        assert_eq!(
            msg,
            InboundMessage::UnreadCountUpdate {
                unread_count: 7,
                timestamp: None
            }
        );
        assert_eq!(msg.kind(), "UNREAD_COUNT_UPDATE");
    }

    #[test]
    fn test_untyped_payload_is_rejected() {
        // Responses on the reply queue carry no `type` discriminator.
        assert!(InboundMessage::decode(r#"{"success":true,"notificationId":1}"#).is_err());
        assert!(InboundMessage::decode(r#"{"type":"SOMETHING_ELSE"}"#).is_err());
    }

    #[test]
    fn test_outbound_destinations() {
        let destinations = Destinations::default();
        assert_eq!(
            OutboundMessage::MarkRead { id: 5.into() }.destination(&destinations),
            "/app/notification/markRead"
        );
        assert_eq!(
            OutboundMessage::MarkBatchRead {
                ids: vec![1.into(), "a".into()]
            }
            .payload(),
            json!({ "notificationIds": [1, "a"] })
        );
    }
}
