//! Notification data model.
//!
//! Field names follow the client contract (`camelCase`), with aliases for the
//! backend entity spelling so both payload shapes decode into the same type.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Opaque notification identity, unique per user scope.
///
/// Numeric strings normalize to [`NotificationId::Number`], so `1` and `"1"`
/// address the same notification.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NotificationId {
    Number(i64),
    Text(String),
}

impl fmt::Display for NotificationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for NotificationId {
    fn from(value: i64) -> Self {
        Self::Number(value)
    }
}

impl From<&str> for NotificationId {
    fn from(value: &str) -> Self {
        match value.trim().parse::<i64>() {
            Ok(n) => Self::Number(n),
            Err(_) => Self::Text(value.to_string()),
        }
    }
}

impl From<String> for NotificationId {
    fn from(value: String) -> Self {
        match value.trim().parse::<i64>() {
            Ok(n) => Self::Number(n),
            Err(_) => Self::Text(value),
        }
    }
}

impl FromStr for NotificationId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from(s))
    }
}

impl Serialize for NotificationId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Number(n) => serializer.serialize_i64(*n),
            Self::Text(s) => serializer.serialize_str(s),
        }
    }
}

impl<'de> Deserialize<'de> for NotificationId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Number(i64),
            Text(String),
        }

        Ok(match Repr::deserialize(deserializer)? {
            Repr::Number(n) => Self::Number(n),
            Repr::Text(s) => Self::from(s),
        })
    }
}

/// Notification category tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Category {
    System,
    User,
    Archive,
    Borrow,
    Approval,
    Alert,
    Success,
    Warning,
    Error,
    #[default]
    Info,
    /// A category this client does not know about.
    Other,
}

impl Category {
    pub const ALL: [Category; 10] = [
        Category::System,
        Category::User,
        Category::Archive,
        Category::Borrow,
        Category::Approval,
        Category::Alert,
        Category::Success,
        Category::Warning,
        Category::Error,
        Category::Info,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Archive => "archive",
            Self::Borrow => "borrow",
            Self::Approval => "approval",
            Self::Alert => "alert",
            Self::Success => "success",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Info => "info",
            Self::Other => "other",
        }
    }

    /// Backend integer codes (1 = system, 3 = warning, 4 = error).
    fn from_code(code: i64) -> Self {
        match code {
            1 => Self::System,
            3 => Self::Warning,
            4 => Self::Error,
            _ => Self::Other,
        }
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        Category::ALL
            .into_iter()
            .find(|c| c.as_str() == normalized)
            .ok_or_else(|| format!("unknown notification category: {s}"))
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Category {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Category {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match CodeOrText::deserialize(deserializer)? {
            CodeOrText::Code(code) => Self::from_code(code),
            CodeOrText::Text(text) => text.parse().unwrap_or(Self::Other),
        })
    }
}

/// Notification priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Priority {
    Low,
    Normal,
    High,
    Urgent,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Urgent => "urgent",
        }
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" | "1" => Ok(Self::Low),
            "normal" | "medium" | "2" => Ok(Self::Normal),
            "high" | "3" => Ok(Self::High),
            "urgent" | "4" => Ok(Self::Urgent),
            other => Err(format!("unknown priority: {other}")),
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Priority {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Priority {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = match CodeOrText::deserialize(deserializer)? {
            CodeOrText::Code(code) => code.to_string(),
            CodeOrText::Text(text) => text,
        };
        // Unknown priorities fall back to normal rather than rejecting the notification.
        Ok(raw.parse().unwrap_or(Self::Normal))
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CodeOrText {
    Code(i64),
    Text(String),
}

/// Who a notification was addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Audience {
    #[default]
    Personal,
    Broadcast,
}

/// Reference to the business entity a notification is about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelatedEntity {
    pub entity_type: String,
    pub id: String,
}

/// A single user-facing notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    #[serde(alias = "notificationId")]
    pub id: NotificationId,
    pub title: String,
    #[serde(rename = "content", alias = "body", default)]
    pub body: String,
    #[serde(rename = "type", alias = "notificationType", default)]
    pub category: Category,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(alias = "isRead", default)]
    pub read: bool,
    #[serde(alias = "createTime", with = "timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(
        alias = "updateTime",
        default,
        with = "timestamp::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(alias = "businessType", default, skip_serializing_if = "Option::is_none")]
    pub related_type: Option<String>,
    #[serde(
        alias = "businessId",
        default,
        with = "opt_string_or_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub related_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default)]
    pub audience: Audience,
}

impl Notification {
    /// Create an unread notification with the required fields.
    pub fn new(
        id: impl Into<NotificationId>,
        title: impl Into<String>,
        category: Category,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            body: String::new(),
            category,
            priority: None,
            read: false,
            created_at,
            updated_at: None,
            related_type: None,
            related_id: None,
            action_url: None,
            action_text: None,
            sender_name: None,
            icon: None,
            extra: None,
            audience: Audience::Personal,
        }
    }

    /// Timestamp used to order competing versions of the same notification.
    pub fn effective_timestamp(&self) -> DateTime<Utc> {
        self.updated_at.unwrap_or(self.created_at)
    }

    /// The related business entity, when both halves are present.
    pub fn related(&self) -> Option<RelatedEntity> {
        match (&self.related_type, &self.related_id) {
            (Some(entity_type), Some(id)) if !entity_type.is_empty() && !id.is_empty() => {
                Some(RelatedEntity {
                    entity_type: entity_type.clone(),
                    id: id.clone(),
                })
            }
            _ => None,
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.audience == Audience::Broadcast
    }
}

/// One page of a paginated list response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub list: Vec<T>,
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub current: u32,
    #[serde(default)]
    pub size: u32,
    #[serde(default)]
    pub pages: u32,
}

mod opt_string_or_number {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<String>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(v) => serializer.serialize_str(v),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Number(i64),
            Text(String),
        }

        Ok(Option::<Repr>::deserialize(deserializer)?.map(|r| match r {
            Repr::Number(n) => n.to_string(),
            Repr::Text(s) => s,
        }))
    }
}

/// Lenient timestamp (de)serialization.
///
/// Accepts RFC 3339, naive `T`- or space-separated date-times (read as UTC)
/// and epoch milliseconds. Always serializes as RFC 3339.
pub mod timestamp {
    use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
    use serde::{Deserialize, Deserializer, Serializer, de::Error as _};

    const NAIVE_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Millis(i64),
        Text(String),
    }

    /// Parse a timestamp string in any of the accepted textual formats.
    pub fn parse(text: &str) -> Option<DateTime<Utc>> {
        let text = text.trim();
        if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
            return Some(dt.with_timezone(&Utc));
        }
        NAIVE_FORMATS
            .iter()
            .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
            .map(|naive| naive.and_utc())
    }

    fn from_raw(raw: Raw) -> Option<DateTime<Utc>> {
        match raw {
            Raw::Millis(ms) => Utc.timestamp_millis_opt(ms).single(),
            Raw::Text(text) => parse(&text),
        }
    }

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_rfc3339())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = Raw::deserialize(deserializer)?;
        from_raw(raw).ok_or_else(|| D::Error::custom("invalid timestamp"))
    }

    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(
            value: &Option<DateTime<Utc>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(dt) => super::serialize(dt, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<DateTime<Utc>>, D::Error> {
            // Malformed optional timestamps are treated as absent.
            Ok(Option::<Raw>::deserialize(deserializer)?.and_then(from_raw))
        }
    }
}
