//! Presentation adapter.
//!
//! Views are pure functions over a [`Snapshot`]; nothing here mutates the
//! store directly. Store changes and connection status are translated into
//! [`PresentationEvent`]s that a UI layer renders as badges, lists and
//! transient alerts.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::engine::EngineHandle;
use crate::error::Result;
use crate::model::{Category, Notification, Priority};
use crate::store::{Snapshot, StoreChange};
use crate::transport::{ConnectionState, ConnectionStatus};

const ALERT_DURATION: Duration = Duration::from_millis(4500);
const BROADCAST_ALERT_DURATION: Duration = Duration::from_secs(6);

/// Unread entries, newest first.
pub fn unread_only(snapshot: &Snapshot) -> Vec<&Notification> {
    snapshot.iter().filter(|n| !n.read).collect()
}

pub fn read_only(snapshot: &Snapshot) -> Vec<&Notification> {
    snapshot.iter().filter(|n| n.read).collect()
}

pub fn by_type(snapshot: &Snapshot, category: Category) -> Vec<&Notification> {
    snapshot.iter().filter(|n| n.category == category).collect()
}

/// Entries created within `window` of now.
pub fn recent(snapshot: &Snapshot, window: Duration) -> Vec<&Notification> {
    recent_at(snapshot, window, Utc::now())
}

/// Entries created within `window` before `now`.
pub fn recent_at(snapshot: &Snapshot, window: Duration, now: DateTime<Utc>) -> Vec<&Notification> {
    let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX);
    let since = now.checked_sub_signed(window).unwrap_or(DateTime::<Utc>::MIN_UTC);
    snapshot.iter().filter(|n| n.created_at >= since).collect()
}

/// Combined list filter. Empty sets and `None` bounds match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NotificationFilter {
    pub read: Option<bool>,
    pub categories: Vec<Category>,
    pub priorities: Vec<Priority>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl NotificationFilter {
    pub fn matches(&self, n: &Notification) -> bool {
        if self.read.is_some_and(|read| n.read != read) {
            return false;
        }
        if !self.categories.is_empty() && !self.categories.contains(&n.category) {
            return false;
        }
        if !self.priorities.is_empty()
            && !n.priority.is_some_and(|p| self.priorities.contains(&p))
        {
            return false;
        }
        if self.from.is_some_and(|from| n.created_at < from) {
            return false;
        }
        if self.to.is_some_and(|to| n.created_at > to) {
            return false;
        }
        true
    }
}

pub fn filtered<'a>(snapshot: &'a Snapshot, filter: &NotificationFilter) -> Vec<&'a Notification> {
    snapshot.iter().filter(|n| filter.matches(n)).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertLevel {
    Info,
    Success,
    Warning,
    Error,
}

/// Transient popup for a newly arrived notification.
#[derive(Debug, Clone, PartialEq)]
pub struct Alert {
    pub notification: Notification,
    pub level: AlertLevel,
    pub duration: Duration,
}

impl Alert {
    pub fn for_notification(notification: &Notification) -> Self {
        let level = match notification.category {
            Category::Error => AlertLevel::Error,
            Category::Warning => AlertLevel::Warning,
            Category::Success => AlertLevel::Success,
            _ if notification.is_broadcast() => AlertLevel::Warning,
            _ => AlertLevel::Info,
        };
        let duration = if notification.is_broadcast() {
            BROADCAST_ALERT_DURATION
        } else {
            ALERT_DURATION
        };
        Self {
            notification: notification.clone(),
            level,
            duration,
        }
    }
}

/// User-facing connection indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionIndicator {
    Live,
    Retrying { attempt: u32 },
    /// Automatic retries are exhausted.
    ReconnectManually,
    Offline,
}

impl From<ConnectionStatus> for ConnectionIndicator {
    fn from(status: ConnectionStatus) -> Self {
        match status.state {
            ConnectionState::Connected => Self::Live,
            ConnectionState::Error if status.retry_exhausted => Self::ReconnectManually,
            ConnectionState::Error => Self::Retrying {
                attempt: status.failures,
            },
            ConnectionState::Connecting if status.failures > 0 => Self::Retrying {
                attempt: status.failures,
            },
            ConnectionState::Connecting | ConnectionState::Disconnected => Self::Offline,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PresentationEvent {
    SnapshotChanged { unread_count: u32, total: usize },
    Alert(Alert),
    Connection(ConnectionIndicator),
}

/// Events a store change produces.
pub fn events_for(change: &StoreChange, snapshot: &Snapshot) -> Vec<PresentationEvent> {
    let mut events = vec![PresentationEvent::SnapshotChanged {
        unread_count: snapshot.unread_count,
        total: snapshot.len(),
    }];
    if let StoreChange::Merged { inserted, .. } = change {
        events.extend(
            inserted
                .iter()
                .filter(|n| !n.read)
                .map(|n| PresentationEvent::Alert(Alert::for_notification(n))),
        );
    }
    events
}

/// UI-facing front of the engine.
#[derive(Clone)]
pub struct PresentationAdapter {
    engine: EngineHandle,
}

impl PresentationAdapter {
    pub fn new(engine: EngineHandle) -> Self {
        Self { engine }
    }

    pub fn events(&self) -> broadcast::Receiver<PresentationEvent> {
        self.engine.subscribe()
    }

    pub fn connection(&self) -> ConnectionIndicator {
        self.engine.status().into()
    }

    pub async fn snapshot(&self) -> Result<Snapshot> {
        self.engine.snapshot().await
    }

    /// Mark the notification read when it is unread and return its action link.
    pub async fn handle_click(&self, notification: &Notification) -> Result<Option<String>> {
        if !notification.read {
            self.engine.mark_read(notification.id.clone()).await?;
        }
        Ok(notification.action_url.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Audience;
    use chrono::TimeZone;
    use rstest::rstest;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, hour, 0, 0).unwrap()
    }

    fn note(id: i64, category: Category, read: bool, hour: u32) -> Notification {
        let mut n = Notification::new(id, format!("n{id}"), category, at(hour));
        n.read = read;
        n
    }

    fn snapshot() -> Snapshot {
        let mut notifications = vec![
            note(1, Category::System, false, 1),
            note(2, Category::Warning, true, 5),
            note(3, Category::Borrow, false, 9),
        ];
        notifications[2].priority = Some(Priority::High);
        notifications.reverse();
        Snapshot {
            notifications,
            unread_count: 2,
        }
    }

    fn ids(list: Vec<&Notification>) -> Vec<String> {
        list.iter().map(|n| n.id.to_string()).collect()
    }

    #[test]
    fn test_views() {
        let s = snapshot();
        assert_eq!(ids(unread_only(&s)), vec!["3", "1"]);
        assert_eq!(ids(read_only(&s)), vec!["2"]);
        assert_eq!(ids(by_type(&s, Category::Warning)), vec!["2"]);
        assert_eq!(ids(recent_at(&s, Duration::from_secs(5 * 3600), at(10))), vec!["3", "2"]);
    }

    #[test]
    fn test_filter_combines_conditions() {
        let s = snapshot();
        let filter = NotificationFilter {
            read: Some(false),
            priorities: vec![Priority::High, Priority::Urgent],
            ..Default::default()
        };
        assert_eq!(ids(filtered(&s, &filter)), vec!["3"]);

        let filter = NotificationFilter {
            categories: vec![Category::System, Category::Warning],
            from: Some(at(2)),
            ..Default::default()
        };
        assert_eq!(ids(filtered(&s, &filter)), vec!["2"]);
        assert_eq!(filtered(&s, &NotificationFilter::default()).len(), 3);
    }

    #[rstest]
    #[case(Category::Error, Audience::Personal, AlertLevel::Error, 4500)]
    #[case(Category::Warning, Audience::Personal, AlertLevel::Warning, 4500)]
    #[case(Category::Success, Audience::Personal, AlertLevel::Success, 4500)]
    #[case(Category::Borrow, Audience::Personal, AlertLevel::Info, 4500)]
    #[case(Category::System, Audience::Broadcast, AlertLevel::Warning, 6000)]
    #[case(Category::Error, Audience::Broadcast, AlertLevel::Error, 6000)]
    fn test_alert_mapping(
        #[case] category: Category,
        #[case] audience: Audience,
        #[case] level: AlertLevel,
        #[case] millis: u64,
    ) {
        let mut n = note(1, category, false, 1);
        n.audience = audience;
        let alert = Alert::for_notification(&n);
        assert_eq!(alert.level, level);
        assert_eq!(alert.duration, Duration::from_millis(millis));
    }

    #[rstest]
    #[case(ConnectionState::Connected, 0, false, ConnectionIndicator::Live)]
    #[case(ConnectionState::Error, 2, false, ConnectionIndicator::Retrying { attempt: 2 })]
    #[case(ConnectionState::Connecting, 2, false, ConnectionIndicator::Retrying { attempt: 2 })]
    #[case(ConnectionState::Error, 3, true, ConnectionIndicator::ReconnectManually)]
    #[case(ConnectionState::Connecting, 0, false, ConnectionIndicator::Offline)]
    #[case(ConnectionState::Disconnected, 0, false, ConnectionIndicator::Offline)]
    fn test_connection_indicator(
        #[case] state: ConnectionState,
        #[case] failures: u32,
        #[case] retry_exhausted: bool,
        #[case] expected: ConnectionIndicator,
    ) {
        let status = ConnectionStatus {
            state,
            failures,
            retry_in: None,
            retry_exhausted,
        };
        assert_eq!(ConnectionIndicator::from(status), expected);
    }

    #[test]
    fn test_alerts_only_for_inserted_unread() {
        let s = snapshot();
        let change = StoreChange::Merged {
            inserted: vec![note(4, Category::Info, false, 11), note(5, Category::Info, true, 12)],
            updated: vec![],
        };
        let events = events_for(&change, &s);
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[0],
            PresentationEvent::SnapshotChanged {
                unread_count: 2,
                total: 3
            }
        );

        let resync = StoreChange::Resynced {
            inserted: 3,
            removed: 0,
        };
        assert_eq!(events_for(&resync, &s).len(), 1);
    }
}
