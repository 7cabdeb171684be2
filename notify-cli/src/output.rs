use chrono::Local;
#[cfg(feature = "colored-output")]
use colored::*;
use notify_sync::{
    Alert, AlertLevel, ConnectionIndicator, Notification, NotificationId, Page, PresentationEvent,
    Snapshot,
};
use serde_json::{Value, json};

use crate::cli::OutputFormat;

#[derive(Debug, Clone, Copy)]
enum Tone {
    Title,
    Muted,
    Good,
    Info,
    Warn,
    Bad,
}

pub struct OutputManager {
    format: OutputFormat,
    colored: bool,
}

impl OutputManager {
    pub fn new(format: OutputFormat) -> Self {
        Self {
            format,
            colored: cfg!(feature = "colored-output"),
        }
    }

    #[cfg(test)]
    fn plain(format: OutputFormat) -> Self {
        Self {
            format,
            colored: false,
        }
    }

    pub fn is_json(&self) -> bool {
        self.format == OutputFormat::Json
    }

    fn paint(&self, text: &str, tone: Tone) -> String {
        if !self.colored {
            return text.to_string();
        }
        #[cfg(feature = "colored-output")]
        {
            match tone {
                Tone::Title => text.bold().to_string(),
                Tone::Muted => text.dimmed().to_string(),
                Tone::Good => text.green().to_string(),
                Tone::Info => text.cyan().to_string(),
                Tone::Warn => text.yellow().to_string(),
                Tone::Bad => text.red().bold().to_string(),
            }
        }
        #[cfg(not(feature = "colored-output"))]
        {
            let _ = tone;
            text.to_string()
        }
    }

    fn line(&self, n: &Notification) -> String {
        let marker = if n.read {
            self.paint(" ", Tone::Muted)
        } else {
            self.paint("●", Tone::Info)
        };
        let when = n.created_at.with_timezone(&Local).format("%Y-%m-%d %H:%M");
        let mut line = format!(
            "{marker} {:>6}  {}  {:<9} {}",
            n.id.to_string(),
            self.paint(&when.to_string(), Tone::Muted),
            n.category.as_str(),
            self.paint(&n.title, if n.read { Tone::Muted } else { Tone::Title }),
        );
        if let Some(priority) = n.priority {
            line.push_str(&format!(" [{priority}]"));
        }
        if !n.body.is_empty() {
            line.push_str(&format!("\n          {}", n.body));
        }
        line
    }

    pub fn page(&self, page: &Page<Notification>) -> String {
        if self.is_json() {
            return json!({
                "total": page.total,
                "page": page.current,
                "pages": page.pages,
                "items": page.list,
            })
            .to_string();
        }
        if page.list.is_empty() {
            return self.paint("No notifications", Tone::Muted);
        }
        let mut out: Vec<String> = page.list.iter().map(|n| self.line(n)).collect();
        out.push(self.paint(
            &format!("page {}/{} ({} total)", page.current, page.pages.max(1), page.total),
            Tone::Muted,
        ));
        out.join("\n")
    }

    pub fn snapshot(&self, snapshot: &Snapshot) -> String {
        if self.is_json() {
            return json!({
                "event": "snapshot",
                "unreadCount": snapshot.unread_count,
                "items": snapshot.notifications,
            })
            .to_string();
        }
        let mut out = vec![self.paint(
            &format!("{} notifications, {} unread", snapshot.len(), snapshot.unread_count),
            Tone::Title,
        )];
        out.extend(snapshot.iter().map(|n| self.line(n)));
        out.join("\n")
    }

    pub fn unread_count(&self, count: u32) -> String {
        if self.is_json() {
            json!({ "unreadCount": count }).to_string()
        } else {
            count.to_string()
        }
    }

    /// Result of an acknowledgement command.
    pub fn done(&self, action: &str, ids: &[NotificationId]) -> String {
        if self.is_json() {
            return json!({ "status": "ok", "action": action, "ids": ids }).to_string();
        }
        let target = if ids.is_empty() {
            "all notifications".to_string()
        } else {
            ids.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
        };
        format!("{} {action}: {target}", self.paint("✓", Tone::Good))
    }

    /// Render a live event, or `None` when it has nothing to show.
    pub fn event(&self, event: &PresentationEvent) -> Option<String> {
        if self.is_json() {
            return Some(event_json(event).to_string());
        }
        match event {
            PresentationEvent::SnapshotChanged { .. } => None,
            PresentationEvent::Alert(alert) => Some(self.alert(alert)),
            PresentationEvent::Connection(indicator) => Some(self.indicator(*indicator)),
        }
    }

    fn alert(&self, alert: &Alert) -> String {
        let tone = match alert.level {
            AlertLevel::Info => Tone::Info,
            AlertLevel::Success => Tone::Good,
            AlertLevel::Warning => Tone::Warn,
            AlertLevel::Error => Tone::Bad,
        };
        let label = if alert.notification.is_broadcast() {
            "BROADCAST"
        } else {
            level_name(alert.level)
        };
        format!("{} {}", self.paint(&format!("[{label}]"), tone), self.line(&alert.notification))
    }

    fn indicator(&self, indicator: ConnectionIndicator) -> String {
        match indicator {
            ConnectionIndicator::Live => self.paint("● live", Tone::Good),
            ConnectionIndicator::Retrying { attempt } => {
                self.paint(&format!("◌ reconnecting (attempt {attempt})"), Tone::Warn)
            }
            ConnectionIndicator::ReconnectManually => self.paint(
                "✗ channel unavailable, polling (restart to reconnect)",
                Tone::Bad,
            ),
            ConnectionIndicator::Offline => self.paint("○ offline", Tone::Muted),
        }
    }

    pub fn error(&self, message: &str) -> String {
        if self.is_json() {
            json!({ "status": "error", "message": message }).to_string()
        } else {
            format!("{} {message}", self.paint("Error:", Tone::Bad))
        }
    }
}

fn level_name(level: AlertLevel) -> &'static str {
    match level {
        AlertLevel::Info => "info",
        AlertLevel::Success => "success",
        AlertLevel::Warning => "warning",
        AlertLevel::Error => "error",
    }
}

fn indicator_name(indicator: ConnectionIndicator) -> &'static str {
    match indicator {
        ConnectionIndicator::Live => "live",
        ConnectionIndicator::Retrying { .. } => "retrying",
        ConnectionIndicator::ReconnectManually => "reconnect_manually",
        ConnectionIndicator::Offline => "offline",
    }
}

fn event_json(event: &PresentationEvent) -> Value {
    match event {
        PresentationEvent::SnapshotChanged {
            unread_count,
            total,
        } => json!({ "event": "snapshot_changed", "unreadCount": unread_count, "total": total }),
        PresentationEvent::Alert(alert) => json!({
            "event": "alert",
            "level": level_name(alert.level),
            "durationMs": alert.duration.as_millis() as u64,
            "notification": alert.notification,
        }),
        PresentationEvent::Connection(indicator) => {
            let attempt = match indicator {
                ConnectionIndicator::Retrying { attempt } => Some(*attempt),
                _ => None,
            };
            json!({ "event": "connection", "state": indicator_name(*indicator), "attempt": attempt })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use notify_sync::Category;
    use std::time::Duration;

    fn note(id: i64, read: bool) -> Notification {
        let mut n = Notification::new(
            id,
            format!("title {id}"),
            Category::Archive,
            Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap(),
        );
        n.read = read;
        n
    }

    #[test]
    fn test_page_pretty_and_json() {
        let page = Page {
            list: vec![note(1, false), note(2, true)],
            total: 2,
            current: 1,
            size: 20,
            pages: 1,
        };
        let pretty = OutputManager::plain(OutputFormat::Pretty).page(&page);
        assert!(pretty.contains("title 1"));
        assert!(pretty.contains("archive"));
        assert!(pretty.ends_with("page 1/1 (2 total)"));

        let value: Value =
            serde_json::from_str(&OutputManager::plain(OutputFormat::Json).page(&page)).unwrap();
        assert_eq!(value["total"], 2);
        assert_eq!(value["items"][1]["id"], 2);
    }

    #[test]
    fn test_done_message() {
        let out = OutputManager::plain(OutputFormat::Pretty);
        assert_eq!(out.done("marked read", &[1.into(), 2.into()]), "✓ marked read: 1, 2");
        assert_eq!(out.done("deleted", &[]), "✓ deleted: all notifications");
    }

    #[test]
    fn test_events() {
        let out = OutputManager::plain(OutputFormat::Pretty);
        let changed = PresentationEvent::SnapshotChanged {
            unread_count: 1,
            total: 2,
        };
        assert_eq!(out.event(&changed), None);
        assert_eq!(
            out.event(&PresentationEvent::Connection(ConnectionIndicator::Retrying { attempt: 2 })),
            Some("◌ reconnecting (attempt 2)".to_string())
        );

        let alert = Alert {
            notification: note(3, false),
            level: AlertLevel::Warning,
            duration: Duration::from_millis(4500),
        };
        let json = OutputManager::plain(OutputFormat::Json)
            .event(&PresentationEvent::Alert(alert))
            .unwrap();
        let value: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["event"], "alert");
        assert_eq!(value["level"], "warning");
        assert_eq!(value["durationMs"], 4500);
        assert_eq!(value["notification"]["id"], 3);
    }

    #[test]
    fn test_error_json() {
        let value: Value =
            serde_json::from_str(&OutputManager::plain(OutputFormat::Json).error("boom")).unwrap();
        assert_eq!(value["status"], "error");
        assert_eq!(value["message"], "boom");
    }
}
