use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Notification item as returned by the backend.
///
/// Immutable once fetched; the client never edits these, it only overlays
/// local read/dismissed flags on top of them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteNotificationItem {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Server-side category (`order`, `promotion`, `support`, ...)
    #[serde(rename = "type", default)]
    pub kind: String,
}

/// Remote item plus the flags computed during a reconciliation pass.
///
/// Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DerivedNotificationView {
    #[serde(flatten)]
    pub item: RemoteNotificationItem,
    pub is_read: bool,
    pub is_dismissed: bool,
}

impl DerivedNotificationView {
    pub fn id(&self) -> &str {
        &self.item.id
    }
}

/// Result of one reconciliation pass, as consumed by the UI.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationSnapshot {
    /// Items that are not dismissed, in server order
    pub visible: Vec<DerivedNotificationView>,
    /// Visible items that are not read
    pub unread_count: usize,
}

impl NotificationSnapshot {
    /// Derive the visible collection and unread count.
    ///
    /// Dismissed wins over read: a dismissed item never counts as unread.
    pub fn derive(
        items: &[RemoteNotificationItem],
        is_read: impl Fn(&str) -> bool,
        is_dismissed: impl Fn(&str) -> bool,
    ) -> Self {
        let visible: Vec<DerivedNotificationView> = items
            .iter()
            .map(|item| DerivedNotificationView {
                is_read: is_read(&item.id),
                is_dismissed: is_dismissed(&item.id),
                item: item.clone(),
            })
            .filter(|view| !view.is_dismissed)
            .collect();

        let unread_count = visible.iter().filter(|view| !view.is_read).count();

        Self {
            visible,
            unread_count,
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.visible.iter().any(|view| view.id() == id)
    }

    pub fn is_empty(&self) -> bool {
        self.visible.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn item(id: &str) -> RemoteNotificationItem {
        RemoteNotificationItem {
            id: id.to_string(),
            title: format!("Order {id}"),
            body: String::new(),
            link: None,
            created_at: Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
            kind: "order".to_string(),
        }
    }

    #[test]
    fn test_parse_backend_item() {
        let json = r#"{
            "id": "n-1",
            "title": "Your order shipped",
            "body": "Tracking inside",
            "link": "/orders/42",
            "createdAt": "2026-03-01T12:00:00Z",
            "type": "order"
        }"#;

        let parsed: RemoteNotificationItem = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.id, "n-1");
        assert_eq!(parsed.kind, "order");
        assert_eq!(parsed.link.as_deref(), Some("/orders/42"));
    }

    #[test]
    fn test_dismissed_wins_over_read() {
        let items = vec![item("a"), item("b"), item("c")];

        let snapshot = NotificationSnapshot::derive(
            &items,
            |id| id == "a" || id == "b",
            |id| id == "b" || id == "c",
        );

        assert_eq!(snapshot.visible.len(), 1);
        assert!(snapshot.contains("a"));
        assert_eq!(snapshot.unread_count, 0);
    }

    #[test]
    fn test_unread_count_only_counts_visible() {
        let items = vec![item("a"), item("b")];
        let snapshot = NotificationSnapshot::derive(&items, |_| false, |id| id == "b");

        assert_eq!(snapshot.unread_count, 1);
        assert!(!snapshot.contains("b"));
    }
}
