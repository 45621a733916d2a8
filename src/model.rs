use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type NotificationId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    ClientAssigned,
    Task,
    Reminder,
    SystemAlert,
    #[serde(other)]
    Other,
}

impl Category {
    pub const KNOWN: [Category; 4] = [
        Category::ClientAssigned,
        Category::Task,
        Category::Reminder,
        Category::SystemAlert,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Category::ClientAssigned => "client_assigned",
            Category::Task => "task",
            Category::Reminder => "reminder",
            Category::SystemAlert => "system_alert",
            Category::Other => "other",
        }
    }
}

impl std::str::FromStr for Category {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase().replace('-', "_");
        Category::KNOWN
            .into_iter()
            .find(|category| category.as_str() == normalized)
            .ok_or_else(|| format!("Unknown notification category: {value}"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: NotificationId,
    #[serde(rename = "type", alias = "notification_type")]
    pub category: Category,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, alias = "is_read")]
    pub read: bool,
    #[serde(default)]
    pub read_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_completed: bool,
    pub created_at: DateTime<Utc>,
    /// Display-only fields the backend attaches (client name, links, ...).
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Notification {
    /// Enforces `read_at.is_some() == read`.
    pub fn normalized(mut self) -> Self {
        if self.read {
            if self.read_at.is_none() {
                self.read_at = Some(Utc::now());
            }
        } else {
            self.read_at = None;
        }
        self
    }

    /// Returns true when this call moved the record from unread to read.
    pub(crate) fn mark_read_at(&mut self, at: DateTime<Utc>) -> bool {
        if self.read {
            return false;
        }
        self.read = true;
        self.read_at = Some(at);
        true
    }

    /// Takes `incoming` as the new record but never lets it un-read `self`.
    pub(crate) fn merged_with(&self, incoming: Notification) -> Notification {
        let mut merged = incoming.normalized();
        if self.read {
            merged.read = true;
            merged.read_at = match (self.read_at, merged.read_at) {
                (Some(ours), Some(theirs)) => Some(ours.min(theirs)),
                (ours, theirs) => ours.or(theirs),
            };
        }
        merged
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadFilter {
    #[default]
    All,
    UnreadOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NotificationFilter {
    pub category: Option<Category>,
    pub read: ReadFilter,
}

impl NotificationFilter {
    pub fn matches(&self, notification: &Notification) -> bool {
        if let Some(category) = self.category {
            if notification.category != category {
                return false;
            }
        }
        match self.read {
            ReadFilter::All => true,
            ReadFilter::UnreadOnly => !notification.read,
        }
    }

    pub fn query(&self, page: u32, page_size: u32) -> NotificationQuery {
        NotificationQuery {
            category: self.category,
            include_read: self.read == ReadFilter::All,
            page,
            page_size,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationQuery {
    pub category: Option<Category>,
    pub include_read: bool,
    pub page: u32,
    pub page_size: u32,
}

impl NotificationQuery {
    pub(crate) fn params(&self) -> Vec<(&'static str, String)> {
        let mut params = Vec::with_capacity(4);
        if let Some(category) = self.category {
            params.push(("type", category.as_str().to_string()));
        }
        params.push(("include_read", self.include_read.to_string()));
        params.push(("page", self.page.to_string()));
        params.push(("page_size", self.page_size.to_string()));
        params
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotificationPage {
    #[serde(default)]
    pub count: u64,
    #[serde(default)]
    pub next: Option<String>,
    #[serde(default)]
    pub results: Vec<Notification>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NotificationPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_completed: Option<bool>,
}

#[derive(Debug, Serialize)]
pub(crate) struct BulkReadRequestWire<'a> {
    pub(crate) ids: &'a [NotificationId],
}

/// Count endpoints answer either with a bare integer or a keyed object.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum CountWire {
    Bare(i64),
    Keyed {
        #[serde(alias = "unread_count", alias = "updated", alias = "marked_read")]
        count: i64,
    },
}

impl CountWire {
    pub(crate) fn value(&self) -> u64 {
        let raw = match self {
            CountWire::Bare(value) => *value,
            CountWire::Keyed { count } => *count,
        };
        raw.max(0) as u64
    }
}

#[cfg(test)]
pub(crate) fn sample(id: NotificationId, category: Category, read: bool) -> Notification {
    Notification {
        id,
        category,
        title: format!("notification {id}"),
        message: String::new(),
        read,
        read_at: None,
        is_completed: false,
        created_at: Utc::now(),
        extra: serde_json::Map::new(),
    }
    .normalized()
}
