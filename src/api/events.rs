use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

const DEFAULT_RECENT_LIMIT: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Info,
    Success,
    Error,
}

/// A user-visible notice, the headless counterpart of a toast.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Notice {
    pub level: NoticeLevel,
    pub title: String,
    pub description: String,
    pub at: DateTime<Utc>,
}

/// Logs every notice and keeps the newest ones for the notice feed.
#[derive(Clone)]
pub struct Notifier {
    recent: Arc<Mutex<VecDeque<Notice>>>,
    limit: usize,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(DEFAULT_RECENT_LIMIT)
    }
}

impl Notifier {
    pub fn new(limit: usize) -> Self {
        Self {
            recent: Arc::new(Mutex::new(VecDeque::new())),
            limit: limit.max(1),
        }
    }

    pub fn info(&self, title: &str, description: impl Into<String>) {
        self.push(NoticeLevel::Info, title, description.into());
    }

    pub fn success(&self, title: &str, description: impl Into<String>) {
        self.push(NoticeLevel::Success, title, description.into());
    }

    pub fn error(&self, title: &str, description: impl Into<String>) {
        self.push(NoticeLevel::Error, title, description.into());
    }

    fn push(&self, level: NoticeLevel, title: &str, description: String) {
        match level {
            NoticeLevel::Error => log::warn!("{title}: {description}"),
            _ => log::info!("{title}: {description}"),
        }
        let notice = Notice {
            level,
            title: title.to_string(),
            description,
            at: Utc::now(),
        };
        let mut recent = self.recent.lock().unwrap_or_else(|e| e.into_inner());
        if recent.len() >= self.limit {
            recent.pop_front();
        }
        recent.push_back(notice);
    }

    /// Newest first.
    pub fn recent(&self) -> Vec<Notice> {
        let recent = self.recent.lock().unwrap_or_else(|e| e.into_inner());
        recent.iter().rev().cloned().collect()
    }
}
