//! User-visible, dismissible notices raised when a live read fails.

use std::fmt::{self, Display};
use std::sync::Arc;

use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NoticeSource {
    Roster,
    Tracking,
    Attendance,
}

impl Display for NoticeSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Roster => f.write_str("roster"),
            Self::Tracking => f.write_str("tracking"),
            Self::Attendance => f.write_str("attendance"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub source: NoticeSource,
    pub message: String,
}

/// Shared notice board for one client view.
#[derive(Debug, Clone)]
pub struct Notices {
    board: Arc<watch::Sender<Vec<Notice>>>,
}

impl Default for Notices {
    fn default() -> Self {
        Self::new()
    }
}

impl Notices {
    #[must_use]
    pub fn new() -> Self {
        let (board, _) = watch::channel(Vec::new());
        Self { board: Arc::new(board) }
    }

    /// Raise a notice. At most one notice per source is shown at a time.
    pub fn post(&self, source: NoticeSource, message: impl Into<String>) {
        let notice = Notice { source, message: message.into() };
        self.board.send_if_modified(|notices| {
            if notices.iter().any(|existing| existing.source == source) {
                return false;
            }
            notices.push(notice);
            true
        });
    }

    #[must_use]
    pub fn current(&self) -> Vec<Notice> {
        self.board.borrow().clone()
    }

    pub fn dismiss(&self, source: NoticeSource) {
        self.board.send_if_modified(|notices| {
            let before = notices.len();
            notices.retain(|notice| notice.source != source);
            notices.len() != before
        });
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Vec<Notice>> {
        self.board.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_notice_per_source() {
        let notices = Notices::new();
        notices.post(NoticeSource::Roster, "roster feed interrupted");
        notices.post(NoticeSource::Roster, "roster feed interrupted again");
        notices.post(NoticeSource::Tracking, "vehicle feed interrupted");
        assert_eq!(notices.current().len(), 2);

        notices.dismiss(NoticeSource::Roster);
        assert_eq!(
            notices.current(),
            vec![Notice {
                source: NoticeSource::Tracking,
                message: "vehicle feed interrupted".to_string()
            }]
        );
    }
}
