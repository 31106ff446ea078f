//! Informational messages shown to the operator.
//!
//! Non-fatal failures, provider log events and validation problems all end
//! up here instead of being propagated.

use std::collections::VecDeque;

/// Number of messages kept in the history.
pub const INFO_HISTORY_LIMIT: usize = 32;

#[derive(Debug, Clone, PartialEq)]
pub struct InfoMessage {
    pub message: String,
    pub link: Option<String>,
    pub timestamp: chrono::DateTime<chrono::Local>,
}

impl InfoMessage {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            link: None,
            timestamp: chrono::Local::now(),
        }
    }

    pub fn with_link(mut self, link: impl Into<String>) -> Self {
        self.link = Some(link.into());
        self
    }

    /// Failure text, with a hint appended for well-known wallet problems.
    pub fn failure(error: impl std::fmt::Display) -> Self {
        let error_msg = error.to_string();
        let lower = error_msg.to_lowercase();
        let message = if lower.contains("apdu") || lower.contains("6a80") || lower.contains("invalid_data") {
            format!(
                "{}\n\nMake sure \"Blind Signing\" is enabled in your Ledger Ethereum app settings.",
                error_msg
            )
        } else if lower.contains("ledger") && (lower.contains("denied") || lower.contains("rejected")) {
            format!("{}\n\nTransaction was rejected on the Ledger device.", error_msg)
        } else {
            error_msg
        };
        Self::new(message)
    }

    pub fn time_ago(&self) -> String {
        let now = chrono::Local::now();
        let duration = now.signed_duration_since(self.timestamp);
        if duration.num_seconds() < 60 {
            "just now".to_string()
        } else if duration.num_minutes() < 60 {
            format!("{}m ago", duration.num_minutes())
        } else if duration.num_hours() < 24 {
            format!("{}h ago", duration.num_hours())
        } else {
            self.timestamp.format("%m/%d %H:%M").to_string()
        }
    }
}

/// Bounded message history, newest last.
#[derive(Debug, Clone, Default)]
pub struct InfoLog {
    entries: VecDeque<InfoMessage>,
}

impl InfoLog {
    pub fn push(&mut self, entry: InfoMessage) {
        if self.entries.len() == INFO_HISTORY_LIMIT {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn last(&self) -> Option<&InfoMessage> {
        self.entries.back()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_adds_blind_signing_hint() {
        let info = InfoMessage::failure("Ledger error: APDU 6a80");
        assert!(info.message.contains("Blind Signing"));
    }

    #[test]
    fn test_failure_adds_rejection_hint() {
        let info = InfoMessage::failure("Ledger error: request denied by user");
        assert!(info.message.contains("rejected on the Ledger device"));
    }

    #[test]
    fn test_failure_plain_message_unchanged() {
        let info = InfoMessage::failure("[func: seats] execution reverted");
        assert_eq!(info.message, "[func: seats] execution reverted");
        assert!(info.link.is_none());
    }

    #[test]
    fn test_time_ago_recent() {
        assert_eq!(InfoMessage::new("x").time_ago(), "just now");
    }

    #[test]
    fn test_info_log_is_bounded() {
        let mut log = InfoLog::default();
        for i in 0..INFO_HISTORY_LIMIT + 5 {
            log.push(InfoMessage::new(format!("message {}", i)));
        }
        assert_eq!(log.entries.len(), INFO_HISTORY_LIMIT);
        assert_eq!(log.entries.front().unwrap().message, "message 5");
        assert_eq!(
            log.last().unwrap().message,
            format!("message {}", INFO_HISTORY_LIMIT + 4)
        );
    }
}
