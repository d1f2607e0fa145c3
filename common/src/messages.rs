//! Append-only, severity-tagged log of everything a mirror run reports
//!
//! Each message is also forwarded to `tracing` and, if configured, to a line sink (usually a
//! log file opened by the binary).

use std::sync::{Mutex, PoisonError};

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
pub enum Severity {
    Verbose,
    Info,
    Warning,
    Error,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self {
            Severity::Verbose => "VERBOSE",
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Error => "ERROR",
            Severity::Critical => "CRITICAL",
        };
        f.write_str(tag)
    }
}

#[derive(Clone, Debug)]
pub struct Message {
    pub severity: Severity,
    pub text: String,
    pub at: chrono::DateTime<chrono::Local>,
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} [{}] {}",
            self.at.format("%Y-%m-%d %H:%M:%S"),
            self.severity,
            self.text
        )
    }
}

pub type LineSink = Box<dyn Fn(&str) + Send + Sync>;

#[derive(Default)]
pub struct MessageLog {
    messages: Mutex<Vec<Message>>,
    sink: Option<LineSink>,
}

impl std::fmt::Debug for MessageLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageLog")
            .field("messages", &self.len())
            .field("sink", &self.sink.is_some())
            .finish()
    }
}

impl MessageLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_sink(sink: LineSink) -> Self {
        Self {
            messages: Mutex::default(),
            sink: Some(sink),
        }
    }

    pub fn add(&self, severity: Severity, text: impl Into<String>) {
        let message = Message {
            severity,
            text: text.into(),
            at: chrono::Local::now(),
        };
        match severity {
            Severity::Verbose => tracing::debug!("{}", message.text),
            Severity::Info => tracing::info!("{}", message.text),
            Severity::Warning => tracing::warn!("{}", message.text),
            Severity::Error | Severity::Critical => tracing::error!("{}", message.text),
        }
        if let Some(sink) = &self.sink {
            sink(&message.to_string());
        }
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message);
    }

    pub fn verbose(&self, text: impl Into<String>) {
        self.add(Severity::Verbose, text);
    }

    pub fn info(&self, text: impl Into<String>) {
        self.add(Severity::Info, text);
    }

    pub fn warning(&self, text: impl Into<String>) {
        self.add(Severity::Warning, text);
    }

    pub fn error(&self, text: impl Into<String>) {
        self.add(Severity::Error, text);
    }

    pub fn critical(&self, text: impl Into<String>) {
        self.add(Severity::Critical, text);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of all messages logged so far, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Message> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn count(&self, severity: Severity) -> usize {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|m| m.severity == severity)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn messages_are_kept_in_order() {
        let log = MessageLog::new();
        log.info("first");
        log.error("second");
        log.critical("third");
        let texts: Vec<_> = log.snapshot().into_iter().map(|m| m.text).collect();
        assert_eq!(texts, vec!["first", "second", "third"]);
        assert_eq!(log.count(Severity::Error), 1);
        assert_eq!(log.count(Severity::Warning), 0);
    }

    #[test]
    fn sink_receives_formatted_lines() {
        let lines = Arc::new(Mutex::new(Vec::<String>::new()));
        let log = {
            let lines = lines.clone();
            MessageLog::with_sink(Box::new(move |line| {
                lines.lock().unwrap().push(line.to_string());
            }))
        };
        log.warning("disk is slow");
        let lines = lines.lock().unwrap();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].ends_with("[WARNING] disk is slow"));
    }

    #[test]
    fn concurrent_appends() {
        let log = MessageLog::new();
        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for i in 0..50 {
                        log.verbose(format!("item {i}"));
                    }
                });
            }
        });
        assert_eq!(log.len(), 400);
    }
}
