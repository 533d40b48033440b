//! Connection progress logging
//!
//! Every transport owns a [`ConnectionLogger`]. It remembers the most
//! important message of the current connect attempt (an error beats a warning,
//! a warning beats progress) for status displays, mirrors each message to
//! `tracing`, and publishes it as a [`TransportEvent::Log`].

use crate::error::capitalize;
use crate::events::EventHub;
use crate::types::{ConnectionLogEvent, LogLevel, TransportEvent};
use chrono::Utc;
use std::sync::Mutex;

/// Sink for messages produced while connecting
///
/// Codec hooks receive this rather than the concrete logger so that any
/// caller can collect connect output.
pub trait ConnectionLog: Send + Sync {
    fn add_progress_message(&self, message: &str, tooltip: Option<&str>);
    fn add_error_message(&self, message: &str, tooltip: Option<&str>);
    fn add_warning_message(&self, message: &str, tooltip: Option<&str>);
    fn add_debug_message(&self, message: &str);
}

#[derive(Debug, Clone)]
struct LastLog {
    message: String,
    tooltip: Option<String>,
    level: LogLevel,
}

impl Default for LastLog {
    fn default() -> Self {
        Self {
            message: String::new(),
            tooltip: None,
            level: LogLevel::Info,
        }
    }
}

pub struct ConnectionLogger {
    transport_id: String,
    last: Mutex<LastLog>,
    events: EventHub<TransportEvent>,
}

impl ConnectionLogger {
    pub fn new(transport_id: impl Into<String>, events: EventHub<TransportEvent>) -> Self {
        Self {
            transport_id: transport_id.into(),
            last: Mutex::new(LastLog::default()),
            events,
        }
    }

    pub fn transport_id(&self) -> &str {
        &self.transport_id
    }

    fn update(&self, f: impl FnOnce(&mut LastLog)) {
        if let Ok(mut last) = self.last.lock() {
            f(&mut last);
        }
    }

    fn last(&self) -> LastLog {
        self.last.lock().map(|l| l.clone()).unwrap_or_default()
    }

    fn publish(&self, level: LogLevel, message: &str) {
        if message.is_empty() {
            return;
        }
        self.events.emit(TransportEvent::Log(ConnectionLogEvent {
            level,
            message: capitalize(message),
            transport_id: self.transport_id.clone(),
            timestamp: Utc::now(),
        }));
    }

    /// First line of the most important message
    pub fn progress_message(&self) -> String {
        self.last()
            .message
            .lines()
            .next()
            .unwrap_or_default()
            .to_string()
    }

    /// Explicit tooltip, or the lines after the first
    pub fn tooltip_message(&self) -> Option<String> {
        let last = self.last();
        if let Some(tooltip) = last.tooltip.filter(|t| !t.is_empty()) {
            return Some(tooltip);
        }
        let rest: Vec<&str> = last.message.lines().skip(1).collect();
        if rest.is_empty() {
            None
        } else {
            Some(rest.join("\n"))
        }
    }

    pub fn has_errors(&self) -> bool {
        self.last().level == LogLevel::Error
    }

    pub fn has_warnings(&self) -> bool {
        self.last().level == LogLevel::Warning
    }

    /// Forget the previous attempt
    pub fn clear(&self) {
        self.update(|last| *last = LastLog::default());
    }
}

impl ConnectionLog for ConnectionLogger {
    fn add_progress_message(&self, message: &str, tooltip: Option<&str>) {
        self.update(|last| {
            if last.level == LogLevel::Info {
                last.message = message.to_string();
                last.tooltip = tooltip.map(str::to_string);
            }
        });
        tracing::info!(transport = %self.transport_id, "{}", message);
        self.publish(LogLevel::Info, message);
    }

    fn add_error_message(&self, message: &str, tooltip: Option<&str>) {
        self.update(|last| {
            last.message = format!("Error: {}", message);
            last.tooltip = tooltip.map(str::to_string);
            last.level = LogLevel::Error;
        });
        tracing::error!(transport = %self.transport_id, "{}", message);
        self.publish(LogLevel::Error, message);
    }

    fn add_warning_message(&self, message: &str, tooltip: Option<&str>) {
        self.update(|last| {
            if last.level != LogLevel::Error {
                last.message = format!("Warning: {}", message);
                last.tooltip = tooltip.map(str::to_string);
                last.level = LogLevel::Warning;
            }
        });
        tracing::warn!(transport = %self.transport_id, "{}", message);
        self.publish(LogLevel::Warning, message);
    }

    fn add_debug_message(&self, message: &str) {
        tracing::debug!(transport = %self.transport_id, "{}", message);
        self.publish(LogLevel::Debug, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn logger() -> (ConnectionLogger, crossbeam_channel::Receiver<TransportEvent>) {
        let hub = EventHub::new();
        let rx = hub.subscribe();
        (ConnectionLogger::new("usb", hub), rx)
    }

    #[test]
    fn test_error_wins_over_later_messages() {
        let (log, _rx) = logger();
        log.add_progress_message("opening port", None);
        assert_eq!(log.progress_message(), "opening port");

        log.add_error_message("port busy", None);
        log.add_warning_message("slow device", None);
        log.add_progress_message("still trying", None);

        assert!(log.has_errors());
        assert!(!log.has_warnings());
        assert_eq!(log.progress_message(), "Error: port busy");
    }

    #[test]
    fn test_warning_blocks_progress() {
        let (log, _rx) = logger();
        log.add_warning_message("optional codec missing", None);
        log.add_progress_message("connected", None);
        assert!(log.has_warnings());
        assert_eq!(log.progress_message(), "Warning: optional codec missing");
    }

    #[test]
    fn test_tooltip_from_extra_lines() {
        let (log, _rx) = logger();
        log.add_progress_message("Connected\nCOM3:9600\nfirmware 2.7", None);
        assert_eq!(log.progress_message(), "Connected");
        assert_eq!(log.tooltip_message().as_deref(), Some("COM3:9600\nfirmware 2.7"));

        log.add_progress_message("Connected", Some("hover text"));
        assert_eq!(log.tooltip_message().as_deref(), Some("hover text"));
    }

    #[test]
    fn test_events_are_capitalised() {
        let (log, rx) = logger();
        log.add_debug_message("connecting model id=\"uart\"");
        log.add_debug_message("");

        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(events.len(), 1);
        match &events[0] {
            TransportEvent::Log(event) => {
                assert_eq!(event.message, "Connecting model id=\"uart\"");
                assert_eq!(event.level, LogLevel::Debug);
                assert_eq!(event.transport_id, "usb");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_clear() {
        let (log, _rx) = logger();
        log.add_error_message("boom", None);
        log.clear();
        assert!(!log.has_errors());
        assert_eq!(log.progress_message(), "");
    }
}
