//! Progress and log reporting.
//!
//! The engine talks to its presentation layer only through [`ProgressSink`]
//! and [`LogSink`]. Calls arrive from whatever task is running the update;
//! moving them onto a UI thread is the implementation's job.

use crate::orchestrator::RunState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;

/// Maximum number of queued events per subscriber
const BROADCAST_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
    Success,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Info => "Info",
            LogLevel::Warning => "Warning",
            LogLevel::Error => "Error",
            LogLevel::Success => "Success",
        };
        f.write_str(name)
    }
}

/// Receives overall progress, 0 to 100, with a status label.
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, percent: u8, label: &str);
}

/// Receives human-readable log lines.
pub trait LogSink: Send + Sync {
    fn on_log(&self, message: &str, level: LogLevel);
}

/// Reporter that writes everything to `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingReporter;

impl ProgressSink for TracingReporter {
    fn on_progress(&self, percent: u8, label: &str) {
        tracing::debug!(target: "program_updater::progress", percent, "{}", label);
    }
}

impl LogSink for TracingReporter {
    fn on_log(&self, message: &str, level: LogLevel) {
        match level {
            LogLevel::Info | LogLevel::Success => tracing::info!("{}", message),
            LogLevel::Warning => tracing::warn!("{}", message),
            LogLevel::Error => tracing::error!("{}", message),
        }
    }
}

/// Events published on the [`EventBus`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum UpdateEvent {
    #[serde(rename = "update:progress")]
    Progress {
        percent: u8,
        label: String,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "update:log")]
    Log {
        level: LogLevel,
        message: String,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "update:state")]
    State {
        state: RunState,
        timestamp: DateTime<Utc>,
    },
}

/// Broadcasts reporter callbacks to any number of subscribers.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<UpdateEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self { tx }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<UpdateEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Events without subscribers are dropped.
    pub fn publish(&self, event: UpdateEvent) {
        let _ = self.tx.send(event);
    }

    pub fn publish_state(&self, state: RunState) {
        self.publish(UpdateEvent::State {
            state,
            timestamp: Utc::now(),
        });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressSink for EventBus {
    fn on_progress(&self, percent: u8, label: &str) {
        self.publish(UpdateEvent::Progress {
            percent,
            label: label.to_string(),
            timestamp: Utc::now(),
        });
    }
}

impl LogSink for EventBus {
    fn on_log(&self, message: &str, level: LogLevel) {
        self.publish(UpdateEvent::Log {
            level,
            message: message.to_string(),
            timestamp: Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_event_bus_fans_out() {
        let bus = EventBus::new();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        bus.on_progress(42, "Downloading app.bin...");
        bus.on_log("Stopping process: app", LogLevel::Info);

        for rx in [&mut first, &mut second] {
            match rx.recv().await.unwrap() {
                UpdateEvent::Progress { percent, label, .. } => {
                    assert_eq!(percent, 42);
                    assert_eq!(label, "Downloading app.bin...");
                }
                other => panic!("unexpected event: {:?}", other),
            }
            assert!(matches!(
                rx.recv().await.unwrap(),
                UpdateEvent::Log { level: LogLevel::Info, .. }
            ));
        }
    }

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        let bus = EventBus::new();
        bus.on_log("nobody listening", LogLevel::Warning);
        bus.publish_state(RunState::Done);
    }

    #[test]
    fn test_event_wire_format() {
        let event = UpdateEvent::Log {
            level: LogLevel::Success,
            message: "done".to_string(),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "update:log");
        assert_eq!(json["payload"]["level"], "success");
        assert_eq!(json["payload"]["message"], "done");
    }

    #[test]
    fn test_log_level_display() {
        assert_eq!(LogLevel::Warning.to_string(), "Warning");
    }
}
