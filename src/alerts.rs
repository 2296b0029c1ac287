//! Alert emission hook.
//!
//! Sinks are fire-and-forget: emitting never fails the caller and never
//! blocks the path that raised the alert. Rendering and delivery belong to
//! whoever consumes the sink.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertKind {
    ClockWarning,
    ClockBreached,
    CriticalEvent,
    IntegrityDegraded,
    WitnessDegraded,
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AlertKind::ClockWarning => "CLOCK_WARNING",
            AlertKind::ClockBreached => "CLOCK_BREACHED",
            AlertKind::CriticalEvent => "CRITICAL_EVENT",
            AlertKind::IntegrityDegraded => "INTEGRITY_DEGRADED",
            AlertKind::WitnessDegraded => "WITNESS_DEGRADED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub level: AlertLevel,
    pub kind: AlertKind,
    /// Id of the clock, event, stream or anchor the alert is about.
    pub subject: String,
    pub message: String,
    pub raised_at: DateTime<Utc>,
}

impl Alert {
    pub fn new(
        level: AlertLevel,
        kind: AlertKind,
        subject: impl Into<String>,
        message: impl Into<String>,
        raised_at: DateTime<Utc>,
    ) -> Self {
        Self {
            level,
            kind,
            subject: subject.into(),
            message: message.into(),
            raised_at,
        }
    }
}

pub trait AlertSink: Send + Sync {
    fn emit(&self, alert: Alert);
}

/// Writes alerts to the tracing subscriber.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn emit(&self, alert: Alert) {
        match alert.level {
            AlertLevel::Info => info!(kind = %alert.kind, subject = %alert.subject, "{}", alert.message),
            AlertLevel::Warning => warn!(kind = %alert.kind, subject = %alert.subject, "{}", alert.message),
            AlertLevel::Critical => error!(kind = %alert.kind, subject = %alert.subject, "{}", alert.message),
        }
    }
}

/// Forwards alerts to an async consumer. A closed receiver drops alerts.
#[derive(Debug, Clone)]
pub struct ChannelAlertSink {
    tx: mpsc::UnboundedSender<Alert>,
}

impl ChannelAlertSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Alert>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl AlertSink for ChannelAlertSink {
    fn emit(&self, alert: Alert) {
        if self.tx.send(alert).is_err() {
            warn!("alert receiver closed, dropping alert");
        }
    }
}

#[derive(Default, Clone)]
pub struct FanoutAlertSink {
    sinks: Vec<Arc<dyn AlertSink>>,
}

impl FanoutAlertSink {
    pub fn new(sinks: Vec<Arc<dyn AlertSink>>) -> Self {
        Self { sinks }
    }

    pub fn push(&mut self, sink: Arc<dyn AlertSink>) {
        self.sinks.push(sink);
    }
}

impl AlertSink for FanoutAlertSink {
    fn emit(&self, alert: Alert) {
        for sink in &self.sinks {
            sink.emit(alert.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fanout_reaches_every_sink() {
        let (first, mut first_rx) = ChannelAlertSink::new();
        let (second, mut second_rx) = ChannelAlertSink::new();
        let fanout = FanoutAlertSink::new(vec![
            Arc::new(first),
            Arc::new(second),
            Arc::new(TracingAlertSink),
        ]);

        fanout.emit(Alert::new(
            AlertLevel::Critical,
            AlertKind::ClockBreached,
            "clk-1",
            "deadline passed",
            Utc::now(),
        ));

        assert_eq!(first_rx.recv().await.unwrap().subject, "clk-1");
        assert_eq!(second_rx.recv().await.unwrap().kind, AlertKind::ClockBreached);
    }

    #[test]
    fn test_closed_channel_does_not_panic() {
        let (sink, rx) = ChannelAlertSink::new();
        drop(rx);
        sink.emit(Alert::new(
            AlertLevel::Info,
            AlertKind::CriticalEvent,
            "evt",
            "ignored",
            Utc::now(),
        ));
    }
}
