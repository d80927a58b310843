//! User-facing log stream and process-wide tracing setup.

use crossbeam_channel::{Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogKind {
    Info,
    Warning,
    Error,
    Success,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEvent {
    pub kind: LogKind,
    pub message: String,
}

impl LogEvent {
    pub fn new(kind: LogKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Receiver of user-facing log events. Implementations must not block.
pub trait LogSink: Send + Sync {
    fn emit(&self, event: LogEvent);
}

/// Sink that discards everything.
pub struct NullSink;

impl LogSink for NullSink {
    fn emit(&self, _event: LogEvent) {}
}

/// Bounded channel sink; events are dropped when the consumer falls behind.
#[derive(Clone)]
pub struct ChannelSink {
    tx: Sender<LogEvent>,
}

impl LogSink for ChannelSink {
    fn emit(&self, event: LogEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                tracing::warn!(message = %event.message, "log stream full, event dropped");
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

pub fn log_channel(capacity: usize) -> (ChannelSink, Receiver<LogEvent>) {
    let (tx, rx) = crossbeam_channel::bounded(capacity);
    (ChannelSink { tx }, rx)
}

/// Emits to the sink and mirrors the event into tracing.
pub(crate) fn report(sink: &dyn LogSink, kind: LogKind, message: impl Into<String>) {
    let message = message.into();
    match kind {
        LogKind::Info | LogKind::Success => tracing::info!(kind = ?kind, "{message}"),
        LogKind::Warning => tracing::warn!("{message}"),
        LogKind::Error => tracing::error!("{message}"),
    }
    sink.emit(LogEvent { kind, message });
}

/// Installs the global subscriber, writing to stderr. `RUST_LOG` wins over
/// `default_level`; repeated calls are ignored.
pub fn init_tracing(default_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .ok();
}
