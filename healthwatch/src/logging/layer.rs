//! Subscriber layers used by [`init_logging`](super::init_logging).

use chrono::{Local, Utc};
use tokio::sync::broadcast;
use tracing::{Event, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::layer::Context;

use super::LogEvent;

/// Formats timestamps in the host's local timezone.
#[derive(Debug, Clone, Copy)]
pub(super) struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z"))
    }
}

/// Republishes every log event on a broadcast channel.
pub(super) struct BroadcastLayer {
    pub(super) tx: broadcast::Sender<LogEvent>,
}

impl<S> Layer<S> for BroadcastLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        // Nobody listening.
        if self.tx.receiver_count() == 0 {
            return;
        }

        let metadata = event.metadata();
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        let _ = self.tx.send(LogEvent {
            timestamp: Utc::now(),
            level: metadata.level().to_string(),
            target: metadata.target().to_string(),
            message: visitor.finish(),
        });
    }
}

/// Collects the `message` field plus any structured fields of an event.
#[derive(Default)]
pub(super) struct MessageVisitor {
    message: String,
    fields: Vec<String>,
}

impl MessageVisitor {
    pub(super) fn finish(self) -> String {
        match (self.message.is_empty(), self.fields.is_empty()) {
            (_, true) => self.message,
            (true, false) => self.fields.join(" "),
            (false, false) => format!("{} {}", self.message, self.fields.join(" ")),
        }
    }
}

impl tracing::field::Visit for MessageVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else {
            self.fields.push(format!("{}={:?}", field.name(), value));
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.push(format!("{}={}", field.name(), value));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_visitor_joins_fields() {
        let visitor = MessageVisitor {
            message: "System state after stall".to_string(),
            fields: vec!["snapshot={}".to_string()],
        };
        assert_eq!(visitor.finish(), "System state after stall snapshot={}");

        let visitor = MessageVisitor {
            message: String::new(),
            fields: vec!["a=1".to_string(), "b=2".to_string()],
        };
        assert_eq!(visitor.finish(), "a=1 b=2");
    }
}
