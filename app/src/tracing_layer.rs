// In app/src/tracing_layer.rs

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::Layer;

const ALERT_CACHE_SIZE: usize = 200;

/// A warning or error emitted while the engine was running.
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub target: String,
    pub message: String,
}

pub type AlertCache = Arc<Mutex<VecDeque<Alert>>>;

/// Keeps the most recent WARN and ERROR events so the `run` command can print
/// them with its final report.
pub struct AlertLayer {
    cache: AlertCache,
}

impl AlertLayer {
    pub fn new(cache: AlertCache) -> Self {
        Self { cache }
    }
}

impl<S> Layer<S> for AlertLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
        let level = *event.metadata().level();
        if level > Level::WARN {
            return;
        }

        let mut visitor = AlertVisitor::default();
        event.record(&mut visitor);
        let alert = Alert {
            timestamp: Utc::now(),
            level: level.to_string(),
            target: event.metadata().target().to_string(),
            message: visitor.render(),
        };

        // A poisoned cache only loses alerts; logging itself carries on.
        let Ok(mut cache) = self.cache.lock() else {
            return;
        };
        if cache.len() >= ALERT_CACHE_SIZE {
            cache.pop_front();
        }
        cache.push_back(alert);
    }
}

// Captures the `message` field plus the structured fields of an event.
#[derive(Default)]
struct AlertVisitor {
    message: String,
    fields: Vec<String>,
}

impl AlertVisitor {
    fn render(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else {
            format!("{} ({})", self.message, self.fields.join(", "))
        }
    }
}

impl tracing::field::Visit for AlertVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else {
            self.fields.push(format!("{}={:?}", field.name(), value));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::prelude::*;

    #[test]
    fn keeps_warnings_and_errors_only() {
        let cache: AlertCache = Arc::new(Mutex::new(VecDeque::new()));
        let subscriber = tracing_subscriber::registry().with(AlertLayer::new(cache.clone()));

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("not kept");
            tracing::warn!(deal_id = "D1", "Position dropped");
            tracing::error!("Broker unreachable");
        });

        let alerts = cache.lock().unwrap();
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[0].level, "WARN");
        assert_eq!(alerts[0].message, "Position dropped (deal_id=\"D1\")");
        assert_eq!(alerts[1].message, "Broker unreachable");
    }
}
