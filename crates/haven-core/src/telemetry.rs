use std::fmt;
use std::sync::Arc;

use tracing::{
    Level, Subscriber,
    field::{Field, Visit},
};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

use crate::models::notifications::{Notification, NotificationSink};

/// Visitor that pulls the `message` field out of a tracing event.
struct MessageVisitor {
    message: Option<String>,
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = Some(format!("{:?}", value));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        }
    }
}

/// Mirrors WARN and ERROR events into the notification sink so UI surfaces
/// can show failures without scraping log output.
pub struct NotificationLayer {
    sink: Arc<dyn NotificationSink>,
}

impl NotificationLayer {
    pub fn new(sink: Arc<dyn NotificationSink>) -> Self {
        Self { sink }
    }
}

impl<S> Layer<S> for NotificationLayer
where
    S: Subscriber,
{
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        let level = *event.metadata().level();
        if !matches!(level, Level::WARN | Level::ERROR) {
            return;
        }

        let mut visitor = MessageVisitor { message: None };
        event.record(&mut visitor);
        let message = visitor.message.unwrap_or_default();

        let notification = if level == Level::ERROR {
            Notification::error(message)
        } else {
            Notification::warning(message)
        };
        self.sink.notify(notification);
    }
}

/// Initialize structured logging with env-filter control and the
/// notification mirror. Call once at startup.
pub fn init(sink: Arc<dyn NotificationSink>) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(Level::INFO.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(NotificationLayer::new(sink))
        .init();
}
