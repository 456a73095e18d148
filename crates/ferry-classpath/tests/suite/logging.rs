use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::field::{Field, Visit};
use tracing::{Event, Level};
use tracing_subscriber::layer::Context;
use tracing_subscriber::prelude::*;
use tracing_subscriber::Layer;

use super::support::{write_tree, Harness};

#[derive(Debug, Clone)]
struct CapturedEvent {
    level: Level,
    target: String,
    fields: HashMap<String, String>,
}

#[derive(Clone, Default)]
struct CapturingLayer {
    events: Arc<Mutex<Vec<CapturedEvent>>>,
}

impl<S> Layer<S> for CapturingLayer
where
    S: tracing::Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);
        self.events
            .lock()
            .expect("events mutex poisoned")
            .push(CapturedEvent {
                level: *event.metadata().level(),
                target: event.metadata().target().to_string(),
                fields: visitor.fields,
            });
    }
}

#[derive(Default)]
struct FieldVisitor {
    fields: HashMap<String, String>,
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.fields
            .insert(field.name().to_string(), format!("{value:?}"));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.fields
            .insert(field.name().to_string(), value.to_string());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.fields
            .insert(field.name().to_string(), value.to_string());
    }
}

#[test]
fn dropped_entries_and_completed_exports_are_logged() {
    let layer = CapturingLayer::default();
    let events = layer.events.clone();
    let subscriber = tracing_subscriber::registry().with(layer);
    let _guard = tracing::subscriber::set_default(subscriber);

    let harness = Harness::new();
    let notes = harness.path("notes.txt");
    std::fs::write(&notes, b"plain text").unwrap();
    let classes = harness.path("classes");
    write_tree(&classes, &[("A.class", b"a")]);

    let factory = harness
        .exporter
        .export(&[notes.into(), classes.into()])
        .unwrap();

    let events = events.lock().unwrap().clone();
    let dropped = events
        .iter()
        .find(|event| {
            event.level == Level::WARN
                && event.fields.get("message").map(String::as_str)
                    == Some("dropping classpath entry that is not an archive")
        })
        .expect("warning for non-archive entry");
    assert_eq!(dropped.target, "ferry.classpath");
    assert!(dropped.fields["path"].ends_with("notes.txt"));

    let exported = events
        .iter()
        .find(|event| {
            event.level == Level::INFO
                && event.fields.get("message").map(String::as_str) == Some("exported classpath")
        })
        .expect("export completion event");
    assert_eq!(
        exported.fields["classpath_id"],
        factory.classpath_id.to_string()
    );
    assert_eq!(exported.fields["elements"], "1");
}
