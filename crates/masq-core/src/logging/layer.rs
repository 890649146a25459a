//! Tracing layer that mirrors events into a JSONL file.
//!
//! Fields recorded on enclosing spans (the pairing span carries `flow` and
//! `channel`) are copied onto each event, so a single line is enough to tell
//! which session it belongs to. Event fields win over span fields.

use std::path::Path;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Id, Record};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

use super::writer::{InstanceLogWriter, JsonLogEntry};

/// Writes every event as one JSON object per line.
pub struct JsonlLayer {
    writer: Arc<InstanceLogWriter>,
}

impl JsonlLayer {
    /// Layer writing under `logs_dir` for `instance`.
    pub fn new(logs_dir: impl AsRef<Path>, instance: impl Into<String>) -> std::io::Result<Self> {
        Ok(Self {
            writer: Arc::new(InstanceLogWriter::new(logs_dir, instance)?),
        })
    }

    /// File being written
    pub fn log_path(&self) -> &Path {
        self.writer.path()
    }

    /// Instance name
    pub fn instance(&self) -> &str {
        self.writer.instance()
    }
}

/// Fields recorded on a span, kept in its extensions
struct SpanFields(Map<String, Value>);

impl<S> Layer<S> for JsonlLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else { return };
        let mut fields = FieldMap::default();
        attrs.record(&mut fields);
        span.extensions_mut().insert(SpanFields(fields.values));
    }

    fn on_record(&self, id: &Id, values: &Record<'_>, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else { return };
        let mut fields = FieldMap::default();
        values.record(&mut fields);
        let mut ext = span.extensions_mut();
        match ext.get_mut::<SpanFields>() {
            Some(existing) => existing.0.extend(fields.values),
            None => ext.insert(SpanFields(fields.values)),
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let mut own = FieldMap::default();
        event.record(&mut own);

        let mut merged = Map::new();
        let mut path = Vec::new();
        if let Some(scope) = ctx.event_scope(event) {
            for span in scope.from_root() {
                path.push(span.name());
                if let Some(SpanFields(fields)) = span.extensions().get::<SpanFields>() {
                    merged.extend(fields.clone());
                }
            }
        }
        merged.extend(own.values);

        let meta = event.metadata();
        let mut entry = JsonLogEntry::new(
            meta.level().as_str().to_ascii_lowercase(),
            self.writer.instance(),
            meta.target(),
            own.message.unwrap_or_default(),
        );
        if !merged.is_empty() {
            entry = entry.with_fields(Value::Object(merged));
        }
        if !path.is_empty() {
            entry = entry.with_span(path.join(" > "));
        }

        // A failed log write is dropped
        let _ = self.writer.write(&entry);
    }
}

/// Field values of one event or span; `message` is kept apart.
#[derive(Default)]
struct FieldMap {
    message: Option<String>,
    values: Map<String, Value>,
}

impl FieldMap {
    fn set(&mut self, field: &Field, value: Value) {
        match (field.name(), value) {
            ("message", Value::String(text)) => self.message = Some(text),
            (name, value) => {
                self.values.insert(name.to_string(), value);
            }
        }
    }
}

impl Visit for FieldMap {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.set(field, Value::String(format!("{:?}", value)));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.set(field, Value::from(value));
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.set(field, Value::String(value.to_string()));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.set(field, Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.set(field, Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.set(field, Value::from(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        // NaN and infinities have no JSON form; Value::from maps them to null
        self.set(field, Value::from(value));
    }
}
