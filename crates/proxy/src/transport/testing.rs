//! Test doubles for transport wrappers

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::{header, Request, Response, StatusCode};
use parking_lot::Mutex;
use portico_common::MetricsSink;
use tracing::field::{Field, Visit};
use tracing::subscriber::DefaultGuard;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::Layer;

use super::{full_body, ResponseBody, Transport, TransportError};

/// Transport answering every request with the same canned response
pub struct CannedTransport {
    pub status: StatusCode,
    pub content_type: Option<&'static str>,
    pub body: &'static str,
    pub fail: bool,
    pub calls: AtomicUsize,
}

impl CannedTransport {
    pub fn ok(content_type: &'static str, body: &'static str) -> Self {
        Self {
            status: StatusCode::OK,
            content_type: Some(content_type),
            body,
            fail: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for CannedTransport {
    async fn round_trip(
        &self,
        _request: Request<Bytes>,
    ) -> Result<Response<ResponseBody>, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(TransportError::Body("connection reset".into()));
        }

        let mut builder = Response::builder().status(self.status);
        if let Some(content_type) = self.content_type {
            builder = builder.header(header::CONTENT_TYPE, content_type);
        }
        Ok(builder.body(full_body(self.body)).unwrap())
    }
}

/// A single recorded metric event
#[derive(Debug, Clone, PartialEq)]
pub enum Recorded {
    Counter(String, Vec<(String, String)>),
    Histogram(String, Vec<(String, String)>),
}

/// Sink that remembers every call
#[derive(Default)]
pub struct RecordingSink {
    pub events: Mutex<Vec<Recorded>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<Recorded> {
        self.events.lock().clone()
    }

    pub fn count(&self, name: &str) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, Recorded::Counter(n, _) | Recorded::Histogram(n, _) if n == name))
            .count()
    }
}

fn owned(labels: &[(&str, &str)]) -> Vec<(String, String)> {
    labels
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

impl MetricsSink for RecordingSink {
    fn inc_counter(&self, name: &str, labels: &[(&str, &str)]) {
        self.events
            .lock()
            .push(Recorded::Counter(name.to_string(), owned(labels)));
    }

    fn observe_histogram(&self, name: &str, labels: &[(&str, &str)], _value: f64) {
        self.events
            .lock()
            .push(Recorded::Histogram(name.to_string(), owned(labels)));
    }
}

pub fn get(uri: &str) -> Request<Bytes> {
    Request::builder().uri(uri).body(Bytes::new()).unwrap()
}

/// Layer keeping the level and message of every event
#[derive(Clone, Default)]
pub struct CapturedLogs(Arc<Mutex<Vec<(Level, String)>>>);

impl CapturedLogs {
    /// Install for the current thread until the guard drops
    pub fn set_default(&self) -> DefaultGuard {
        tracing::subscriber::set_default(tracing_subscriber::registry().with(self.clone()))
    }

    pub fn contains(&self, level: Level, message: &str) -> bool {
        self.0
            .lock()
            .iter()
            .any(|(l, m)| *l == level && m == message)
    }
}

struct MessageVisitor(String);

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.0 = format!("{value:?}");
        }
    }
}

impl<S: Subscriber> Layer<S> for CapturedLogs {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor(String::new());
        event.record(&mut visitor);
        self.0.lock().push((*event.metadata().level(), visitor.0));
    }
}
