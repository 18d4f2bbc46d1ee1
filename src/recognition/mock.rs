//! Scriptable in-memory backend for tests.

use std::collections::{HashMap, HashSet};
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::{RecognitionBackend, RecognitionError, RecognitionMatch, Source};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Start(usize),
    End(usize),
}

/// Shared view into what a mock saw, usable after the mock moved into a router.
#[derive(Debug, Default)]
pub struct CallLog {
    pub calls: AtomicUsize,
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    pub events: Mutex<Vec<Event>>,
}

pub struct MockBackend {
    name: &'static str,
    hits: HashMap<usize, (String, f64)>,
    failing: HashSet<usize>,
    delay: fn(usize) -> Duration,
    call_log: Arc<CallLog>,
    calls: Arc<AtomicUsize>,
}

impl MockBackend {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            hits: HashMap::new(),
            failing: HashSet::new(),
            delay: |_| Duration::ZERO,
            call_log: Arc::new(CallLog::default()),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Match `key` on every segment in `segments`.
    pub fn hit(mut self, segments: RangeInclusive<usize>, key: &str, confidence: f64) -> Self {
        for s in segments {
            self.hits.insert(s, (key.to_string(), confidence));
        }
        self
    }

    /// Fail (retries exhausted) on every segment in `segments`.
    pub fn fail(mut self, segments: RangeInclusive<usize>) -> Self {
        self.failing.extend(segments);
        self
    }

    /// Per-segment latency, to control completion order inside a batch.
    pub fn with_delay(mut self, delay: fn(usize) -> Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn call_log(&self) -> Arc<CallLog> {
        Arc::clone(&self.call_log)
    }

    pub fn call_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

#[async_trait]
impl RecognitionBackend for MockBackend {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn recognize(
        &self,
        _audio: &[u8],
        segment: usize,
    ) -> Result<Option<RecognitionMatch>, RecognitionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.call_log.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.call_log.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.call_log.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.call_log.events.lock().unwrap().push(Event::Start(segment));

        let delay = (self.delay)(segment);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.call_log.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.call_log.events.lock().unwrap().push(Event::End(segment));

        if self.failing.contains(&segment) {
            return Err(RecognitionError::RetriesExhausted {
                attempts: 3,
                last: Box::new(RecognitionError::Timeout),
            });
        }

        Ok(self.hits.get(&segment).map(|(key, confidence)| RecognitionMatch {
            track_key: key.clone(),
            title: format!("Title {key}"),
            artist: format!("Artist {key}"),
            confidence: *confidence,
            source: Source::Primary,
            metadata: serde_json::Value::Null,
        }))
    }
}
