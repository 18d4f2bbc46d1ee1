//! Primary backend: a Shazam-compatible recognition endpoint.
//!
//! The endpoint takes the raw segment bytes as the request body and answers
//! with Shazam's discovery JSON (`matches` + `track`). Signature generation
//! happens on the service side, so this adapter is plain HTTP.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;

use super::retry::{RetryLedger, RetryPolicy, RetryStats, run_with_retry};
use super::{RecognitionBackend, RecognitionError, RecognitionMatch, Source, normalize_score};

const USER_AGENT: &str = concat!("setid/", env!("CARGO_PKG_VERSION"));

/// Default local endpoint (a shazamio sidecar or similar).
pub const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:8765/recognize";

#[derive(Debug, Deserialize)]
struct DiscoveryResponse {
    #[serde(default)]
    matches: Vec<DiscoveryMatch>,
    track: Option<DiscoveryTrack>,
}

#[derive(Debug, Deserialize)]
struct DiscoveryMatch {
    /// Not every deployment reports a score; absent means a full-confidence hit.
    score: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct DiscoveryTrack {
    key: String,
    #[serde(default)]
    title: String,
    /// Shazam puts the artist in `subtitle`.
    #[serde(default)]
    subtitle: String,
    #[serde(flatten)]
    extra: serde_json::Map<String, serde_json::Value>,
}

pub struct ShazamBackend {
    client: reqwest::Client,
    endpoint: String,
    policy: RetryPolicy,
    ledger: RetryLedger,
}

impl ShazamBackend {
    pub fn new(
        endpoint: &str,
        policy: RetryPolicy,
        timeout: Duration,
        proxy: Option<&str>,
    ) -> Result<Self, reqwest::Error> {
        let mut builder = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout);
        if let Some(url) = proxy {
            builder = builder.proxy(reqwest::Proxy::all(url)?);
        }

        Ok(Self {
            client: builder.build()?,
            endpoint: endpoint.to_string(),
            policy,
            ledger: RetryLedger::new(),
        })
    }

    async fn attempt(&self, audio: &[u8]) -> Result<Option<RecognitionMatch>, RecognitionError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header(CONTENT_TYPE, "audio/wav")
            .body(audio.to_vec())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(RecognitionError::from_status(status));
        }

        let body = response.bytes().await?;
        parse_response(&body)
    }
}

#[async_trait]
impl RecognitionBackend for ShazamBackend {
    fn name(&self) -> &'static str {
        "shazam"
    }

    async fn recognize(
        &self,
        audio: &[u8],
        segment: usize,
    ) -> Result<Option<RecognitionMatch>, RecognitionError> {
        run_with_retry(&self.policy, &self.ledger, self.name(), segment, |_| {
            self.attempt(audio)
        })
        .await
    }

    fn retry_stats(&self) -> RetryStats {
        self.ledger.stats()
    }
}

/// Map a discovery response body onto the canonical match shape.
fn parse_response(body: &[u8]) -> Result<Option<RecognitionMatch>, RecognitionError> {
    let response: DiscoveryResponse = serde_json::from_slice(body)
        .map_err(|e| RecognitionError::Malformed(e.to_string()))?;

    let Some(first) = response.matches.first() else {
        return Ok(None);
    };
    let track = response.track.ok_or_else(|| {
        RecognitionError::Malformed("response has matches but no track".to_string())
    })?;
    if track.key.is_empty() {
        return Err(RecognitionError::Malformed("track without key".to_string()));
    }

    Ok(Some(RecognitionMatch {
        track_key: track.key,
        title: track.title,
        artist: track.subtitle,
        confidence: normalize_score(first.score.unwrap_or(100.0)),
        source: Source::Primary,
        metadata: serde_json::Value::Object(track.extra),
    }))
}
