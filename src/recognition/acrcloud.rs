//! Fallback backend: the ACRCloud identify API.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use reqwest::multipart::{Form, Part};
use ring::hmac;
use serde::Deserialize;
use serde_json::json;

use super::retry::{RetryLedger, RetryPolicy, RetryStats, run_with_retry};
use super::{RecognitionBackend, RecognitionError, RecognitionMatch, Source, normalize_score};

pub const DEFAULT_HOST: &str = "identify-us-west-2.acrcloud.com";

const ENDPOINT_PATH: &str = "/v1/identify";
const DATA_TYPE: &str = "audio";
const SIGNATURE_VERSION: &str = "1";

/// Service status codes we act on.
const STATUS_OK: i64 = 0;
const STATUS_NO_RESULT: i64 = 1001;
const STATUS_INVALID_ACCESS_KEY: i64 = 3001;
const STATUS_INVALID_SIGNATURE: i64 = 3014;

#[derive(Debug, Deserialize)]
struct IdentifyResponse {
    status: IdentifyStatus,
    metadata: Option<IdentifyMetadata>,
}

#[derive(Debug, Deserialize)]
struct IdentifyStatus {
    code: i64,
    #[serde(default)]
    msg: String,
}

#[derive(Debug, Deserialize)]
struct IdentifyMetadata {
    #[serde(default)]
    music: Vec<MusicEntry>,
}

#[derive(Debug, Deserialize)]
struct MusicEntry {
    #[serde(default)]
    title: String,
    #[serde(default)]
    artists: Vec<Named>,
    album: Option<Named>,
    #[serde(default)]
    genres: Vec<Named>,
    release_date: Option<String>,
    acrid: Option<String>,
    score: Option<f64>,
    #[serde(default)]
    external_ids: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    external_metadata: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct Named {
    #[serde(default)]
    name: String,
}

pub struct AcrCloudBackend {
    /// Goes through the configured proxy, if any.
    client: reqwest::Client,
    /// Used for the last attempt when a proxy is configured.
    direct: Option<reqwest::Client>,
    endpoint: String,
    access_key: String,
    signing_key: hmac::Key,
    policy: RetryPolicy,
    ledger: RetryLedger,
}

impl AcrCloudBackend {
    pub fn new(
        host: &str,
        access_key: &str,
        access_secret: &str,
        policy: RetryPolicy,
        timeout: Duration,
        proxy: Option<&str>,
    ) -> Result<Self, reqwest::Error> {
        let base = || {
            reqwest::Client::builder()
                .timeout(timeout)
                .connect_timeout(timeout.min(Duration::from_secs(30)))
        };

        let (client, direct) = match proxy {
            Some(url) => (
                base().proxy(reqwest::Proxy::all(url)?).build()?,
                Some(base().no_proxy().build()?),
            ),
            None => (base().build()?, None),
        };

        Ok(Self {
            client,
            direct,
            endpoint: format!("https://{host}{ENDPOINT_PATH}"),
            access_key: access_key.to_string(),
            signing_key: hmac::Key::new(
                hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY,
                access_secret.as_bytes(),
            ),
            policy,
            ledger: RetryLedger::new(),
        })
    }

    fn client_for(&self, attempt: u32) -> &reqwest::Client {
        match &self.direct {
            Some(direct) if attempt >= self.policy.max_attempts => {
                log::debug!("acrcloud: final attempt bypasses the proxy");
                direct
            }
            _ => &self.client,
        }
    }

    async fn attempt(
        &self,
        audio: &[u8],
        attempt: u32,
    ) -> Result<Option<RecognitionMatch>, RecognitionError> {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
            .to_string();
        let signature = sign(&self.signing_key, &self.access_key, &timestamp);

        let sample = Part::bytes(audio.to_vec())
            .file_name("sample.wav")
            .mime_str("audio/wav")?;
        let form = Form::new()
            .text("access_key", self.access_key.clone())
            .text("sample_bytes", audio.len().to_string())
            .text("timestamp", timestamp)
            .text("signature", signature)
            .text("data_type", DATA_TYPE)
            .text("signature_version", SIGNATURE_VERSION)
            .part("sample", sample);

        let response = self
            .client_for(attempt)
            .post(&self.endpoint)
            .multipart(form)
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
impl RecognitionBackend for AcrCloudBackend {
    fn name(&self) -> &'static str {
        "acrcloud"
    }

    async fn recognize(
        &self,
        audio: &[u8],
        segment: usize,
    ) -> Result<Option<RecognitionMatch>, RecognitionError> {
        run_with_retry(&self.policy, &self.ledger, self.name(), segment, |attempt| {
            self.attempt(audio, attempt)
        })
        .await
    }

    fn retry_stats(&self) -> RetryStats {
        self.ledger.stats()
    }
}

/// Base64 HMAC-SHA1 over the newline-joined request description.
fn sign(key: &hmac::Key, access_key: &str, timestamp: &str) -> String {
    let string_to_sign = [
        "POST",
        ENDPOINT_PATH,
        access_key,
        DATA_TYPE,
        SIGNATURE_VERSION,
        timestamp,
    ]
    .join("\n");
    let tag = hmac::sign(key, string_to_sign.as_bytes());
    general_purpose::STANDARD.encode(tag.as_ref())
}

fn parse_response(body: &[u8]) -> Result<Option<RecognitionMatch>, RecognitionError> {
    let response: IdentifyResponse = serde_json::from_slice(body)
        .map_err(|e| RecognitionError::Malformed(e.to_string()))?;

    match response.status.code {
        STATUS_OK => {}
        STATUS_NO_RESULT => return Ok(None),
        STATUS_INVALID_ACCESS_KEY | STATUS_INVALID_SIGNATURE => {
            return Err(RecognitionError::Authentication(response.status.msg));
        }
        code => {
            log::info!("acrcloud status {code}: {}", response.status.msg);
            return Ok(None);
        }
    }

    let Some(music) = response.metadata.and_then(|m| m.music.into_iter().next()) else {
        return Ok(None);
    };

    let isrc = music
        .external_ids
        .get("isrc")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    let track_key = isrc
        .or_else(|| music.acrid.clone().filter(|s| !s.is_empty()))
        .ok_or_else(|| {
            RecognitionError::Malformed("music entry without isrc or acrid".to_string())
        })?;

    let artist = music
        .artists
        .first()
        .map(|a| a.name.clone())
        .unwrap_or_default();
    let metadata = json!({
        "album": music.album.as_ref().map(|a| a.name.as_str()),
        "artists": music.artists.iter().map(|a| a.name.as_str()).collect::<Vec<_>>(),
        "genres": music.genres.iter().map(|g| g.name.as_str()).collect::<Vec<_>>(),
        "release_date": music.release_date,
        "acrid": music.acrid,
        "external_ids": music.external_ids,
        "external_metadata": music.external_metadata,
    });

    Ok(Some(RecognitionMatch {
        track_key,
        title: music.title,
        artist,
        confidence: normalize_score(music.score.unwrap_or(100.0)),
        source: Source::Fallback,
        metadata,
    }))
}
