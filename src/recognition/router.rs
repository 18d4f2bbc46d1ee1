use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Serialize;

use crate::config::AppConfig;

use super::acrcloud::AcrCloudBackend;
use super::shazam::ShazamBackend;
use super::{RecognitionBackend, RecognitionError, RecognitionMatch, RetryStats, Source};

/// Counters kept by the router across a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RouterStats {
    pub primary_matches: usize,
    pub fallback_matches: usize,
    /// Segments where the primary backend failed hard (not a clean no-match).
    pub primary_errors: usize,
    pub fallback_calls: usize,
    pub fallback_errors: usize,
}

#[derive(Default)]
struct Counters {
    primary_matches: AtomicUsize,
    fallback_matches: AtomicUsize,
    primary_errors: AtomicUsize,
    fallback_calls: AtomicUsize,
    fallback_errors: AtomicUsize,
}

/// Tries the primary backend, then the fallback on a definitive non-match.
///
/// The two backends are never queried concurrently for the same segment. The
/// router owns both backends and their pooled HTTP clients; dropping it at the
/// end of a run releases every connection.
pub struct BackendRouter {
    primary: Box<dyn RecognitionBackend>,
    fallback: Option<Box<dyn RecognitionBackend>>,
    counters: Counters,
}

impl BackendRouter {
    pub fn new(primary: Box<dyn RecognitionBackend>) -> Self {
        Self {
            primary,
            fallback: None,
            counters: Counters::default(),
        }
    }

    /// Primary backend plus ACRCloud when it is enabled and has credentials.
    ///
    /// An enabled fallback without credentials is a warning, not an error: the
    /// run goes ahead primary-only.
    pub fn from_config(config: &AppConfig) -> Result<Self, reqwest::Error> {
        let proxy = config.proxy.as_deref();
        let primary = ShazamBackend::new(
            &config.primary.endpoint,
            config.primary.retry_policy(),
            config.primary.timeout(),
            proxy,
        )?;
        let router = Self::new(Box::new(primary));

        if !config.fallback.enabled {
            return Ok(router);
        }
        let Some((key, secret)) = config.fallback.credentials() else {
            log::warn!(
                "ACRCloud fallback requested but credentials not provided. Using primary only."
            );
            return Ok(router);
        };

        let fallback = AcrCloudBackend::new(
            &config.fallback.host,
            key,
            secret,
            config.fallback.retry_policy(),
            config.fallback.timeout(),
            proxy,
        )?;
        Ok(router.with_fallback(Box::new(fallback)))
    }

    pub fn with_fallback(mut self, fallback: Box<dyn RecognitionBackend>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn has_fallback(&self) -> bool {
        self.fallback.is_some()
    }

    /// Recognize one segment.
    ///
    /// `Ok(None)` when no backend matched and at least one gave a definitive
    /// answer. `Err` only when every backend that was asked failed.
    pub async fn recognize_segment(
        &self,
        audio: &[u8],
        segment: usize,
    ) -> Result<Option<RecognitionMatch>, RecognitionError> {
        let primary_error = match self.primary.recognize(audio, segment).await {
            Ok(Some(mut hit)) => {
                hit.source = Source::Primary;
                self.counters.primary_matches.fetch_add(1, Ordering::Relaxed);
                return Ok(Some(hit));
            }
            Ok(None) => None,
            Err(e) => {
                self.counters.primary_errors.fetch_add(1, Ordering::Relaxed);
                log::warn!("{} failed on segment {segment}: {e}", self.primary.name());
                Some(e)
            }
        };

        let Some(fallback) = &self.fallback else {
            return match primary_error {
                Some(e) => Err(e),
                None => Ok(None),
            };
        };

        self.counters.fallback_calls.fetch_add(1, Ordering::Relaxed);
        match fallback.recognize(audio, segment).await {
            Ok(Some(mut hit)) => {
                hit.source = Source::Fallback;
                self.counters.fallback_matches.fetch_add(1, Ordering::Relaxed);
                log::debug!("{} matched segment {segment}", fallback.name());
                Ok(Some(hit))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                self.counters.fallback_errors.fetch_add(1, Ordering::Relaxed);
                log::warn!("{} failed on segment {segment}: {e}", fallback.name());
                match primary_error {
                    // Both failed: surface the most recent error
                    Some(_) => Err(e),
                    None => Ok(None),
                }
            }
        }
    }

    pub fn stats(&self) -> RouterStats {
        let c = &self.counters;
        RouterStats {
            primary_matches: c.primary_matches.load(Ordering::Relaxed),
            fallback_matches: c.fallback_matches.load(Ordering::Relaxed),
            primary_errors: c.primary_errors.load(Ordering::Relaxed),
            fallback_calls: c.fallback_calls.load(Ordering::Relaxed),
            fallback_errors: c.fallback_errors.load(Ordering::Relaxed),
        }
    }

    /// Retry stats per backend, primary first.
    pub fn retry_stats(&self) -> Vec<(&'static str, RetryStats)> {
        let mut stats = vec![(self.primary.name(), self.primary.retry_stats())];
        if let Some(fallback) = &self.fallback {
            stats.push((fallback.name(), fallback.retry_stats()));
        }
        stats
    }
}
