use std::sync::{Arc, LazyLock};

use regex::Regex;
use tracing::warn;

use marquee_telemetry::MetricsRecorder;

const MIN_TITLE_LEN: usize = 3;

static QUOTED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""([^"\n]+)"|“([^”\n]+)”|\*\*([^*\n]+)\*\*"#).expect("quoted-title regex")
});

static PROGRESS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)([A-Z0-9][^\n:•\-]*?)\s+at\s+\d{1,3}(?:\.\d+)?%").expect("progress-line regex")
});

/// Title-like spans in generated text: quoted strings and "Title at NN%"
/// progress lines. Overlapping or unbalanced quotes may yield odd spans.
pub fn extract_candidates(text: &str) -> Vec<String> {
    let quoted = QUOTED.captures_iter(text).filter_map(|caps| {
        caps.iter()
            .skip(1)
            .flatten()
            .next()
            .map(|m| m.as_str().trim().to_string())
    });
    let progress = PROGRESS
        .captures_iter(text)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str().trim().to_string()));
    quoted.chain(progress).collect()
}

/// Extracted titles that no known title contains (case-insensitive).
/// With no known titles, every candidate is suspicious.
pub fn validate<S: AsRef<str>>(text: &str, known_titles: &[S]) -> Vec<String> {
    let known: Vec<String> = known_titles.iter().map(|t| t.as_ref().to_lowercase()).collect();
    extract_candidates(text)
        .into_iter()
        .filter(|candidate| candidate.chars().count() >= MIN_TITLE_LEN)
        .filter(|candidate| {
            let needle = candidate.to_lowercase();
            !known.iter().any(|title| title.contains(&needle))
        })
        .collect()
}

/// Log-only hallucination check over generated replies.
#[derive(Default, Clone)]
pub struct ResponseValidator {
    metrics: Option<Arc<MetricsRecorder>>,
}

impl ResponseValidator {
    pub fn new(metrics: Option<Arc<MetricsRecorder>>) -> Self {
        Self { metrics }
    }

    /// Emits at most one warning per call. Never alters `text`.
    pub fn check<S: AsRef<str>>(&self, text: &str, known_titles: &[S]) -> Vec<String> {
        let suspicious = validate(text, known_titles);
        if !suspicious.is_empty() {
            warn!(
                count = suspicious.len(),
                suspicious = ?suspicious,
                known = known_titles.len(),
                "generated reply mentions titles not in catalog data"
            );
            if let Some(metrics) = &self.metrics {
                metrics.counter_inc("validator_suspicious_total", &[], suspicious.len() as u64);
            }
        }
        suspicious
    }
}
