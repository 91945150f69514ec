//! Anti-bot heuristic engine.
//!
//! Classifies a (status, headers, body) triple as bot-blocked or not by
//! summing three independent signal weights, clamped to [0, 1]. The rule
//! tables are static constants so the rule set can be unit-tested without a
//! transport in the loop.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use http::HeaderMap;
use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};

use crate::modules::events::{BotDetectedEvent, EngineEvent, EventDispatcher};

const STATUS_WEIGHT: f32 = 0.4;
const BODY_WEIGHT: f32 = 0.3;
const HEADER_WEIGHT: f32 = 0.2;

/// Status codes commonly returned by protection layers, with the reason
/// reported when the signal fires.
pub static PROTECTION_STATUS_REASONS: &[(u16, &str)] = &[
    (403, "access forbidden, likely bot block"),
    (429, "rate limit exceeded"),
    (503, "service unavailable, possible challenge page"),
    (520, "origin returned an unknown error"),
    (521, "origin refused the connection"),
    (522, "origin connection timed out"),
    (523, "origin is unreachable"),
    (524, "origin response timed out"),
];

/// Body phrases typical of challenge and verification pages.
static BLOCK_PHRASES_RE: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(
        r"(checking your browser|ddos protection by|just a moment|attention required|cf-browser-verification|captcha|verify you are a human|are you a robot|unusual traffic|access denied|request blocked)",
    )
    .case_insensitive(true)
    .dot_matches_new_line(true)
    .build()
    .expect("invalid bot-protection phrase regex")
});

/// Header names set by challenge and rate-limiting infrastructure.
pub static SUSPICIOUS_HEADERS: &[&str] = &[
    "cf-ray",
    "cf-mitigated",
    "cf-chl-bypass",
    "x-ratelimit-limit",
    "x-ratelimit-remaining",
    "retry-after",
    "x-distil-cs",
    "x-datadome",
];

/// Which heuristic checks contributed to a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    ProtectedStatus,
    BlockPhrase,
    SuspiciousHeader,
}

/// Outcome of one detection call. Produced fresh per call, never persisted.
#[derive(Debug, Clone)]
pub struct DetectionResult {
    pub is_bot: bool,
    pub reason: String,
    pub confidence: f32,
    pub status: u16,
    pub signals: Vec<Signal>,
    pub timestamp: DateTime<Utc>,
}

/// Running counters across all detection calls.
#[derive(Debug, Clone, Default)]
pub struct DetectionStats {
    pub total_checks: u64,
    pub bot_detected: u64,
    pub rate_limit_hits: u64,
}

/// Heuristic scorer with running statistics and optional event emission.
#[derive(Default)]
pub struct BotDetector {
    stats: Mutex<DetectionStats>,
    events: Option<Arc<EventDispatcher>>,
}

impl BotDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_events(mut self, events: Arc<EventDispatcher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Score one response. Any non-zero contribution flags the result.
    pub fn analyze(
        &self,
        domain: &str,
        status: u16,
        headers: &HeaderMap,
        body: &str,
    ) -> DetectionResult {
        let mut confidence = 0.0f32;
        let mut signals = Vec::new();
        let mut reasons: Vec<String> = Vec::new();

        if let Some((_, reason)) = PROTECTION_STATUS_REASONS
            .iter()
            .find(|(code, _)| *code == status)
        {
            confidence += STATUS_WEIGHT;
            signals.push(Signal::ProtectedStatus);
            reasons.push((*reason).to_string());
        }

        if BLOCK_PHRASES_RE.is_match(body) {
            confidence += BODY_WEIGHT;
            signals.push(Signal::BlockPhrase);
            reasons.push("bot-protection phrase in response body".to_string());
        }

        if let Some(name) = SUSPICIOUS_HEADERS
            .iter()
            .find(|name| headers.contains_key(**name))
        {
            confidence += HEADER_WEIGHT;
            signals.push(Signal::SuspiciousHeader);
            reasons.push(format!("suspicious response header `{name}`"));
        }

        let confidence = confidence.clamp(0.0, 1.0);
        let is_bot = !signals.is_empty();
        let result = DetectionResult {
            is_bot,
            reason: if reasons.is_empty() {
                "no block signals".to_string()
            } else {
                reasons.join("; ")
            },
            confidence,
            status,
            signals,
            timestamp: Utc::now(),
        };

        {
            let mut stats = self.stats.lock().expect("detection stats lock poisoned");
            stats.total_checks += 1;
            if result.is_bot {
                stats.bot_detected += 1;
            }
            if status == 429 {
                stats.rate_limit_hits += 1;
            }
        }

        if result.is_bot && let Some(ref events) = self.events {
            events.dispatch(EngineEvent::BotDetected(BotDetectedEvent {
                domain: domain.to_string(),
                reason: result.reason.clone(),
                confidence: result.confidence,
                status,
                timestamp: result.timestamp,
            }));
        }

        result
    }

    pub fn stats(&self) -> DetectionStats {
        self.stats
            .lock()
            .expect("detection stats lock poisoned")
            .clone()
    }
}

/// Static mitigation mapping keyed by which signals fired. Pure; no state.
pub fn recommend(result: &DetectionResult) -> Vec<&'static str> {
    let mut steps: Vec<&'static str> = Vec::new();
    let mut push = |step: &'static str| {
        if !steps.contains(&step) {
            steps.push(step);
        }
    };

    for signal in &result.signals {
        match signal {
            Signal::ProtectedStatus if result.status == 429 => {
                push("increase request spacing");
                push("rotate proxy");
            }
            Signal::ProtectedStatus => {
                push("rotate proxy");
                push("rotate user-agent string");
            }
            Signal::BlockPhrase => {
                push("rotate proxy");
                push("change identifying headers");
                push("rotate user-agent string");
            }
            Signal::SuspiciousHeader => {
                push("increase request spacing");
                push("change identifying headers");
            }
        }
    }

    steps
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn clean_response_scores_zero() {
        let detector = BotDetector::new();
        let result = detector.analyze("example.com", 200, &HeaderMap::new(), "<html>ok</html>");
        assert!(!result.is_bot);
        assert_eq!(result.confidence, 0.0);
        assert!(result.signals.is_empty());
    }

    #[test]
    fn status_429_alone_scores_single_signal() {
        let detector = BotDetector::new();
        let result = detector.analyze("example.com", 429, &HeaderMap::new(), "slow down");
        assert!(result.is_bot);
        assert!(result.reason.contains("rate limit"));
        assert!(result.confidence >= 0.4);
        assert!(result.confidence < 1.0);
        assert_eq!(result.signals, vec![Signal::ProtectedStatus]);

        let stats = detector.stats();
        assert_eq!(stats.total_checks, 1);
        assert_eq!(stats.bot_detected, 1);
        assert_eq!(stats.rate_limit_hits, 1);
    }

    #[test]
    fn all_signals_sum_and_clamp() {
        let detector = BotDetector::new();
        let mut headers = HeaderMap::new();
        headers.insert("cf-ray", HeaderValue::from_static("8a1b2c3d4e5f-ABC"));
        let result = detector.analyze(
            "example.com",
            403,
            &headers,
            "<html>Checking your browser before accessing</html>",
        );
        assert!(result.is_bot);
        assert!((result.confidence - 0.9).abs() < 1e-6);
        assert_eq!(result.signals.len(), 3);
    }

    #[test]
    fn body_phrase_is_case_insensitive() {
        let detector = BotDetector::new();
        let result = detector.analyze("example.com", 200, &HeaderMap::new(), "PLEASE SOLVE THE CAPTCHA");
        assert!(result.is_bot);
        assert!((result.confidence - 0.3).abs() < 1e-6);
    }

    #[test]
    fn recommendations_follow_fired_signals() {
        let detector = BotDetector::new();
        let rate_limited = detector.analyze("example.com", 429, &HeaderMap::new(), "");
        assert_eq!(
            recommend(&rate_limited),
            vec!["increase request spacing", "rotate proxy"]
        );

        let phrase_only = detector.analyze(
            "example.com",
            200,
            &HeaderMap::new(),
            "DDoS protection by some vendor",
        );
        let steps = recommend(&phrase_only);
        assert!(steps.contains(&"change identifying headers"));
        assert!(steps.contains(&"rotate user-agent string"));

        let clean = detector.analyze("example.com", 200, &HeaderMap::new(), "ok");
        assert!(recommend(&clean).is_empty());
    }
}
