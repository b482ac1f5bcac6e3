//! Request and response bodies of the sentiment API

use serde::{Deserialize, Serialize};
use std::fmt;

/// Longest text the backend accepts for analysis, in characters.
pub const MAX_TEXT_CHARS: usize = 10_000;

/// Body of `POST /auth/login`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

/// Successful login.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
}

/// Body of a non-2xx API response.
///
/// `detail` is usually a message, but validation failures carry a list of
/// field errors instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub detail: serde_json::Value,
}

impl ErrorBody {
    /// Human-readable form of `detail`.
    pub fn message(&self) -> String {
        match &self.detail {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Array(items) => items
                .iter()
                .map(|item| {
                    item.get("msg")
                        .and_then(|m| m.as_str())
                        .map(str::to_string)
                        .unwrap_or_else(|| item.to_string())
                })
                .collect::<Vec<_>>()
                .join("; "),
            other => other.to_string(),
        }
    }
}

/// Body of `POST /analyze`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalyzeRequest {
    pub text: String,
}

/// Predicted sentiment label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sentiment {
    Positive,
    Negative,
    Neutral,
}

impl fmt::Display for Sentiment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Sentiment::Positive => "positive",
            Sentiment::Negative => "negative",
            Sentiment::Neutral => "neutral",
        };
        f.write_str(label)
    }
}

/// Per-class probabilities. Deployed backends report either fractions
/// (0..1) or percentages (0..100).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Probabilities {
    pub positive: f64,
    pub negative: f64,
    pub neutral: f64,
}

impl Probabilities {
    /// Whether every value lies within 0..=1.
    pub fn is_fractional(&self) -> bool {
        [self.positive, self.negative, self.neutral]
            .iter()
            .all(|p| (0.0..=1.0).contains(p))
    }

    /// Values on the 0..100 scale regardless of how the backend sent them.
    pub fn as_percentages(&self) -> Probabilities {
        if self.is_fractional() {
            Probabilities {
                positive: self.positive * 100.0,
                negative: self.negative * 100.0,
                neutral: self.neutral * 100.0,
            }
        } else {
            *self
        }
    }

    /// Label with the highest probability. Ties favour neutral, then positive.
    pub fn dominant(&self) -> Sentiment {
        let mut best = (Sentiment::Neutral, self.neutral);
        for candidate in [
            (Sentiment::Positive, self.positive),
            (Sentiment::Negative, self.negative),
        ] {
            if candidate.1 > best.1 {
                best = candidate;
            }
        }
        best.0
    }
}

/// Successful analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyzeResponse {
    pub sentiment: Sentiment,
    pub probabilities: Probabilities,
    pub cleaned_text: String,
    #[serde(default)]
    pub model_version: Option<String>,
}
