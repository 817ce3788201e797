//! Numeric fact extraction from message text
//!
//! Pure pattern matching: a number, optional whitespace, and an optional unit
//! (percent, currency, distance, weight or a magnitude word).

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Medium,
    Low,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumericFact {
    pub span: String,
    pub value: Option<f64>,
    pub unit: String,
    pub confidence: Confidence,
}

fn number_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?i)(?P<number>\b\d+(?:[.,]\d{3})*(?:[.,]\d+)?\b)\s*(?P<unit>%|percent\b|rs\b|inr\b|₹|km\b|m\b|kg\b|k\b|lakh\b|crore\b|million\b|billion\b)?",
        )
        .expect("number pattern is a valid regex")
    })
}

/// Extract every number (with its unit, if any) from `text`
pub fn extract_numeric_facts(text: &str) -> Vec<NumericFact> {
    number_pattern()
        .captures_iter(text)
        .filter_map(|caps| {
            let span = caps.get(0)?.as_str().trim_end();
            let number = caps.name("number")?.as_str();
            let value = number.replace(',', "").parse::<f64>().ok();
            let unit = caps
                .name("unit")
                .map(|u| u.as_str().to_lowercase())
                .unwrap_or_default();

            Some(NumericFact {
                span: span.to_string(),
                value,
                unit,
                confidence: if value.is_some() {
                    Confidence::Medium
                } else {
                    Confidence::Low
                },
            })
        })
        .collect()
}
