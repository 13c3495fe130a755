//! Fail-closed parsing of model output

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

const MAX_KEY_DETAILS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sentiment {
    Positive,
    Neutral,
    Negative,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    Low,
    Medium,
    High,
}

/// Structured lead analysis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeadAnalysis {
    pub intent: String,
    #[serde(default)]
    pub project_type: Option<String>,
    #[serde(default)]
    pub timeline: Option<String>,
    #[serde(default)]
    pub budget_indicator: Option<String>,
    pub sentiment: Sentiment,
    pub lead_score: i64,
    pub urgency: Urgency,
    pub appointment_requested: bool,
    pub follow_up_required: bool,
    #[serde(default)]
    pub key_details: Vec<String>,
}

/// Pull the JSON object out of a response that may be fenced or chatty
pub fn extract_json(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    (end > start).then(|| &raw[start..=end])
}

/// Parse a lead analysis; out-of-range scores are errors, never clamped
pub fn parse_lead_analysis(raw: &str) -> Result<LeadAnalysis> {
    let json = extract_json(raw)
        .ok_or_else(|| Error::AnalysisParse("response contains no JSON object".to_string()))?;
    let mut analysis: LeadAnalysis = serde_json::from_str(json)
        .map_err(|e| Error::AnalysisParse(format!("invalid analysis JSON: {}", e)))?;

    if !(1..=100).contains(&analysis.lead_score) {
        return Err(Error::AnalysisParse(format!(
            "lead_score {} outside 1-100",
            analysis.lead_score
        )));
    }
    if analysis.intent.trim().is_empty() {
        return Err(Error::AnalysisParse("intent is empty".to_string()));
    }

    analysis.key_details.truncate(MAX_KEY_DETAILS);
    Ok(analysis)
}

/// Parse a spam likelihood given as a bare number or `{"spam_likelihood": n}`
pub fn parse_spam_likelihood(raw: &str) -> Result<i64> {
    let trimmed = raw.trim().trim_matches('`').trim();

    let value = match extract_json(trimmed) {
        Some(json) => {
            let parsed: serde_json::Value = serde_json::from_str(json)
                .map_err(|e| Error::AnalysisParse(format!("invalid spam JSON: {}", e)))?;
            parsed
                .get("spam_likelihood")
                .and_then(|v| v.as_f64())
                .ok_or_else(|| {
                    Error::AnalysisParse("spam_likelihood missing or not a number".to_string())
                })?
        }
        None => trimmed.parse::<f64>().map_err(|_| {
            Error::AnalysisParse(format!("spam likelihood is not a number: {:?}", trimmed))
        })?,
    };

    if !value.is_finite() || !(0.0..=100.0).contains(&value) {
        return Err(Error::AnalysisParse(format!(
            "spam likelihood {} outside 0-100",
            value
        )));
    }
    Ok(value.round() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    const GOOD: &str = r#"{
        "intent": "Roof replacement quote",
        "project_type": "roofing",
        "timeline": "this month",
        "budget_indicator": "mid",
        "sentiment": "positive",
        "lead_score": 87,
        "urgency": "high",
        "appointment_requested": true,
        "follow_up_required": false,
        "key_details": ["a", "b", "c", "d", "e", "f", "g"]
    }"#;

    #[test]
    fn test_parse_good_analysis() {
        let analysis = parse_lead_analysis(GOOD).unwrap();
        assert_eq!(analysis.lead_score, 87);
        assert_eq!(analysis.sentiment, Sentiment::Positive);
        assert_eq!(analysis.urgency, Urgency::High);
        assert_eq!(analysis.key_details.len(), 5);
    }

    #[test]
    fn test_parse_fenced_analysis() {
        let fenced = format!("Here you go:\n```json\n{}\n```", GOOD);
        assert_eq!(parse_lead_analysis(&fenced).unwrap().lead_score, 87);
    }

    #[test]
    fn test_out_of_range_score_rejected() {
        for bad in ["0", "101", "-5", "87.5", "\"87\"", "null"] {
            let raw = GOOD.replace("\"lead_score\": 87", &format!("\"lead_score\": {}", bad));
            let err = parse_lead_analysis(&raw).unwrap_err();
            assert!(matches!(err, Error::AnalysisParse(_)), "{}", bad);
        }
    }

    #[test]
    fn test_unknown_enum_rejected() {
        let raw = GOOD.replace("\"positive\"", "\"ecstatic\"");
        assert!(parse_lead_analysis(&raw).is_err());
        assert!(parse_lead_analysis("no json here").is_err());
    }

    #[test]
    fn test_spam_forms() {
        assert_eq!(parse_spam_likelihood("12").unwrap(), 12);
        assert_eq!(parse_spam_likelihood(" 0\n").unwrap(), 0);
        assert_eq!(parse_spam_likelihood("100").unwrap(), 100);
        assert_eq!(parse_spam_likelihood(r#"{"spam_likelihood": 73}"#).unwrap(), 73);
        assert_eq!(parse_spam_likelihood("```\n{\"spam_likelihood\": 5}\n```").unwrap(), 5);
    }

    #[test]
    fn test_spam_rejects_out_of_range_and_text() {
        for bad in ["101", "-1", "likely spam", "NaN", r#"{"spam_likelihood": "high"}"#, "{}"] {
            let err = parse_spam_likelihood(bad).unwrap_err();
            assert!(matches!(err, Error::AnalysisParse(_)), "{}", bad);
        }
    }
}
