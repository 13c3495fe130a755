//! Prompt construction for lead analysis and spam scoring

use crate::audio::Transcript;
use crate::db::LeadRequest;

const LEAD_SYSTEM_PROMPT: &str = "You analyze inbound sales phone calls for a local service business. \
Respond with a single JSON object and nothing else.";

const SPAM_SYSTEM_PROMPT: &str = "You detect spam, robocalls and solicitation in inbound phone calls. \
Respond with a single integer from 0 to 100 and nothing else.";

/// Call metadata the prompts draw on
#[derive(Debug, Clone, Default)]
pub struct CallContextInfo {
    pub caller_name: Option<String>,
    pub caller_number: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub duration_seconds: Option<i64>,
    pub source: Option<String>,
    pub tags: Vec<String>,
    pub lead_status_hint: Option<String>,
}

impl CallContextInfo {
    pub fn from_request(request: &LeadRequest, fallback_duration: Option<i64>) -> Self {
        Self {
            caller_name: request.caller_name.clone(),
            caller_number: request.caller_number.clone(),
            city: request.city.clone(),
            state: request.state.clone(),
            duration_seconds: request.duration_seconds.or(fallback_duration),
            source: request.source.clone(),
            tags: request.tags(),
            lead_status_hint: request.lead_status_hint.clone(),
        }
    }

    fn location(&self) -> String {
        match (&self.city, &self.state) {
            (Some(c), Some(s)) => format!("{}, {}", c, s),
            (Some(c), None) => c.clone(),
            (None, Some(s)) => s.clone(),
            (None, None) => "unknown".to_string(),
        }
    }
}

/// Prompt pair for one model invocation
#[derive(Debug, Clone)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

/// Lead-analysis prompt; `guidance` is the office's scoring instructions
pub fn lead_prompt(info: &CallContextInfo, transcript: &Transcript, guidance: Option<&str>) -> Prompt {
    let mut system = LEAD_SYSTEM_PROMPT.to_string();
    if let Some(guidance) = guidance.filter(|g| !g.trim().is_empty()) {
        system.push_str("\n\nScoring guidance from the business:\n");
        system.push_str(guidance.trim());
    }

    let user = format!(
        r#"Call details:
- Caller: {name} ({number})
- Location: {location}
- Duration: {duration}
- Source: {source}
- Tags: {tags}
- Current lead status: {status}

Transcript ({speakers} speakers):
{transcript}

Return JSON with exactly these fields:
{{
  "intent": string,
  "project_type": string or null,
  "timeline": string or null,
  "budget_indicator": string or null,
  "sentiment": "positive" | "neutral" | "negative",
  "lead_score": integer from 1 to 100,
  "urgency": "low" | "medium" | "high",
  "appointment_requested": boolean,
  "follow_up_required": boolean,
  "key_details": array of at most 5 short strings
}}"#,
        name = info.caller_name.as_deref().unwrap_or("unknown"),
        number = info.caller_number.as_deref().unwrap_or("unknown"),
        location = info.location(),
        duration = info
            .duration_seconds
            .map(|d| format!("{} seconds", d))
            .unwrap_or_else(|| "unknown".to_string()),
        source = info.source.as_deref().unwrap_or("unknown"),
        tags = if info.tags.is_empty() {
            "none".to_string()
        } else {
            info.tags.join(", ")
        },
        status = info.lead_status_hint.as_deref().unwrap_or("none"),
        speakers = transcript.speaker_count,
        transcript = render_transcript(transcript),
    );

    Prompt { system, user }
}

/// Spam-likelihood prompt
pub fn spam_prompt(info: &CallContextInfo, transcript: &Transcript) -> Prompt {
    let user = format!(
        "Rate how likely this call is spam from 0 (legitimate customer) to 100 (certain spam).\n\
Very short calls and scripted, sales-pitch language are strong spam signals.\n\n\
Duration: {}\nTranscript:\n{}",
        info.duration_seconds
            .map(|d| format!("{} seconds", d))
            .unwrap_or_else(|| "unknown".to_string()),
        render_transcript(transcript),
    );

    Prompt {
        system: SPAM_SYSTEM_PROMPT.to_string(),
        user,
    }
}

/// Speaker-labelled transcript, falling back to plain text
fn render_transcript(transcript: &Transcript) -> String {
    if transcript.is_empty() {
        return "(no speech detected)".to_string();
    }
    if transcript.segments.is_empty() {
        return transcript.text.clone();
    }
    transcript
        .segments
        .iter()
        .map(|s| format!("Speaker {}: {}", s.speaker, s.text))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::SpeakerSegment;

    fn transcript() -> Transcript {
        Transcript {
            text: "hi I need a roof quote".to_string(),
            confidence: 0.9,
            segments: vec![
                SpeakerSegment {
                    speaker: 1,
                    start: 0.0,
                    end: 0.5,
                    text: "hi".to_string(),
                },
                SpeakerSegment {
                    speaker: 2,
                    start: 0.5,
                    end: 2.0,
                    text: "I need a roof quote".to_string(),
                },
            ],
            words: vec![],
            speaker_count: 2,
        }
    }

    #[test]
    fn test_lead_prompt_includes_metadata() {
        let info = CallContextInfo {
            caller_name: Some("Jane".to_string()),
            city: Some("Austin".to_string()),
            state: Some("TX".to_string()),
            duration_seconds: Some(180),
            tags: vec!["ppc".to_string()],
            ..Default::default()
        };
        let prompt = lead_prompt(&info, &transcript(), Some("Roofing jobs score high"));
        assert!(prompt.system.contains("Roofing jobs score high"));
        assert!(prompt.user.contains("Jane"));
        assert!(prompt.user.contains("Austin, TX"));
        assert!(prompt.user.contains("180 seconds"));
        assert!(prompt.user.contains("Speaker 2: I need a roof quote"));
        assert!(prompt.user.contains("\"lead_score\""));
    }

    #[test]
    fn test_spam_prompt_handles_empty_transcript() {
        let prompt = spam_prompt(&CallContextInfo::default(), &Transcript::default());
        assert!(prompt.user.contains("(no speech detected)"));
        assert!(prompt.user.contains("Duration: unknown"));
    }
}
