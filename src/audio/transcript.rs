//! Transcription wire format and normalization
//!
//! The backend answers with recognition results, each carrying ranked
//! alternatives with word-level timing, confidence and speaker tags. The
//! pipeline only ever sees the normalized [`Transcript`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Raw backend response
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TranscriptionResponse {
    #[serde(default)]
    pub results: Vec<RecognitionResult>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RecognitionResult {
    #[serde(default)]
    pub alternatives: Vec<Alternative>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Alternative {
    #[serde(default)]
    pub transcript: String,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub words: Vec<WordInfo>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct WordInfo {
    pub word: String,
    #[serde(default, alias = "startTime")]
    pub start_time: Offset,
    #[serde(default, alias = "endTime")]
    pub end_time: Offset,
    #[serde(default, alias = "speakerTag")]
    pub speaker_tag: u32,
    #[serde(default)]
    pub confidence: Option<f64>,
}

/// Word offset, either seconds as a number or a `"1.5s"` duration string
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum Offset {
    Seconds(f64),
    Text(String),
}

impl Default for Offset {
    fn default() -> Self {
        Offset::Seconds(0.0)
    }
}

impl Offset {
    pub fn seconds(&self) -> f64 {
        match self {
            Offset::Seconds(s) => *s,
            Offset::Text(t) => t.trim().trim_end_matches('s').parse().unwrap_or(0.0),
        }
    }
}

/// Normalized transcript stored on the request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    pub text: String,
    /// Mean confidence across recognition results
    pub confidence: f64,
    pub segments: Vec<SpeakerSegment>,
    pub words: Vec<Word>,
    pub speaker_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeakerSegment {
    pub speaker: u32,
    pub start: f64,
    pub end: f64,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Word {
    pub word: String,
    pub start: f64,
    pub end: f64,
    pub speaker: u32,
    pub confidence: Option<f64>,
}

impl Transcript {
    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }
}

/// Normalize a backend response.
///
/// Diarizing backends repeat every word, speaker-tagged, in the final
/// result; when that result is tagged it is the word source, otherwise the
/// words of all results are concatenated.
pub fn normalize(response: &TranscriptionResponse) -> Transcript {
    let top: Vec<&Alternative> = response
        .results
        .iter()
        .filter_map(|r| r.alternatives.first())
        .collect();

    let text = top
        .iter()
        .map(|a| a.transcript.trim())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ");

    let confidences: Vec<f64> = top.iter().filter_map(|a| a.confidence).collect();
    let confidence = if confidences.is_empty() {
        0.0
    } else {
        confidences.iter().sum::<f64>() / confidences.len() as f64
    };

    let tagged_last = top
        .last()
        .filter(|a| a.words.iter().any(|w| w.speaker_tag > 0));
    let raw_words: Vec<&WordInfo> = match tagged_last {
        Some(last) => last.words.iter().collect(),
        None => top.iter().flat_map(|a| a.words.iter()).collect(),
    };

    let words: Vec<Word> = raw_words
        .into_iter()
        .map(|w| Word {
            word: w.word.clone(),
            start: w.start_time.seconds(),
            end: w.end_time.seconds(),
            speaker: w.speaker_tag,
            confidence: w.confidence,
        })
        .collect();

    let segments = segment_by_speaker(&words);
    let speaker_count = words
        .iter()
        .map(|w| w.speaker)
        .collect::<BTreeSet<_>>()
        .len();

    Transcript {
        text,
        confidence,
        segments,
        words,
        speaker_count,
    }
}

/// Split words into contiguous runs of one speaker
pub fn segment_by_speaker(words: &[Word]) -> Vec<SpeakerSegment> {
    let mut segments: Vec<SpeakerSegment> = Vec::new();
    for word in words {
        match segments.last_mut() {
            Some(current) if current.speaker == word.speaker => {
                current.text.push(' ');
                current.text.push_str(&word.word);
                current.end = word.end;
            }
            _ => segments.push(SpeakerSegment {
                speaker: word.speaker,
                start: word.start,
                end: word.end,
                text: word.word.clone(),
            }),
        }
    }
    segments
}

#[cfg(test)]
mod tests {
    use super::*;

    fn word(text: &str, speaker: u32, start: f64) -> WordInfo {
        WordInfo {
            word: text.to_string(),
            start_time: Offset::Seconds(start),
            end_time: Offset::Seconds(start + 0.4),
            speaker_tag: speaker,
            confidence: Some(0.9),
        }
    }

    fn words_with_speakers(speakers: &[u32]) -> Vec<Word> {
        speakers
            .iter()
            .enumerate()
            .map(|(i, s)| Word {
                word: format!("w{}", i),
                start: i as f64,
                end: i as f64 + 0.5,
                speaker: *s,
                confidence: None,
            })
            .collect()
    }

    #[test]
    fn test_k_changes_give_k_plus_one_segments() {
        let cases: &[&[u32]] = &[
            &[1],
            &[1, 1, 1],
            &[1, 2],
            &[1, 1, 2, 2, 1],
            &[1, 2, 1, 2, 1, 2],
            &[2, 2, 2, 1, 3, 3],
        ];
        for speakers in cases {
            let words = words_with_speakers(speakers);
            let changes = speakers.windows(2).filter(|w| w[0] != w[1]).count();
            let segments = segment_by_speaker(&words);
            assert_eq!(segments.len(), changes + 1, "{:?}", speakers);

            let joined = segments
                .iter()
                .map(|s| s.text.as_str())
                .collect::<Vec<_>>()
                .join(" ");
            let expected = words
                .iter()
                .map(|w| w.word.as_str())
                .collect::<Vec<_>>()
                .join(" ");
            assert_eq!(joined, expected);
        }
        assert!(segment_by_speaker(&[]).is_empty());
    }

    #[test]
    fn test_normalize_uses_tagged_final_result() {
        let response = TranscriptionResponse {
            results: vec![
                RecognitionResult {
                    alternatives: vec![Alternative {
                        transcript: "hi I need a new roof".to_string(),
                        confidence: Some(0.8),
                        words: vec![word("hi", 0, 0.0)],
                    }],
                },
                RecognitionResult {
                    alternatives: vec![Alternative {
                        transcript: String::new(),
                        confidence: Some(0.6),
                        words: vec![
                            word("hi", 1, 0.0),
                            word("I", 2, 0.5),
                            word("need", 2, 1.0),
                        ],
                    }],
                },
            ],
        };

        let transcript = normalize(&response);
        assert_eq!(transcript.text, "hi I need a new roof");
        assert!((transcript.confidence - 0.7).abs() < 1e-9);
        assert_eq!(transcript.words.len(), 3);
        assert_eq!(transcript.segments.len(), 2);
        assert_eq!(transcript.segments[1].text, "I need");
        assert_eq!(transcript.segments[1].start, 0.5);
        assert_eq!(transcript.speaker_count, 2);
    }

    #[test]
    fn test_string_offsets_parse() {
        let json = r#"{"results":[{"alternatives":[{"transcript":"yes","confidence":0.9,
            "words":[{"word":"yes","startTime":"1.500s","endTime":"2s","speakerTag":1}]}]}]}"#;
        let response: TranscriptionResponse = serde_json::from_str(json).unwrap();
        let transcript = normalize(&response);
        assert_eq!(transcript.words[0].start, 1.5);
        assert_eq!(transcript.words[0].end, 2.0);
    }

    #[test]
    fn test_empty_response() {
        let transcript = normalize(&TranscriptionResponse::default());
        assert!(transcript.is_empty());
        assert_eq!(transcript.speaker_count, 0);
        assert_eq!(transcript.confidence, 0.0);
    }
}
