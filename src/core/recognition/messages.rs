//! Service message payloads.
//!
//! Inbound payloads use PascalCase field names (the intent `response` body
//! is camelCase). Outbound `speech.config`, `speech.context` and `telemetry`
//! bodies are built here.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use super::base::RecognitionStatus;
use crate::core::audio::AudioFormat;

// =============================================================================
// Inbound
// =============================================================================

/// `speech.startdetected` / `speech.enddetected`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SpeechDetected {
    #[serde(default)]
    pub offset: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PrimaryLanguage {
    #[serde(default)]
    pub language: String,
}

/// `speech.hypothesis` / `speech.fragment`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SpeechHypothesis {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub offset: u64,
    #[serde(default)]
    pub duration: u64,
    #[serde(default)]
    pub primary_language: Option<PrimaryLanguage>,
}

/// `speech.phrase` in simple output format.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SimpleSpeechPhrase {
    pub recognition_status: RecognitionStatus,
    #[serde(default)]
    pub display_text: String,
    #[serde(default)]
    pub offset: u64,
    #[serde(default)]
    pub duration: u64,
    #[serde(default)]
    pub primary_language: Option<PrimaryLanguage>,
}

/// `speech.phrase` in detailed output format.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DetailedSpeechPhrase {
    pub recognition_status: RecognitionStatus,
    #[serde(default, rename = "NBest")]
    pub n_best: Vec<NBestEntry>,
    #[serde(default)]
    pub offset: u64,
    #[serde(default)]
    pub duration: u64,
    #[serde(default)]
    pub primary_language: Option<PrimaryLanguage>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NBestEntry {
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub lexical: String,
    #[serde(default, rename = "ITN")]
    pub itn: String,
    #[serde(default, rename = "MaskedITN")]
    pub masked_itn: String,
    #[serde(default)]
    pub display: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TranslatedText {
    pub language: String,
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TranslationBlock {
    #[serde(default)]
    pub translation_status: Option<String>,
    #[serde(default)]
    pub translations: Vec<TranslatedText>,
    #[serde(default)]
    pub failure_reason: Option<String>,
}

impl TranslationBlock {
    pub fn is_success(&self) -> bool {
        self.translation_status
            .as_deref()
            .is_none_or(|status| status.eq_ignore_ascii_case("Success"))
    }

    pub fn to_map(&self) -> BTreeMap<String, String> {
        self.translations
            .iter()
            .map(|t| (t.language.clone(), t.text.clone()))
            .collect()
    }
}

/// `translation.hypothesis`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TranslationHypothesis {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub offset: u64,
    #[serde(default)]
    pub duration: u64,
    #[serde(default)]
    pub translation: TranslationBlock,
}

/// `translation.phrase`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TranslationPhrase {
    pub recognition_status: RecognitionStatus,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub offset: u64,
    #[serde(default)]
    pub duration: u64,
    #[serde(default)]
    pub translation: Option<TranslationBlock>,
}

/// `translation.synthesis.end`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SynthesisEnd {
    #[serde(default)]
    pub synthesis_status: Option<String>,
    #[serde(default)]
    pub failure_reason: Option<String>,
}

impl SynthesisEnd {
    pub fn is_error(&self) -> bool {
        self.synthesis_status
            .as_deref()
            .is_some_and(|status| status.eq_ignore_ascii_case("Error"))
    }
}

/// Intent `response` body.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentResponse {
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub top_scoring_intent: Option<IntentScore>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IntentScore {
    pub intent: String,
    #[serde(default)]
    pub score: f64,
}

// =============================================================================
// Outbound
// =============================================================================

/// `speech.config` body: client and audio description, sent once per
/// connection.
#[derive(Debug, Clone, Serialize)]
pub struct SpeechConfigPayload {
    context: SpeechConfigContext,
}

#[derive(Debug, Clone, Serialize)]
struct SpeechConfigContext {
    system: SystemInfo,
    os: OsInfo,
    audio: AudioInfo,
}

#[derive(Debug, Clone, Serialize)]
struct SystemInfo {
    name: &'static str,
    version: &'static str,
    build: &'static str,
    lang: &'static str,
}

#[derive(Debug, Clone, Serialize)]
struct OsInfo {
    platform: &'static str,
    name: &'static str,
    version: &'static str,
}

#[derive(Debug, Clone, Serialize)]
struct AudioInfo {
    source: AudioSourceInfo,
}

#[derive(Debug, Clone, Serialize)]
struct AudioSourceInfo {
    bitspersample: u16,
    channelcount: u16,
    connectivity: &'static str,
    manufacturer: &'static str,
    model: String,
    samplerate: u32,
    #[serde(rename = "type")]
    kind: &'static str,
}

impl SpeechConfigPayload {
    pub fn new(format: &AudioFormat, source_model: &str) -> Self {
        Self {
            context: SpeechConfigContext {
                system: SystemInfo {
                    name: "WaaVSpeechClient",
                    version: env!("CARGO_PKG_VERSION"),
                    build: "Rust",
                    lang: "Rust",
                },
                os: OsInfo {
                    platform: std::env::consts::OS,
                    name: std::env::consts::FAMILY,
                    version: std::env::consts::ARCH,
                },
                audio: AudioInfo {
                    source: AudioSourceInfo {
                        bitspersample: format.bits_per_sample,
                        channelcount: format.channels,
                        connectivity: "Unknown",
                        manufacturer: "WaaV",
                        model: source_model.to_string(),
                        samplerate: format.samples_per_sec,
                        kind: "Stream",
                    },
                },
            },
        }
    }
}

/// `speech.context` body. Sections are added by the engine (dynamic
/// grammar) and by the active recognition mode (intent provider, ...).
pub fn speech_context(phrase_hints: &[String], mut sections: Map<String, Value>) -> Value {
    if !phrase_hints.is_empty() {
        let items: Vec<Value> = phrase_hints.iter().map(|hint| json!({ "Text": hint })).collect();
        sections.insert(
            "dgi".to_string(),
            json!({ "Groups": [{ "Type": "Generic", "Items": items }] }),
        );
    }
    Value::Object(sections)
}

/// Connection / listening latency record sent with `telemetry`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct TelemetryMetric {
    pub name: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub start: String,
    pub end: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct TelemetryPayload {
    pub received_messages: BTreeMap<String, Vec<String>>,
    pub metrics: Vec<TelemetryMetric>,
}
