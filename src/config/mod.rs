//! Configuration module for the speech client
//!
//! Settings come from environment variables (a `.env` file is loaded by the
//! binary at startup) and, optionally, a YAML file. Priority: YAML > ENV vars
//! > .env values > defaults.
//!
//! # Environment variables
//! - `SPEECH_KEY`: subscription key (required)
//! - `SPEECH_REGION`: service region, e.g. `westus`
//! - `SPEECH_ENDPOINT`: explicit service URL, overrides the region host
//! - `SPEECH_LANGUAGE`: recognition language (default `en-US`)
//! - `SPEECH_RECOGNITION_MODE`: `interactive` | `conversation` | `dictation`
//! - `SPEECH_OUTPUT_FORMAT`: `simple` | `detailed`
//! - `SPEECH_MAX_RETRY_COUNT`: connection attempts per session (default 4)
//! - `SPEECH_TELEMETRY_ENABLED`: send service telemetry at every turn end
//! - `SPEECH_USE_ISSUED_TOKEN`: exchange the key for a bearer token
//! - `SPEECH_PHRASE_HINTS`: comma-separated phrase hints
//! - `SPEECH_TARGET_LANGUAGES`: comma-separated translation targets
//! - `SPEECH_VOICE`: voice for translated speech synthesis
//! - `SPEECH_INTENT_APP_ID`, `SPEECH_INTENT_KEY`: language-understanding app
//!
//! # Example
//! ```rust,no_run
//! use waav_speech_client::config::ClientConfig;
//! use std::path::PathBuf;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Load from environment variables only
//! let config = ClientConfig::from_env()?;
//!
//! // Load from YAML file with environment variables as the base
//! let config = ClientConfig::from_file(&PathBuf::from("speech.yaml"))?;
//! println!("Recognizing {} in {}", config.language, config.region);
//! # Ok(())
//! # }
//! ```

use std::path::PathBuf;
use std::str::FromStr;

use url::Url;

use crate::core::recognition::{
    DEFAULT_MAX_RETRY_COUNT, OutputFormat, RecognitionMode, RecognizerConfig,
};

mod yaml;

pub use yaml::{IntentYaml, SpeechYaml, TranslationYaml, YamlConfig};

const DEFAULT_LANGUAGE: &str = "en-US";

/// Translation targets and optional synthesis voice
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TranslationConfig {
    pub target_languages: Vec<String>,
    pub voice: Option<String>,
}

/// Language-understanding app used in intent mode
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntentConfig {
    pub app_id: String,
    pub key: String,
}

/// Client configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub subscription_key: String,
    pub region: String,
    pub endpoint: Option<Url>,
    pub language: String,
    pub mode: RecognitionMode,
    pub output_format: OutputFormat,
    pub max_retry_count: u32,
    pub telemetry_enabled: bool,
    /// Use a short-lived bearer token instead of sending the key itself
    pub use_issued_token: bool,
    pub phrase_hints: Vec<String>,
    pub translation: TranslationConfig,
    pub intent: Option<IntentConfig>,
}

impl ClientConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from a YAML file on top of environment variables
    ///
    /// YAML values override environment variables, which override defaults.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed, a value has an
    /// invalid format, or the merged configuration fails validation.
    pub fn from_file(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        let yaml_config = YamlConfig::from_file(path)?;
        let config = Self::load(|name| std::env::var(name).ok())?.merge_yaml(yaml_config)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, Box<dyn std::error::Error>>
    where
        F: Fn(&str) -> Option<String>,
    {
        let config = Self::load(lookup)?;
        config.validate()?;
        Ok(config)
    }

    fn load<F>(lookup: F) -> Result<Self, Box<dyn std::error::Error>>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        let endpoint = get("SPEECH_ENDPOINT")
            .map(|value| parse_endpoint(&value))
            .transpose()?;
        let mode = get("SPEECH_RECOGNITION_MODE")
            .map(|value| RecognitionMode::from_str(&value))
            .transpose()?
            .unwrap_or_default();
        let output_format = get("SPEECH_OUTPUT_FORMAT")
            .map(|value| OutputFormat::from_str(&value))
            .transpose()?
            .unwrap_or_default();
        let max_retry_count = get("SPEECH_MAX_RETRY_COUNT")
            .map(|value| {
                value
                    .trim()
                    .parse::<u32>()
                    .map_err(|e| format!("Invalid SPEECH_MAX_RETRY_COUNT value '{value}': {e}"))
            })
            .transpose()?
            .unwrap_or(DEFAULT_MAX_RETRY_COUNT);
        let telemetry_enabled = get("SPEECH_TELEMETRY_ENABLED")
            .map(|value| parse_bool("SPEECH_TELEMETRY_ENABLED", &value))
            .transpose()?
            .unwrap_or(false);
        let use_issued_token = get("SPEECH_USE_ISSUED_TOKEN")
            .map(|value| parse_bool("SPEECH_USE_ISSUED_TOKEN", &value))
            .transpose()?
            .unwrap_or(false);

        let intent = match (get("SPEECH_INTENT_APP_ID"), get("SPEECH_INTENT_KEY")) {
            (None, None) => None,
            (app_id, key) => Some(IntentConfig {
                app_id: app_id.unwrap_or_default(),
                key: key.unwrap_or_default(),
            }),
        };

        Ok(Self {
            subscription_key: get("SPEECH_KEY").unwrap_or_default(),
            region: get("SPEECH_REGION").unwrap_or_default(),
            endpoint,
            language: get("SPEECH_LANGUAGE").unwrap_or_else(|| DEFAULT_LANGUAGE.to_string()),
            mode,
            output_format,
            max_retry_count,
            telemetry_enabled,
            use_issued_token,
            phrase_hints: get("SPEECH_PHRASE_HINTS")
                .map(|value| split_list(&value))
                .unwrap_or_default(),
            translation: TranslationConfig {
                target_languages: get("SPEECH_TARGET_LANGUAGES")
                    .map(|value| split_list(&value))
                    .unwrap_or_default(),
                voice: get("SPEECH_VOICE"),
            },
            intent,
        })
    }

    fn merge_yaml(mut self, yaml: YamlConfig) -> Result<Self, Box<dyn std::error::Error>> {
        if let Some(speech) = yaml.speech {
            if let Some(key) = speech.subscription_key {
                self.subscription_key = key;
            }
            if let Some(region) = speech.region {
                self.region = region;
            }
            if let Some(endpoint) = speech.endpoint {
                self.endpoint = Some(parse_endpoint(&endpoint)?);
            }
            if let Some(language) = speech.language {
                self.language = language;
            }
            if let Some(mode) = speech.recognition_mode {
                self.mode = mode.parse()?;
            }
            if let Some(format) = speech.output_format {
                self.output_format = format.parse()?;
            }
            if let Some(count) = speech.max_retry_count {
                self.max_retry_count = count;
            }
            if let Some(enabled) = speech.telemetry_enabled {
                self.telemetry_enabled = enabled;
            }
            if let Some(enabled) = speech.use_issued_token {
                self.use_issued_token = enabled;
            }
            if let Some(hints) = speech.phrase_hints {
                self.phrase_hints = hints;
            }
        }

        if let Some(translation) = yaml.translation {
            if let Some(targets) = translation.target_languages {
                self.translation.target_languages = targets;
            }
            if translation.voice.is_some() {
                self.translation.voice = translation.voice;
            }
        }

        if let Some(intent) = yaml.intent {
            let mut merged = self.intent.take().unwrap_or(IntentConfig {
                app_id: String::new(),
                key: String::new(),
            });
            if let Some(app_id) = intent.app_id {
                merged.app_id = app_id;
            }
            if let Some(key) = intent.key {
                merged.key = key;
            }
            self.intent = Some(merged);
        }

        Ok(self)
    }

    /// Check the configuration is usable
    ///
    /// # Errors
    /// Returns a message naming the first missing or invalid setting.
    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if self.subscription_key.trim().is_empty() {
            return Err("SPEECH_KEY is required".into());
        }
        if self.endpoint.is_none() && self.region.trim().is_empty() {
            return Err("Either SPEECH_REGION or SPEECH_ENDPOINT is required".into());
        }
        if self.use_issued_token && self.region.trim().is_empty() {
            return Err("SPEECH_USE_ISSUED_TOKEN requires SPEECH_REGION".into());
        }
        if self.language.trim().is_empty() {
            return Err("SPEECH_LANGUAGE must not be empty".into());
        }
        if self
            .translation
            .target_languages
            .iter()
            .any(|language| language.trim().is_empty())
        {
            return Err("SPEECH_TARGET_LANGUAGES contains an empty language".into());
        }
        if let Some(intent) = &self.intent {
            if intent.app_id.trim().is_empty() || intent.key.trim().is_empty() {
                return Err(
                    "Intent mode needs both SPEECH_INTENT_APP_ID and SPEECH_INTENT_KEY".into(),
                );
            }
        }
        Ok(())
    }

    /// The engine's view of this configuration
    pub fn recognizer_config(&self) -> RecognizerConfig {
        RecognizerConfig {
            region: self.region.clone(),
            endpoint: self.endpoint.clone(),
            language: self.language.clone(),
            mode: self.mode,
            output_format: self.output_format,
            max_retry_count: self.max_retry_count,
            telemetry_enabled: self.telemetry_enabled,
            phrase_hints: self.phrase_hints.clone(),
        }
    }
}

fn parse_endpoint(value: &str) -> Result<Url, String> {
    let url = Url::parse(value.trim())
        .map_err(|e| format!("Invalid SPEECH_ENDPOINT '{value}': {e}"))?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        scheme => Err(format!(
            "Invalid SPEECH_ENDPOINT '{value}': expected ws or wss scheme, got {scheme}"
        )),
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool, String> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(format!("Invalid {name} value '{other}': expected true or false")),
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}
