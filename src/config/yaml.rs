use serde::Deserialize;
use std::path::PathBuf;

/// Complete YAML configuration structure
///
/// All fields are optional to allow partial configuration; anything left
/// out keeps the value from the environment (or the default).
///
/// # Example YAML structure
/// ```yaml
/// speech:
///   subscription_key: "your-speech-key"
///   region: "westus"
///   language: "en-US"
///   recognition_mode: "conversation"
///   output_format: "detailed"
///   max_retry_count: 4
///   telemetry_enabled: true
///   use_issued_token: false
///   phrase_hints:
///     - "WaaV"
///
/// translation:
///   target_languages: ["de", "fr"]
///   voice: "de-DE-KatjaNeural"
///
/// intent:
///   app_id: "your-luis-app-id"
///   key: "your-luis-key"
/// ```
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct YamlConfig {
    pub speech: Option<SpeechYaml>,
    pub translation: Option<TranslationYaml>,
    pub intent: Option<IntentYaml>,
}

/// Service connection and recognition settings from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct SpeechYaml {
    pub subscription_key: Option<String>,
    pub region: Option<String>,
    /// Full service URL; overrides the regional host
    pub endpoint: Option<String>,
    pub language: Option<String>,
    /// interactive | conversation | dictation
    pub recognition_mode: Option<String>,
    /// simple | detailed
    pub output_format: Option<String>,
    pub max_retry_count: Option<u32>,
    pub telemetry_enabled: Option<bool>,
    pub use_issued_token: Option<bool>,
    pub phrase_hints: Option<Vec<String>>,
}

/// Translation settings from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct TranslationYaml {
    pub target_languages: Option<Vec<String>>,
    pub voice: Option<String>,
}

/// Intent recognition settings from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct IntentYaml {
    pub app_id: Option<String>,
    pub key: Option<String>,
}

impl YamlConfig {
    /// Load configuration from a YAML file
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or the YAML is malformed.
    pub fn from_file(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file {}: {e}", path.display()))?;

        let config: YamlConfig = serde_yaml::from_str(&contents)
            .map_err(|e| format!("Failed to parse YAML config: {e}"))?;

        Ok(config)
    }
}
