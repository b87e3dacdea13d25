//! Intent recognition.
//!
//! The service recognizes speech as usual and then sends a `response`
//! message with the language-understanding verdict for the phrase. A
//! successful phrase is therefore held until its `response` arrives.

use std::collections::HashMap;

use serde_json::{Map, Value, json};
use url::Url;

use super::speech::{accept_phrase, parse_phrase, report_final, report_hypothesis};
use super::{DispatchContext, RecognitionModeHandler, parse_body};
use crate::core::protocol::{ProtocolEnvelope, paths};
use crate::core::recognition::base::{
    OutputFormat, RecognitionError, RecognitionResult, RecognitionStatus, RecognizerConfig,
    ResultReason,
};
use crate::core::recognition::messages::IntentResponse;

pub struct IntentHandler {
    app_id: String,
    key: String,
    /// Service intent name to caller intent id.
    intents: HashMap<String, String>,
    /// Set by `add_all_intents`; `Some(None)` reports the service name.
    all_intents: Option<Option<String>>,
    pending: Option<RecognitionResult>,
}

impl IntentHandler {
    pub fn new(app_id: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            key: key.into(),
            intents: HashMap::new(),
            all_intents: None,
            pending: None,
        }
    }

    /// Report `intent_name` as `intent_id`.
    pub fn add_intent(&mut self, intent_name: impl Into<String>, intent_id: impl Into<String>) {
        self.intents.insert(intent_name.into(), intent_id.into());
    }

    /// Accept every intent of the model, reported as `intent_id` or, when
    /// `None`, under its own name.
    pub fn add_all_intents(&mut self, intent_id: Option<String>) {
        self.all_intents = Some(intent_id);
    }

    fn match_intent(&self, intent_name: &str) -> Option<String> {
        if let Some(id) = self.intents.get(intent_name) {
            return Some(id.clone());
        }
        match &self.all_intents {
            Some(Some(id)) => Some(id.clone()),
            Some(None) => Some(intent_name.to_string()),
            None => None,
        }
    }

    fn on_response(
        &mut self,
        message: &ProtocolEnvelope,
        ctx: &mut DispatchContext<'_>,
    ) -> Result<(), RecognitionError> {
        let pending = self.pending.take();

        if message.text_body().trim().is_empty() {
            if let Some(result) = pending {
                report_final(ctx, result, RecognitionStatus::Success);
            }
            return Ok(());
        }

        let response: IntentResponse = parse_body(message)?;
        let mut result = pending.unwrap_or_else(|| {
            let mut result = ctx.result(ResultReason::RecognizedSpeech);
            result.text = response.query.clone();
            result
        });
        result.json = message.text_body().to_string();

        if let Some(intent_id) = response
            .top_scoring_intent
            .as_ref()
            .and_then(|top| self.match_intent(&top.intent))
        {
            result.reason = ResultReason::RecognizedIntent;
            result.intent_id = Some(intent_id);
        }
        report_final(ctx, result, RecognitionStatus::Success);
        Ok(())
    }
}

impl RecognitionModeHandler for IntentHandler {
    fn name(&self) -> &'static str {
        "intent"
    }

    fn reset(&mut self) {
        self.pending = None;
    }

    fn service_url(&self, config: &RecognizerConfig) -> Result<Url, RecognitionError> {
        // Phrases are held for the `response` message in simple format.
        let mut config = config.clone();
        config.output_format = OutputFormat::Simple;
        config.speech_service_url()
    }

    fn augment_context(&self, sections: &mut Map<String, Value>) {
        sections.insert(
            "intent".to_string(),
            json!({ "provider": "LUIS", "id": self.app_id, "key": self.key }),
        );
    }

    fn process_message(
        &mut self,
        message: &ProtocolEnvelope,
        ctx: &mut DispatchContext<'_>,
    ) -> Result<bool, RecognitionError> {
        if message.is_path(paths::SPEECH_HYPOTHESIS) || message.is_path(paths::SPEECH_FRAGMENT) {
            report_hypothesis(message, ctx, ResultReason::RecognizingIntent)?;
            return Ok(true);
        }

        if message.is_path(paths::SPEECH_PHRASE) {
            // Intent recognition always runs in simple format.
            let phrase = parse_phrase(message, OutputFormat::Simple)?;
            if let Some(result) = accept_phrase(message, &phrase, ctx) {
                if result.reason == ResultReason::RecognizedSpeech {
                    self.pending = Some(result);
                } else {
                    report_final(ctx, result, phrase.status);
                }
            }
            return Ok(true);
        }

        if message.is_path(paths::INTENT_RESPONSE) {
            self.on_response(message, ctx)?;
            return Ok(true);
        }

        Ok(false)
    }
}
