//! Speech translation, with optional synthesis of the translated text.

use bytes::Bytes;
use tracing::warn;
use url::Url;

use super::speech::{Phrase, accept_phrase, report_final};
use super::{DispatchContext, RecognitionModeHandler, parse_body};
use crate::core::protocol::{ProtocolEnvelope, paths};
use crate::core::recognition::base::{
    CancellationErrorCode, CancellationReason, RecognitionError, RecognitionEvent,
    RecognizerConfig, ResultReason, set_query_default,
};
use crate::core::recognition::messages::{SynthesisEnd, TranslationHypothesis, TranslationPhrase};

pub struct TranslationHandler {
    target_languages: Vec<String>,
    voice: Option<String>,
}

impl TranslationHandler {
    pub fn new(
        target_languages: Vec<String>,
        voice: Option<String>,
    ) -> Result<Self, RecognitionError> {
        if target_languages.iter().all(|l| l.trim().is_empty()) {
            return Err(RecognitionError::ArgumentInvalid(
                "at least one target language is required".to_string(),
            ));
        }
        Ok(Self {
            target_languages,
            voice,
        })
    }

    pub fn target_languages(&self) -> &[String] {
        &self.target_languages
    }

    fn on_phrase(
        &self,
        message: &ProtocolEnvelope,
        ctx: &mut DispatchContext<'_>,
    ) -> Result<(), RecognitionError> {
        let phrase: TranslationPhrase = parse_body(message)?;
        let common = Phrase {
            status: phrase.recognition_status,
            text: phrase.text,
            offset: phrase.offset,
            duration: phrase.duration,
            language: None,
        };
        let Some(mut result) = accept_phrase(message, &common, ctx) else {
            return Ok(());
        };

        if result.reason == ResultReason::RecognizedSpeech {
            match &phrase.translation {
                Some(block) if !block.is_success() => {
                    warn!(
                        failure_reason = block.failure_reason.as_deref().unwrap_or_default(),
                        "Translation failed; reporting recognized speech only"
                    );
                }
                Some(block) => {
                    result.reason = ResultReason::TranslatedSpeech;
                    result.translations = block.to_map();
                }
                None => result.reason = ResultReason::TranslatedSpeech,
            }
        }
        report_final(ctx, result, common.status);
        Ok(())
    }
}

impl RecognitionModeHandler for TranslationHandler {
    fn name(&self) -> &'static str {
        "translation"
    }

    fn service_url(&self, config: &RecognizerConfig) -> Result<Url, RecognitionError> {
        let mut url = match &config.endpoint {
            Some(endpoint) => endpoint.clone(),
            None => Url::parse(&format!(
                "wss://{}.s2s.speech.microsoft.com/speech/translation/cognitiveservices/v1",
                config.region
            ))
            .map_err(|e| RecognitionError::ArgumentInvalid(format!("invalid region: {e}")))?,
        };
        set_query_default(&mut url, "from", &config.language);
        set_query_default(&mut url, "to", &self.target_languages.join(","));
        if let Some(voice) = &self.voice {
            set_query_default(&mut url, "features", "texttospeech");
            set_query_default(&mut url, "voice", voice);
        }
        Ok(url)
    }

    fn process_message(
        &mut self,
        message: &ProtocolEnvelope,
        ctx: &mut DispatchContext<'_>,
    ) -> Result<bool, RecognitionError> {
        if message.is_path(paths::TRANSLATION_HYPOTHESIS) {
            let hypothesis: TranslationHypothesis = parse_body(message)?;
            let offset = hypothesis.offset + ctx.turn_offset();
            ctx.on_hypothesis(offset);

            let mut result = ctx.result(ResultReason::TranslatingSpeech);
            result.text = hypothesis.text;
            result.offset = offset;
            result.duration = hypothesis.duration;
            result.translations = hypothesis.translation.to_map();
            result.json = message.text_body().to_string();
            ctx.recognizing(result);
            return Ok(true);
        }

        if message.is_path(paths::TRANSLATION_PHRASE) {
            self.on_phrase(message, ctx)?;
            return Ok(true);
        }

        if message.is_path(paths::TRANSLATION_SYNTHESIS) {
            let audio = message.binary_body().cloned().unwrap_or_default();
            ctx.emit(RecognitionEvent::Synthesizing {
                session_id: ctx.session_id(),
                audio,
                completed: false,
            });
            return Ok(true);
        }

        if message.is_path(paths::TRANSLATION_SYNTHESIS_END) {
            let end: SynthesisEnd = if message.text_body().trim().is_empty() {
                SynthesisEnd::default()
            } else {
                parse_body(message)?
            };
            if end.is_error() {
                ctx.cancel(
                    CancellationReason::Error,
                    CancellationErrorCode::ServiceError,
                    end.failure_reason.unwrap_or_else(|| "Synthesis failed".to_string()),
                );
            } else {
                ctx.emit(RecognitionEvent::Synthesizing {
                    session_id: ctx.session_id(),
                    audio: Bytes::new(),
                    completed: true,
                });
            }
            return Ok(true);
        }

        Ok(false)
    }
}
