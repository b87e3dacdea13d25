//! Plain speech-to-text.

use tracing::debug;

use super::{DispatchContext, RecognitionModeHandler, parse_body, suppress_no_match};
use crate::core::protocol::{ProtocolEnvelope, paths};
use crate::core::recognition::base::{
    OutputFormat, RecognitionError, RecognitionResult, RecognitionStatus, ResultReason,
};
use crate::core::recognition::messages::{
    DetailedSpeechPhrase, SimpleSpeechPhrase, SpeechHypothesis,
};

/// Speech phrase reduced to the fields every mode needs.
#[derive(Debug, Clone)]
pub(crate) struct Phrase {
    pub status: RecognitionStatus,
    pub text: String,
    pub offset: u64,
    pub duration: u64,
    pub language: Option<String>,
}

/// Parse `speech.phrase` in whichever format was requested. Detailed
/// payloads report the best NBest entry.
pub(crate) fn parse_phrase(
    message: &ProtocolEnvelope,
    format: OutputFormat,
) -> Result<Phrase, RecognitionError> {
    match format {
        OutputFormat::Simple => {
            let phrase: SimpleSpeechPhrase = parse_body(message)?;
            Ok(Phrase {
                status: phrase.recognition_status,
                text: phrase.display_text,
                offset: phrase.offset,
                duration: phrase.duration,
                language: phrase.primary_language.map(|l| l.language),
            })
        }
        OutputFormat::Detailed => {
            let phrase: DetailedSpeechPhrase = parse_body(message)?;
            let text = phrase
                .n_best
                .first()
                .map(|best| best.display.clone())
                .unwrap_or_default();
            Ok(Phrase {
                status: phrase.recognition_status,
                text,
                offset: phrase.offset,
                duration: phrase.duration,
                language: phrase.primary_language.map(|l| l.language),
            })
        }
    }
}

/// Raise `recognizing` for a `speech.hypothesis` / `speech.fragment`.
pub(crate) fn report_hypothesis(
    message: &ProtocolEnvelope,
    ctx: &mut DispatchContext<'_>,
    reason: ResultReason,
) -> Result<(), RecognitionError> {
    let hypothesis: SpeechHypothesis = parse_body(message)?;
    let offset = hypothesis.offset + ctx.turn_offset();
    ctx.on_hypothesis(offset);

    let mut result = ctx.result(reason);
    result.text = hypothesis.text;
    result.offset = offset;
    result.duration = hypothesis.duration;
    result.language = hypothesis.primary_language.map(|l| l.language);
    result.json = message.text_body().to_string();
    ctx.recognizing(result);
    Ok(())
}

/// Apply the bookkeeping shared by every mode for a final phrase. Returns
/// `None` when the phrase canceled the turn.
pub(crate) fn accept_phrase(
    message: &ProtocolEnvelope,
    phrase: &Phrase,
    ctx: &mut DispatchContext<'_>,
) -> Option<RecognitionResult> {
    let reason = phrase.status.result_reason();
    if reason == ResultReason::Canceled {
        ctx.cancel(
            phrase.status.cancellation_reason(),
            phrase.status.cancellation_error_code(),
            phrase.status.to_string(),
        );
        return None;
    }

    let offset = phrase.offset + ctx.turn_offset();
    ctx.on_phrase_recognized(offset + phrase.duration);

    let mut result = ctx.result(reason);
    if reason != ResultReason::NoMatch {
        result.text = phrase.text.clone();
    }
    result.offset = offset;
    result.duration = phrase.duration;
    result.language = phrase.language.clone();
    result.json = message.text_body().to_string();
    Some(result)
}

/// Report a final result unless it is a trailing NoMatch; a single-shot
/// caller always gets it.
pub(crate) fn report_final(
    ctx: &DispatchContext<'_>,
    result: RecognitionResult,
    status: RecognitionStatus,
) {
    let initial_silence = status == RecognitionStatus::InitialSilenceTimeout;
    if suppress_no_match(ctx, result.reason, initial_silence) {
        debug!(result_id = %result.result_id, "Suppressing trailing NoMatch");
    } else {
        ctx.recognized(result.clone());
    }
    ctx.resolve(result);
}

#[derive(Debug, Default)]
pub struct SpeechHandler;

impl SpeechHandler {
    pub fn new() -> Self {
        Self
    }
}

impl RecognitionModeHandler for SpeechHandler {
    fn name(&self) -> &'static str {
        "speech"
    }

    fn process_message(
        &mut self,
        message: &ProtocolEnvelope,
        ctx: &mut DispatchContext<'_>,
    ) -> Result<bool, RecognitionError> {
        if message.is_path(paths::SPEECH_HYPOTHESIS) || message.is_path(paths::SPEECH_FRAGMENT) {
            report_hypothesis(message, ctx, ResultReason::RecognizingSpeech)?;
            return Ok(true);
        }

        if message.is_path(paths::SPEECH_PHRASE) {
            let phrase = parse_phrase(message, ctx.output_format())?;
            if let Some(result) = accept_phrase(message, &phrase, ctx) {
                report_final(ctx, result, phrase.status);
            }
            return Ok(true);
        }

        Ok(false)
    }
}
