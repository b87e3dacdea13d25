//! End-to-End Mock Tests
//!
//! Full recognitions against the in-memory service: the engine connects,
//! uploads audio from a push source and turns service messages into
//! recognition events and results.

mod mock_service;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use tokio::sync::mpsc;
use tokio::time::timeout;

use mock_service::{
    CountingAuth, MockServerConnection, MockService, STEP_TIMEOUT, hypothesis, simple_phrase,
};
use waav_speech_client::core::protocol::{MessageBody, headers, paths};
use waav_speech_client::{
    AudioFormat, CancellationErrorCode, CancellationReason, PushAudioSource, PushAudioWriter,
    RecognitionEngine, RecognitionEvent, RecognizerConfig, ResultReason, SpeechHandler,
};

const CHUNK: usize = 100;

// =============================================================================
// Helpers
// =============================================================================

struct Client {
    engine: RecognitionEngine,
    writer: PushAudioWriter,
    source: Arc<PushAudioSource>,
    events: mpsc::UnboundedReceiver<RecognitionEvent>,
}

fn client(service: &MockService, auth: Arc<CountingAuth>) -> Client {
    client_with_config(service, auth, RecognizerConfig::new("westus", "en-US"))
}

fn client_with_config(
    service: &MockService,
    auth: Arc<CountingAuth>,
    config: RecognizerConfig,
) -> Client {
    let source = Arc::new(PushAudioSource::new(AudioFormat::default()));
    let engine = RecognitionEngine::new(
        config,
        auth,
        service.transport.clone(),
        source.clone(),
        Box::new(SpeechHandler::new()),
    )
    .unwrap();

    let (tx, events) = mpsc::unbounded_channel();
    engine.on_event(Arc::new(move |event: RecognitionEvent| {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(event);
        }) as Pin<Box<dyn Future<Output = ()> + Send>>
    }));

    Client {
        engine,
        writer: source.writer(),
        source,
        events,
    }
}

fn drain(events: &mut mpsc::UnboundedReceiver<RecognitionEvent>) -> Vec<RecognitionEvent> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}

async fn wait_for<F>(
    events: &mut mpsc::UnboundedReceiver<RecognitionEvent>,
    matches: F,
) -> RecognitionEvent
where
    F: Fn(&RecognitionEvent) -> bool,
{
    loop {
        let event = timeout(STEP_TIMEOUT, events.recv())
            .await
            .expect("timed out waiting for an event")
            .expect("event stream ended");
        if matches(&event) {
            return event;
        }
    }
}

/// Consume `speech.config` and `speech.context`; returns the request id.
async fn expect_preamble(server: &mut MockServerConnection) -> String {
    let config = server.expect_path(paths::SPEECH_CONFIG).await;
    let context = server.expect_path(paths::SPEECH_CONTEXT).await;
    assert_eq!(config.request_id, context.request_id);
    context.request_id
}

async fn expect_audio(server: &mut MockServerConnection, expected: &[u8]) {
    let audio = server.expect_path(paths::AUDIO).await;
    match &audio.body {
        MessageBody::Binary(data) => assert_eq!(data.as_ref(), expected),
        MessageBody::Text(text) => panic!("audio sent as text: {text}"),
    }
}

fn chunk(fill: u8) -> Vec<u8> {
    vec![fill; CHUNK]
}

// =============================================================================
// Single shot
// =============================================================================

#[tokio::test]
async fn test_recognize_once_returns_phrase() {
    let mut service = MockService::new(&[]);
    let auth = CountingAuth::new();
    let mut client = client(&service, auth.clone());

    for fill in 1..=3 {
        client.writer.write(chunk(fill)).unwrap();
    }
    client.writer.close();

    let engine = client.engine.clone();
    let recognition = tokio::spawn(async move { engine.recognize_once().await });

    let mut server = service.next_connection().await;
    assert_eq!(server.header("Ocp-Apim-Subscription-Key"), Some("test-key"));
    assert!(server.connection_id().is_some());

    let request_id = expect_preamble(&mut server).await;
    for fill in 1..=3 {
        expect_audio(&mut server, &chunk(fill)).await;
    }
    expect_audio(&mut server, &[]).await;

    server.send_text(paths::TURN_START, &request_id, r#"{"context":{"serviceTag":"tag"}}"#);
    server.send_text(paths::SPEECH_HYPOTHESIS, &request_id, &hypothesis("hel", 0, 500_000));
    server.send_text(
        paths::SPEECH_PHRASE,
        &request_id,
        &simple_phrase("Success", "hello", 0, 900_000),
    );
    server.send_text(paths::TURN_END, &request_id, "");

    let result = timeout(STEP_TIMEOUT, recognition)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(result.reason, ResultReason::RecognizedSpeech);
    assert_eq!(result.text, "hello");
    assert_eq!(result.duration, 900_000);

    let events = drain(&mut client.events);
    assert!(matches!(events.first(), Some(RecognitionEvent::SessionStarted { .. })));
    assert!(matches!(events.last(), Some(RecognitionEvent::SessionStopped { .. })));

    let recognized: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            RecognitionEvent::Recognized { result, .. } => Some(result.text.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(recognized, vec!["hello"]);
    assert!(events.iter().any(|event| matches!(
        event,
        RecognitionEvent::Recognizing { result, .. } if result.text == "hel"
    )));

    // The audio ended inside the turn, so the turn end also reports the end
    // of the stream.
    for event in &events {
        if let RecognitionEvent::Canceled { result, .. } = event {
            let details = result.cancellation.as_ref().unwrap();
            assert_eq!(details.reason, CancellationReason::EndOfStream);
            assert_eq!(details.error_code, CancellationErrorCode::NoError);
        }
    }

    assert_eq!(auth.fetches.load(Ordering::SeqCst), 1);
    assert_eq!(auth.refreshes.load(Ordering::SeqCst), 0);
    client.engine.close().await;
}

#[tokio::test]
async fn test_messages_for_other_requests_are_ignored() {
    let mut service = MockService::new(&[]);
    let mut config = RecognizerConfig::new("westus", "en-US");
    config.telemetry_enabled = true;
    let mut client = client_with_config(&service, CountingAuth::new(), config);
    client.writer.write(chunk(1)).unwrap();
    client.writer.close();

    let engine = client.engine.clone();
    let recognition = tokio::spawn(async move { engine.recognize_once().await });

    let mut first = service.next_connection().await;
    let request_id = expect_preamble(&mut first).await;
    expect_audio(&mut first, &chunk(1)).await;
    expect_audio(&mut first, &[]).await;

    // Would confirm all buffered audio if it were accepted.
    first.send_text(
        paths::SPEECH_PHRASE,
        "0000000000000000000000000000000A",
        &simple_phrase("Success", "stale", 0, 1_000_000),
    );
    drop(first);

    // Nothing was confirmed, so the whole chunk is replayed.
    let mut second = service.next_connection().await;
    assert_eq!(expect_preamble(&mut second).await, request_id);
    expect_audio(&mut second, &chunk(1)).await;
    expect_audio(&mut second, &[]).await;

    // Request ids compare case-insensitively.
    let lowercase = request_id.to_ascii_lowercase();
    second.send_text(paths::TURN_START, &lowercase, "{}");
    second.send_text(
        paths::SPEECH_PHRASE,
        &lowercase,
        &simple_phrase("Success", "fresh", 0, 100),
    );
    second.send_text(paths::TURN_END, &lowercase, "");

    // Only messages for this request are counted.
    let telemetry = second.expect_path(paths::TELEMETRY).await;
    let body: serde_json::Value = match &telemetry.body {
        MessageBody::Text(text) => serde_json::from_str(text).unwrap(),
        MessageBody::Binary(_) => panic!("telemetry sent as binary"),
    };
    let phrases = body["ReceivedMessages"][paths::SPEECH_PHRASE]
        .as_array()
        .expect("speech.phrase timestamps");
    assert_eq!(phrases.len(), 1);

    let result = timeout(STEP_TIMEOUT, recognition)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(result.text, "fresh");
    assert_eq!(result.offset, 0);

    let texts: Vec<_> = drain(&mut client.events)
        .into_iter()
        .filter_map(|event| match event {
            RecognitionEvent::Recognized { result, .. } => Some(result.text),
            _ => None,
        })
        .collect();
    assert_eq!(texts, vec!["fresh".to_string()]);
}

// =============================================================================
// Reconnect and replay
// =============================================================================

#[tokio::test]
async fn test_dropped_connection_reconnects_and_replays_audio() {
    let mut service = MockService::new(&[200, 403, 200]);
    let auth = CountingAuth::new();
    let mut client = client(&service, auth.clone());

    client.writer.write(chunk(1)).unwrap();
    client.writer.write(chunk(2)).unwrap();

    let engine = client.engine.clone();
    let recognition = tokio::spawn(async move { engine.recognize_once().await });

    let mut first = service.next_connection().await;
    let request_id = expect_preamble(&mut first).await;
    expect_audio(&mut first, &chunk(1)).await;
    expect_audio(&mut first, &chunk(2)).await;
    let connection_id = first.connection_id().map(str::to_string);
    drop(first);

    // The 403 handshake never produces a server connection.
    let mut second = service.next_connection().await;
    assert_eq!(second.connection_id().map(str::to_string), connection_id);
    assert_eq!(expect_preamble(&mut second).await, request_id);

    client.writer.write(chunk(3)).unwrap();
    client.writer.close();

    expect_audio(&mut second, &chunk(1)).await;
    expect_audio(&mut second, &chunk(2)).await;
    expect_audio(&mut second, &chunk(3)).await;
    expect_audio(&mut second, &[]).await;

    second.send_text(paths::TURN_START, &request_id, "{}");
    second.send_text(
        paths::SPEECH_PHRASE,
        &request_id,
        &simple_phrase("Success", "hello again", 0, 900_000),
    );
    second.send_text(paths::TURN_END, &request_id, "");

    let result = timeout(STEP_TIMEOUT, recognition)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(result.reason, ResultReason::RecognizedSpeech);
    assert_eq!(result.text, "hello again");

    assert_eq!(service.opens(), 3);
    assert_eq!(auth.refreshes.load(Ordering::SeqCst), 1);
    // Replayed audio comes from the buffer, not the source.
    assert_eq!(client.source.chunks_read(), 3);

    let requests = service.requests();
    assert!(requests.iter().all(|request| {
        request
            .headers
            .iter()
            .any(|(name, _)| name == headers::CONNECTION_ID)
    }));
}

#[tokio::test]
async fn test_drop_after_end_of_audio_replays_on_new_connection() {
    let mut service = MockService::new(&[]);
    let mut client = client(&service, CountingAuth::new());
    client.writer.write(chunk(1)).unwrap();
    client.writer.close();

    let engine = client.engine.clone();
    let recognition = tokio::spawn(async move { engine.recognize_once().await });

    let mut first = service.next_connection().await;
    let request_id = expect_preamble(&mut first).await;
    expect_audio(&mut first, &chunk(1)).await;
    expect_audio(&mut first, &[]).await;
    drop(first);

    // The upload has finished, yet the new connection still gets the
    // unconfirmed audio and the end marker.
    let mut second = service.next_connection().await;
    assert_eq!(expect_preamble(&mut second).await, request_id);
    expect_audio(&mut second, &chunk(1)).await;
    expect_audio(&mut second, &[]).await;

    second.send_text(paths::TURN_START, &request_id, "{}");
    second.send_text(
        paths::SPEECH_PHRASE,
        &request_id,
        &simple_phrase("Success", "late", 0, 31_250),
    );
    second.send_text(paths::TURN_END, &request_id, "");

    let result = timeout(STEP_TIMEOUT, recognition)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(result.reason, ResultReason::RecognizedSpeech);
    assert_eq!(result.text, "late");
    assert_eq!(service.opens(), 2);
    assert_eq!(client.source.chunks_read(), 1);

    let events = drain(&mut client.events);
    assert!(matches!(events.last(), Some(RecognitionEvent::SessionStopped { .. })));
    client.engine.close().await;
}

#[tokio::test]
async fn test_exhausted_retries_cancel_with_connection_failure() {
    let service = MockService::new(&[500, 500, 500, 500, 500]);
    let mut client = client(&service, CountingAuth::new());
    client.writer.write(chunk(1)).unwrap();

    let result = timeout(STEP_TIMEOUT, client.engine.recognize_once())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(result.reason, ResultReason::Canceled);
    let details = result.cancellation.unwrap();
    assert_eq!(details.reason, CancellationReason::Error);
    assert_eq!(details.error_code, CancellationErrorCode::ConnectionFailure);
    assert!(
        details
            .error_details
            .contains("Unable to contact server. StatusCode: 500")
    );
    // One first attempt plus four retries.
    assert_eq!(service.opens(), 5);

    let canceled = wait_for(&mut client.events, |event| {
        matches!(event, RecognitionEvent::Canceled { .. })
    })
    .await;
    assert!(matches!(canceled, RecognitionEvent::Canceled { .. }));
}

#[tokio::test]
async fn test_invalid_payload_close_cancels_without_reconnect() {
    let mut service = MockService::new(&[]);
    let client = client(&service, CountingAuth::new());

    let engine = client.engine.clone();
    let recognition = tokio::spawn(async move { engine.recognize_once().await });

    let mut server = service.next_connection().await;
    expect_preamble(&mut server).await;
    server.close(1007, "Invalid payload");

    let result = timeout(STEP_TIMEOUT, recognition)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(result.reason, ResultReason::Canceled);
    let details = result.cancellation.unwrap();
    assert_eq!(details.error_code, CancellationErrorCode::BadRequestParameters);
    assert!(details.error_details.contains("1007"));
    assert_eq!(service.opens(), 1);
}

// =============================================================================
// Continuous
// =============================================================================

#[tokio::test]
async fn test_continuous_recognition_spans_turns() {
    let mut service = MockService::new(&[]);
    let mut client = client(&service, CountingAuth::new());

    // 100 ms of audio per chunk at 32000 bytes per second.
    let first_chunk = vec![1u8; 3_200];
    let second_chunk = vec![2u8; 3_200];
    client.writer.write(first_chunk.clone()).unwrap();
    client.engine.start_continuous().await.unwrap();
    assert!(client.engine.is_recognizing());

    let mut server = service.next_connection().await;
    let first_request = expect_preamble(&mut server).await;
    expect_audio(&mut server, &first_chunk).await;

    server.send_text(paths::TURN_START, &first_request, "{}");
    server.send_text(paths::SPEECH_START_DETECTED, &first_request, r#"{"Offset":0}"#);
    server.send_text(
        paths::SPEECH_PHRASE,
        &first_request,
        &simple_phrase("Success", "one", 0, 1_000_000),
    );
    server.send_text(paths::SPEECH_END_DETECTED, &first_request, r#"{"Offset":1000000}"#);
    server.send_text(paths::TURN_END, &first_request, "");

    // The next turn opens with a new request id.
    let context = server.expect_path(paths::SPEECH_CONTEXT).await;
    let second_request = context.request_id;
    assert_ne!(second_request, first_request);

    client.writer.write(second_chunk.clone()).unwrap();
    client.writer.close();
    let audio = server.expect_path(paths::AUDIO).await;
    assert_eq!(audio.request_id, second_request);
    assert_eq!(audio.binary_body().unwrap().as_ref(), second_chunk.as_slice());
    expect_audio(&mut server, &[]).await;

    server.send_text(paths::TURN_START, &second_request, "{}");
    server.send_text(
        paths::SPEECH_PHRASE,
        &second_request,
        &simple_phrase("Success", "two", 0, 1_000_000),
    );
    server.send_text(paths::TURN_END, &second_request, "");

    let mut recognized = Vec::new();
    loop {
        let event = wait_for(&mut client.events, |_| true).await;
        match event {
            RecognitionEvent::Recognized { result, .. } => recognized.push(result.text),
            RecognitionEvent::SessionStopped { .. } => break,
            _ => {}
        }
    }
    assert_eq!(recognized, vec!["one".to_string(), "two".to_string()]);

    client.engine.stop_continuous().await.unwrap();
    assert!(!client.engine.is_recognizing());
    client.engine.close().await;
}

#[tokio::test]
async fn test_continuous_offsets_accumulate_across_turns() {
    let mut service = MockService::new(&[]);
    let mut client = client(&service, CountingAuth::new());

    client.writer.write(vec![1u8; 3_200]).unwrap();
    client.engine.start_continuous().await.unwrap();

    let mut server = service.next_connection().await;
    let first_request = expect_preamble(&mut server).await;
    server.expect_path(paths::AUDIO).await;

    server.send_text(paths::TURN_START, &first_request, "{}");
    server.send_text(
        paths::SPEECH_PHRASE,
        &first_request,
        &simple_phrase("Success", "one", 0, 1_000_000),
    );
    server.send_text(paths::SPEECH_END_DETECTED, &first_request, r#"{"Offset":1000000}"#);
    server.send_text(paths::TURN_END, &first_request, "");
    let second_request = server.expect_path(paths::SPEECH_CONTEXT).await.request_id;

    server.send_text(paths::TURN_START, &second_request, "{}");
    server.send_text(
        paths::SPEECH_PHRASE,
        &second_request,
        &simple_phrase("Success", "two", 500, 1_000_000),
    );

    let mut offsets = Vec::new();
    while offsets.len() < 2 {
        if let RecognitionEvent::Recognized { result, .. } = wait_for(&mut client.events, |event| {
            matches!(event, RecognitionEvent::Recognized { .. })
        })
        .await
        {
            offsets.push((result.text, result.offset));
        }
    }
    assert_eq!(
        offsets,
        vec![("one".to_string(), 0), ("two".to_string(), 1_000_500)]
    );

    client.engine.stop_continuous().await.unwrap();
    client.engine.close().await;
}

#[tokio::test]
async fn test_second_recognition_while_running_is_rejected() {
    let service = MockService::new(&[]);
    let client = client(&service, CountingAuth::new());

    client.engine.start_continuous().await.unwrap();
    assert!(client.engine.start_continuous().await.is_err());

    client.engine.stop_continuous().await.unwrap();
    client.engine.close().await;
    assert!(client.engine.start_continuous().await.is_err());
}
