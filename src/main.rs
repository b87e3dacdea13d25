use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::anyhow;
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::Notify;
use tracing::info;
use tracing_subscriber::EnvFilter;

use waav_speech_client::{
    Authentication, ClientConfig, IntentHandler, IssueTokenAuth, RecognitionEngine,
    RecognitionEvent, RecognitionModeHandler, SpeechHandler, SubscriptionKeyAuth,
    TranslationHandler, WavFileSource, WebSocketTransport,
};

/// WaaV Speech - streaming speech recognition client
#[derive(Parser, Debug)]
#[command(name = "waav-speech")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Subcommand to run
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Recognize speech from a WAV file
    Recognize {
        /// 16-bit PCM WAV file
        #[arg(short = 'f', long = "file", value_name = "FILE")]
        file: PathBuf,

        /// Keep recognizing until the file ends or ctrl-c
        #[arg(long)]
        continuous: bool,

        #[arg(short = 'm', long = "mode", value_enum, default_value_t = Mode::Speech)]
        mode: Mode,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Mode {
    Speech,
    Intent,
    Translation,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if it exists (must be done before config loading)
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Initialize crypto provider for TLS connections
    // This must be done before any TLS connections are attempted
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install default crypto provider"))?;

    let cli = Cli::parse();

    let config = if let Some(config_path) = cli.config {
        info!("Loading configuration from {}", config_path.display());
        ClientConfig::from_file(&config_path).map_err(|e| anyhow!(e.to_string()))?
    } else {
        ClientConfig::from_env().map_err(|e| anyhow!(e.to_string()))?
    };

    match cli.command {
        Commands::Recognize {
            file,
            continuous,
            mode,
        } => recognize(config, file, continuous, mode).await,
    }
}

async fn recognize(
    config: ClientConfig,
    file: PathBuf,
    continuous: bool,
    mode: Mode,
) -> anyhow::Result<()> {
    let authentication: Arc<dyn Authentication> = if config.use_issued_token {
        Arc::new(IssueTokenAuth::new(config.subscription_key.clone(), &config.region)?)
    } else {
        Arc::new(SubscriptionKeyAuth::new(config.subscription_key.clone())?)
    };

    let handler: Box<dyn RecognitionModeHandler> = match mode {
        Mode::Speech => Box::new(SpeechHandler::new()),
        Mode::Intent => {
            let intent = config.intent.clone().ok_or_else(|| {
                anyhow!("Intent mode needs SPEECH_INTENT_APP_ID and SPEECH_INTENT_KEY")
            })?;
            let mut handler = IntentHandler::new(intent.app_id, intent.key);
            handler.add_all_intents(None);
            Box::new(handler)
        }
        Mode::Translation => Box::new(TranslationHandler::new(
            config.translation.target_languages.clone(),
            config.translation.voice.clone(),
        )?),
    };

    let source = Arc::new(WavFileSource::open(&file)?);
    let engine = RecognitionEngine::new(
        config.recognizer_config(),
        authentication,
        Arc::new(WebSocketTransport::new()),
        source,
        handler,
    )?;

    let stopped = Arc::new(Notify::new());
    let notify = stopped.clone();
    engine.on_event(Arc::new(move |event: RecognitionEvent| {
        let notify = notify.clone();
        Box::pin(async move {
            print_event(&event);
            if matches!(event, RecognitionEvent::SessionStopped { .. }) {
                notify.notify_one();
            }
        }) as Pin<Box<dyn Future<Output = ()> + Send>>
    }));

    if continuous {
        engine.start_continuous().await?;
        tokio::select! {
            _ = stopped.notified() => info!("Audio file finished"),
            _ = tokio::signal::ctrl_c() => info!("Interrupted"),
        }
        engine.stop_continuous().await?;
    } else {
        let result = engine.recognize_once().await?;
        println!("{:?}: {}", result.reason, result.text);
        if let Some(cancellation) = &result.cancellation {
            println!(
                "  canceled: {:?} {:?} {}",
                cancellation.reason, cancellation.error_code, cancellation.error_details
            );
        }
    }

    engine.close().await;
    Ok(())
}

fn print_event(event: &RecognitionEvent) {
    match event {
        RecognitionEvent::SessionStarted { session_id } => info!(%session_id, "Session started"),
        RecognitionEvent::SessionStopped { session_id } => info!(%session_id, "Session stopped"),
        RecognitionEvent::SpeechStartDetected { offset, .. } => info!(offset, "Speech started"),
        RecognitionEvent::SpeechEndDetected { offset, .. } => info!(offset, "Speech ended"),
        RecognitionEvent::Recognizing { result, .. } => println!("RECOGNIZING: {}", result.text),
        RecognitionEvent::Recognized { result, .. } => {
            println!("RECOGNIZED: {}", result.text);
            for (language, text) in &result.translations {
                println!("  [{language}] {text}");
            }
            if let Some(intent_id) = &result.intent_id {
                println!("  intent: {intent_id}");
            }
        }
        RecognitionEvent::Canceled { result, .. } => {
            if let Some(cancellation) = &result.cancellation {
                println!(
                    "CANCELED: {:?} {:?} {}",
                    cancellation.reason, cancellation.error_code, cancellation.error_details
                );
            }
        }
        RecognitionEvent::Synthesizing {
            audio, completed, ..
        } => info!(bytes = audio.len(), completed, "Synthesized audio"),
    }
}
