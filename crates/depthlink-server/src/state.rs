use crate::recording::{FfmpegBackend, Ledger, RecorderHandle, RecordingConfig};
use crate::recording::naming::LEDGER_FILE;
use crate::ws::{PeerDirectory, SignallingRelay, StreamRouter};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct Config {
    pub bind_address: String,
    pub output_path: PathBuf,
    pub backpressure_bytes: usize,
    pub recording: RecordingConfig,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(value) => match value.parse() {
            Ok(parsed) => parsed,
            Err(_) => {
                tracing::warn!("Ignoring invalid {}={:?}", key, value);
                default
            }
        },
        Err(_) => default,
    }
}

fn env_millis(key: &str, default: Duration) -> Duration {
    Duration::from_millis(env_or(key, default.as_millis() as u64))
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        // Load from environment variables
        let bind_address =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

        let output_path = PathBuf::from(
            std::env::var("OUTPUT_PATH").unwrap_or_else(|_| "./recordings".to_string()),
        );

        let defaults = RecordingConfig::default();
        let recording = RecordingConfig {
            enabled: env_or("RECORDING_ENABLED", defaults.enabled),
            output_path: output_path.clone(),
            segment_length: env_millis("SEGMENT_LENGTH_MS", defaults.segment_length),
            rollover_grace: env_millis("ROLLOVER_GRACE_MS", defaults.rollover_grace),
            idle_timeout: env_millis("DEVICE_IDLE_TIMEOUT_MS", defaults.idle_timeout),
            stop_timeout: env_millis("ENCODER_STOP_TIMEOUT_MS", defaults.stop_timeout),
            normalize_interval: env_millis("NORMALIZE_INTERVAL_MS", defaults.normalize_interval),
            ffmpeg_path: std::env::var("FFMPEG_PATH").unwrap_or(defaults.ffmpeg_path),
            ffprobe_path: std::env::var("FFPROBE_PATH").unwrap_or(defaults.ffprobe_path),
            encoder_queue: defaults.encoder_queue,
        };

        if recording.segment_length.is_zero() || recording.normalize_interval.is_zero() {
            anyhow::bail!("SEGMENT_LENGTH_MS and NORMALIZE_INTERVAL_MS must be positive");
        }

        Ok(Config {
            bind_address,
            output_path,
            backpressure_bytes: env_or("BACKPRESSURE_BYTES", 10_240),
            recording,
        })
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub directory: Arc<PeerDirectory>,
    pub signalling: Arc<SignallingRelay>,
    pub streams: Arc<StreamRouter>,
    pub ledger: Arc<Ledger>,
    pub recorder: Option<RecorderHandle>,
}

impl AppState {
    pub async fn new(mut config: Config) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&config.output_path).await?;
        config.output_path = tokio::fs::canonicalize(&config.output_path).await?;
        config.recording.output_path = config.output_path.clone();

        let ledger = Arc::new(Ledger::load(config.output_path.join(LEDGER_FILE)).await);
        match ledger.prune().await {
            Ok(0) => {}
            Ok(removed) => tracing::info!("Pruned {} missing paths from the ledger", removed),
            Err(e) => tracing::warn!("Failed to prune ledger: {}", e),
        }

        let recorder = if config.recording.enabled {
            let backend = Arc::new(FfmpegBackend::new(
                config.recording.ffmpeg_path.clone(),
                config.recording.ffprobe_path.clone(),
            ));
            Some(RecorderHandle::spawn(
                config.recording.clone(),
                ledger.clone(),
                backend,
            ))
        } else {
            tracing::info!("Recording disabled");
            None
        };

        let directory = Arc::new(PeerDirectory::new());
        let signalling = Arc::new(SignallingRelay::new(directory.clone()));
        let streams = Arc::new(StreamRouter::new(config.backpressure_bytes, recorder.clone()));

        Ok(Self {
            config,
            directory,
            signalling,
            streams,
            ledger,
            recorder,
        })
    }
}
