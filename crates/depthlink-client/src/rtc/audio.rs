use async_trait::async_trait;
use depthlink_media::{VoiceEncoder, FRAME_SIZE, SAMPLE_RATE};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use webrtc::api::media_engine::MIME_TYPE_OPUS;
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use super::RtcError;

const FRAME_DURATION: Duration =
    Duration::from_micros(FRAME_SIZE as u64 * 1_000_000 / SAMPLE_RATE as u64);

/// Source of 48 kHz mono PCM frames of [`FRAME_SIZE`] samples
#[async_trait]
pub trait MicrophoneSource: Send + Sync {
    async fn open(&self) -> anyhow::Result<mpsc::Receiver<Vec<i16>>>;
}

/// No capture device; opening always fails
pub struct NoMicrophone;

#[async_trait]
impl MicrophoneSource for NoMicrophone {
    async fn open(&self) -> anyhow::Result<mpsc::Receiver<Vec<i16>>> {
        anyhow::bail!("no capture device configured")
    }
}

/// Plays a raw s16le capture in a loop at real-time pace
pub struct PcmFileMicrophone {
    path: PathBuf,
}

impl PcmFileMicrophone {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl MicrophoneSource for PcmFileMicrophone {
    async fn open(&self) -> anyhow::Result<mpsc::Receiver<Vec<i16>>> {
        let raw = tokio::fs::read(&self.path).await?;
        let samples: Vec<i16> = raw
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        if samples.len() < FRAME_SIZE {
            anyhow::bail!("{} holds less than one frame", self.path.display());
        }
        tracing::info!(
            "Using {} as microphone ({} frames)",
            self.path.display(),
            samples.len() / FRAME_SIZE
        );

        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(FRAME_DURATION);
            for frame in samples.chunks_exact(FRAME_SIZE).cycle() {
                ticker.tick().await;
                if tx.send(frame.to_vec()).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }
}

/// Outbound voice: microphone frames, gain, Opus, one shared local track.
///
/// Starts muted. While muted, captured frames are discarded.
pub struct VoiceTrack {
    track: Arc<TrackLocalStaticSample>,
    muted: Arc<AtomicBool>,
    pump: JoinHandle<()>,
}

impl VoiceTrack {
    pub async fn start(source: &dyn MicrophoneSource) -> Result<Self, RtcError> {
        let mut frames = source
            .open()
            .await
            .map_err(|e| RtcError::Microphone(e.to_string()))?;
        let mut encoder = VoiceEncoder::new().map_err(|e| RtcError::Microphone(e.to_string()))?;

        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                ..Default::default()
            },
            "audio".to_owned(),
            "depthlink-voice".to_owned(),
        ));
        let muted = Arc::new(AtomicBool::new(true));

        let pump = {
            let track = track.clone();
            let muted = muted.clone();
            tokio::spawn(async move {
                while let Some(pcm) = frames.recv().await {
                    if muted.load(Ordering::Relaxed) {
                        continue;
                    }
                    let packet = match encoder.encode(&pcm) {
                        Ok(packet) => packet,
                        Err(e) => {
                            tracing::warn!("Failed to encode voice frame: {}", e);
                            continue;
                        }
                    };
                    let sample = Sample {
                        data: packet,
                        duration: FRAME_DURATION,
                        ..Default::default()
                    };
                    if let Err(e) = track.write_sample(&sample).await {
                        tracing::debug!("Voice sample not written: {}", e);
                    }
                }
                tracing::info!("Microphone stream ended");
            })
        };

        Ok(Self { track, muted, pump })
    }

    pub fn track(&self) -> Arc<TrackLocalStaticSample> {
        self.track.clone()
    }

    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }
}

impl Drop for VoiceTrack {
    fn drop(&mut self) {
        self.pump.abort();
    }
}
