use anyhow::Result;
use bytes::Bytes;
use opus::Encoder as OpusEncoder;

/// Audio sample rate of the outbound voice track (48kHz)
pub const SAMPLE_RATE: u32 = 48000;

/// Microphone capture is mono
pub const CHANNELS: usize = 1;

/// Frame size in samples (20ms at 48kHz = 960 samples)
pub const FRAME_SIZE: usize = 960;

/// Fixed amplification applied to microphone audio before encoding
pub const VOICE_GAIN: f32 = 6.0;

/// Multiply samples in place, saturating at the i16 range
pub fn apply_gain(pcm: &mut [i16], gain: f32) {
    for sample in pcm.iter_mut() {
        let amplified = (*sample as f32 * gain).round();
        *sample = amplified.clamp(i16::MIN as f32, i16::MAX as f32) as i16;
    }
}

/// Opus encoder for the outbound voice track.
///
/// Applies [`VOICE_GAIN`] to every frame before encoding.
pub struct VoiceEncoder {
    encoder: OpusEncoder,
    gain: f32,
}

impl VoiceEncoder {
    pub fn new() -> Result<Self> {
        Self::with_gain(VOICE_GAIN)
    }

    pub fn with_gain(gain: f32) -> Result<Self> {
        let encoder = OpusEncoder::new(SAMPLE_RATE, opus::Channels::Mono, opus::Application::Voip)?;

        Ok(Self { encoder, gain })
    }

    pub fn gain(&self) -> f32 {
        self.gain
    }

    /// Amplify and encode one frame of mono PCM audio
    pub fn encode(&mut self, pcm: &[i16]) -> Result<Bytes> {
        let mut amplified = pcm.to_vec();
        apply_gain(&mut amplified, self.gain);

        let mut output = vec![0u8; 4000]; // Max opus packet size
        let len = self.encoder.encode(&amplified, &mut output)?;
        output.truncate(len);
        Ok(Bytes::from(output))
    }
}
