//! RVL depth compression
//!
//! Lossless run-length / variable-length coding of 16-bit depth samples.
//! The stream alternates a zero-run length and a nonzero-run length; nonzero
//! samples are stored as zigzagged deltas from the previous nonzero sample.
//! Every integer is written as 3-bit groups with a continuation bit, packed
//! most-significant nibble first into little-endian `u32` words.

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RvlError {
    #[error("stream ended after {decoded} of {expected} samples")]
    Truncated { decoded: usize, expected: usize },

    #[error("run of {run} samples overflows the {expected}-sample frame")]
    Overrun { run: usize, expected: usize },

    #[error("variable-length integer exceeds 32 bits")]
    IntegerTooLong,

    #[error("sample {index} decodes to {value}, outside the 16-bit depth range")]
    SampleOutOfRange { index: usize, value: i64 },
}

struct NibbleWriter {
    words: Vec<u32>,
    word: u32,
    nibbles: u32,
}

impl NibbleWriter {
    fn new() -> Self {
        Self {
            words: Vec::new(),
            word: 0,
            nibbles: 0,
        }
    }

    fn write_vle(&mut self, mut value: u32) {
        loop {
            let mut nibble = value & 0x7;
            value >>= 3;
            if value != 0 {
                nibble |= 0x8;
            }
            self.word = (self.word << 4) | nibble;
            self.nibbles += 1;
            if self.nibbles == 8 {
                self.words.push(self.word);
                self.word = 0;
                self.nibbles = 0;
            }
            if value == 0 {
                break;
            }
        }
    }

    fn finish(mut self) -> Vec<u8> {
        if self.nibbles > 0 {
            self.word <<= 4 * (8 - self.nibbles);
            self.words.push(self.word);
        }
        self.words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }
}

struct NibbleReader<'a> {
    input: &'a [u8],
    word: u32,
    nibbles_left: u32,
}

impl<'a> NibbleReader<'a> {
    fn new(input: &'a [u8]) -> Self {
        Self {
            input,
            word: 0,
            nibbles_left: 0,
        }
    }

    fn next_word(&mut self) -> Option<u32> {
        if self.input.is_empty() {
            return None;
        }
        // A trailing partial word is zero-padded
        let mut buf = [0u8; 4];
        let n = self.input.len().min(4);
        buf[..n].copy_from_slice(&self.input[..n]);
        self.input = &self.input[n..];
        Some(u32::from_le_bytes(buf))
    }

    fn read_vle(&mut self) -> Option<Result<u32, RvlError>> {
        let mut value: u32 = 0;
        let mut shift: u32 = 0;
        loop {
            if self.nibbles_left == 0 {
                self.word = self.next_word()?;
                self.nibbles_left = 8;
            }
            let nibble = self.word >> 28;
            self.word <<= 4;
            self.nibbles_left -= 1;

            if shift > 29 {
                return Some(Err(RvlError::IntegerTooLong));
            }
            value |= (nibble & 0x7) << shift;
            shift += 3;

            if nibble & 0x8 == 0 {
                return Some(Ok(value));
            }
        }
    }
}

/// Compress depth samples into an RVL stream
pub fn encode(samples: &[u16]) -> Vec<u8> {
    let mut writer = NibbleWriter::new();
    let mut previous: i32 = 0;
    let mut i = 0;

    while i < samples.len() {
        let zeros = samples[i..].iter().take_while(|&&s| s == 0).count();
        writer.write_vle(zeros as u32);
        i += zeros;

        let nonzeros = samples[i..].iter().take_while(|&&s| s != 0).count();
        writer.write_vle(nonzeros as u32);

        for &sample in &samples[i..i + nonzeros] {
            let current = sample as i32;
            let delta = current - previous;
            let zigzag = ((delta << 1) ^ (delta >> 31)) as u32;
            writer.write_vle(zigzag);
            previous = current;
        }
        i += nonzeros;
    }

    writer.finish()
}

/// Decompress exactly `num_samples` depth samples from an RVL stream
pub fn decode(input: &[u8], num_samples: usize) -> Result<Vec<u16>, RvlError> {
    let mut reader = NibbleReader::new(input);
    // Zero runs grow the buffer as they decode; nonzero samples need a nibble each
    let mut output = Vec::with_capacity(num_samples.min(input.len().saturating_mul(2)));
    let mut previous: i32 = 0;

    let truncated = |decoded: usize| RvlError::Truncated {
        decoded,
        expected: num_samples,
    };

    while output.len() < num_samples {
        let zeros = reader.read_vle().ok_or_else(|| truncated(output.len()))?? as usize;
        if output.len() + zeros > num_samples {
            return Err(RvlError::Overrun {
                run: zeros,
                expected: num_samples,
            });
        }
        output.resize(output.len() + zeros, 0);

        if output.len() == num_samples {
            break;
        }

        let nonzeros = reader.read_vle().ok_or_else(|| truncated(output.len()))?? as usize;
        if output.len() + nonzeros > num_samples {
            return Err(RvlError::Overrun {
                run: nonzeros,
                expected: num_samples,
            });
        }

        for _ in 0..nonzeros {
            let zigzag = reader.read_vle().ok_or_else(|| truncated(output.len()))??;
            let delta = (zigzag >> 1) as i32 ^ -((zigzag & 1) as i32);
            let index = output.len();
            let current = previous
                .checked_add(delta)
                .filter(|v| (0..=u16::MAX as i32).contains(v))
                .ok_or(RvlError::SampleOutOfRange {
                    index,
                    value: previous as i64 + delta as i64,
                })?;
            output.push(current as u16);
            previous = current;
        }
    }

    Ok(output)
}
