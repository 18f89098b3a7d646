// AUDIO CODECS - PCM and MP3 decoders for the audio task
//
// Both report how many input bytes each call used so the audio task can walk
// a chunk holding several codec frames.

use crate::avi_demux::AudioFormat;
use crate::decode::{AudioDecoder, DecodeError, DecodedAudio};

/// WAVE_FORMAT_PCM
pub const FORMAT_PCM: u16 = 0x0001;
/// WAVE_FORMAT_MPEGLAYER3
pub const FORMAT_MP3: u16 = 0x0055;

/// Pick a decoder for the container's audio format.
pub fn decoder_for(format: &AudioFormat) -> Result<Box<dyn AudioDecoder>, DecodeError> {
    match format.format_tag {
        FORMAT_PCM => Ok(Box::new(PcmDecoder::new(format)?)),
        #[cfg(feature = "audio")]
        FORMAT_MP3 => Ok(Box::new(Mp3Decoder::new()?)),
        other => Err(DecodeError::Unsupported(format!(
            "audio format tag 0x{:04x}",
            other
        ))),
    }
}

// ============================================================================
// PCM
// ============================================================================

/// Sample frames produced per call; bigger chunks take several calls.
const PCM_FRAMES_PER_BLOCK: usize = 2048;

/// Uncompressed little-endian PCM, 8-bit unsigned or 16-bit signed.
pub struct PcmDecoder {
    sample_rate: u32,
    channels: u16,
    bytes_per_sample: usize,
    out: Vec<i16>,
}

impl PcmDecoder {
    pub fn new(format: &AudioFormat) -> Result<Self, DecodeError> {
        let bytes_per_sample = match format.bits_per_sample {
            8 => 1,
            16 => 2,
            bits => {
                return Err(DecodeError::Unsupported(format!(
                    "{}-bit PCM",
                    bits
                )))
            }
        };
        if format.channels == 0 || format.sample_rate == 0 {
            return Err(DecodeError::Unsupported(format!(
                "PCM {} Hz x {} channels",
                format.sample_rate, format.channels
            )));
        }
        Ok(Self {
            sample_rate: format.sample_rate,
            channels: format.channels,
            bytes_per_sample,
            out: Vec::with_capacity(PCM_FRAMES_PER_BLOCK * format.channels as usize),
        })
    }

    fn frame_bytes(&self) -> usize {
        self.bytes_per_sample * self.channels as usize
    }
}

impl AudioDecoder for PcmDecoder {
    fn decode(&mut self, input: &[u8]) -> Result<DecodedAudio<'_>, DecodeError> {
        let frame_bytes = self.frame_bytes();
        let frames = (input.len() / frame_bytes).min(PCM_FRAMES_PER_BLOCK);
        if frames == 0 {
            return Err(DecodeError::Audio {
                consumed: 0,
                reason: format!("{} trailing bytes, less than one frame", input.len()),
            });
        }

        let consumed = frames * frame_bytes;
        self.out.clear();
        match self.bytes_per_sample {
            1 => self
                .out
                .extend(input[..consumed].iter().map(|&b| ((b as i16) - 128) << 8)),
            _ => self.out.extend(
                input[..consumed]
                    .chunks_exact(2)
                    .map(|s| i16::from_le_bytes([s[0], s[1]])),
            ),
        }

        Ok(DecodedAudio {
            consumed,
            samples: &self.out,
            sample_rate: self.sample_rate,
            channels: self.channels,
        })
    }

    fn name(&self) -> &str {
        "pcm"
    }
}

// ============================================================================
// MP3 frame header
// ============================================================================

/// Layer III frame header fields needed to split a chunk into frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mp3FrameHeader {
    pub sample_rate: u32,
    pub channels: u16,
    pub frame_len: usize,
}

const MP3_BITRATES_V1: [u32; 16] = [
    0, 32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 0,
];
const MP3_BITRATES_V2: [u32; 16] = [
    0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160, 0,
];

/// Parse a Layer III header at the start of `data`.
pub fn parse_mp3_header(data: &[u8]) -> Option<Mp3FrameHeader> {
    if data.len() < 4 || data[0] != 0xFF || data[1] & 0xE0 != 0xE0 {
        return None;
    }

    let version = (data[1] >> 3) & 0x03; // 0 = 2.5, 2 = 2, 3 = 1
    let layer = (data[1] >> 1) & 0x03; // 1 = Layer III
    if version == 1 || layer != 1 {
        return None;
    }

    let bitrate_index = (data[2] >> 4) as usize;
    let rate_index = ((data[2] >> 2) & 0x03) as usize;
    let padding = ((data[2] >> 1) & 0x01) as usize;
    if rate_index == 3 {
        return None;
    }

    let base_rate = [44_100, 48_000, 32_000][rate_index];
    let (sample_rate, kbps, coefficient) = match version {
        3 => (base_rate, MP3_BITRATES_V1[bitrate_index], 144),
        2 => (base_rate / 2, MP3_BITRATES_V2[bitrate_index], 72),
        _ => (base_rate / 4, MP3_BITRATES_V2[bitrate_index], 72),
    };
    if kbps == 0 {
        return None;
    }

    let channels = if data[3] >> 6 == 3 { 1 } else { 2 };
    let frame_len = (coefficient * kbps as usize * 1000) / sample_rate as usize + padding;

    Some(Mp3FrameHeader {
        sample_rate,
        channels,
        frame_len,
    })
}

/// Offset of the first plausible frame header in `data`.
pub fn find_mp3_sync(data: &[u8]) -> Option<usize> {
    (0..data.len().saturating_sub(3)).find(|&i| parse_mp3_header(&data[i..]).is_some())
}

// ============================================================================
// MP3 (symphonia)
// ============================================================================

#[cfg(feature = "audio")]
pub use self::mp3::Mp3Decoder;

#[cfg(feature = "audio")]
mod mp3 {
    use symphonia::core::audio::SampleBuffer;
    use symphonia::core::codecs::{CodecParameters, Decoder, DecoderOptions, CODEC_TYPE_MP3};
    use symphonia::core::formats::Packet;

    use super::{find_mp3_sync, parse_mp3_header};
    use crate::decode::{AudioDecoder, DecodeError, DecodedAudio};

    /// MPEG-1/2 Layer III, one codec frame per call.
    pub struct Mp3Decoder {
        decoder: Box<dyn Decoder>,
        sample_buf: Option<SampleBuffer<i16>>,
        packets: u64,
    }

    impl Mp3Decoder {
        pub fn new() -> Result<Self, DecodeError> {
            let mut params = CodecParameters::new();
            params.for_codec(CODEC_TYPE_MP3);
            let decoder = symphonia::default::get_codecs()
                .make(&params, &DecoderOptions::default())
                .map_err(|e| DecodeError::Unsupported(format!("MP3 decoder: {}", e)))?;
            Ok(Self {
                decoder,
                sample_buf: None,
                packets: 0,
            })
        }
    }

    impl AudioDecoder for Mp3Decoder {
        fn decode(&mut self, input: &[u8]) -> Result<DecodedAudio<'_>, DecodeError> {
            let Some(header) = parse_mp3_header(input) else {
                // Skip to the next sync word, or give up on the chunk.
                let consumed = find_mp3_sync(input).unwrap_or(0);
                return Err(DecodeError::Audio {
                    consumed,
                    reason: "no MP3 frame sync".into(),
                });
            };
            if header.frame_len > input.len() {
                return Err(DecodeError::Audio {
                    consumed: 0,
                    reason: format!(
                        "frame of {} bytes split across chunks ({} left)",
                        header.frame_len,
                        input.len()
                    ),
                });
            }

            let frame = &input[..header.frame_len];
            let packet = Packet::new_from_slice(0, self.packets, 0, frame);
            self.packets += 1;

            let decoded = self.decoder.decode(&packet).map_err(|e| DecodeError::Audio {
                consumed: header.frame_len,
                reason: e.to_string(),
            })?;

            let spec = *decoded.spec();
            let needed = decoded.capacity() as u64;
            let fits = self
                .sample_buf
                .as_ref()
                .is_some_and(|b| b.capacity() as u64 >= needed * spec.channels.count() as u64);
            if !fits {
                self.sample_buf = None;
            }
            let buf = self
                .sample_buf
                .get_or_insert_with(|| SampleBuffer::<i16>::new(needed, spec));
            buf.copy_interleaved_ref(decoded);

            Ok(DecodedAudio {
                consumed: header.frame_len,
                samples: buf.samples(),
                sample_rate: spec.rate,
                channels: spec.channels.count() as u16,
            })
        }

        fn name(&self) -> &str {
            "mp3"
        }

        fn reset(&mut self) {
            self.decoder.reset();
        }
    }
}
