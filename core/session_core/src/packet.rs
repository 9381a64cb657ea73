//! Host media packets
//!
//! Same framing as ACDS traffic, with a 4 MB cap to fit raw video frames.
//!
//! ```text
//! participant -> host: ImageFrame, AudioOpusBatch, StreamStart/Stop, Ping, ClientLeave
//! host -> participant: Welcome, AsciiFrame, AudioMix, SettingsUpdate, Pong
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::framing::{self, DecodeError, EncodeError};

/// Maximum media packet payload (4 MB)
pub const MAX_PACKET_SIZE: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamKind {
    Video,
    Audio,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Packet {
    /// RGB24 frame
    ImageFrame {
        width: u32,
        height: u32,
        pixels: Vec<u8>,
    },
    /// Several encoded audio frames back to back
    AudioOpusBatch {
        sample_rate: u32,
        frame_duration_ms: u16,
        frame_count: u16,
        frame_sizes: Vec<u16>,
        data: Vec<u8>,
    },
    StreamStart {
        kind: StreamKind,
    },
    StreamStop {
        kind: StreamKind,
    },
    Ping,
    Pong,
    ClientLeave,

    Welcome {
        client_id: u32,
    },
    AsciiFrame {
        text: String,
    },
    AudioMix {
        sample_rate: u32,
        data: Vec<u8>,
    },
    /// Encoded `SessionSettings` (64 bytes)
    SettingsUpdate {
        settings: Vec<u8>,
    },
}

impl Packet {
    /// Bundle encoded frames into one batch packet
    pub fn audio_batch(
        sample_rate: u32,
        frame_duration_ms: u16,
        frames: &[Vec<u8>],
    ) -> Result<Self> {
        let frame_count = u16::try_from(frames.len())
            .map_err(|_| Error::InvalidParam("too many frames in batch".to_string()))?;
        let mut frame_sizes = Vec::with_capacity(frames.len());
        let mut data = Vec::new();
        for frame in frames {
            let size = u16::try_from(frame.len())
                .map_err(|_| Error::InvalidParam("audio frame too large".to_string()))?;
            frame_sizes.push(size);
            data.extend_from_slice(frame);
        }
        Ok(Packet::AudioOpusBatch {
            sample_rate,
            frame_duration_ms,
            frame_count,
            frame_sizes,
            data,
        })
    }
}

/// Split a batch payload into its sub-frames
pub fn split_audio_batch<'a>(
    frame_count: u16,
    frame_sizes: &[u16],
    data: &'a [u8],
) -> Result<Vec<&'a [u8]>> {
    if frame_sizes.len() != frame_count as usize {
        return Err(Error::NetworkProtocol(format!(
            "audio batch declares {} frames but lists {} sizes",
            frame_count,
            frame_sizes.len()
        )));
    }

    let total: usize = frame_sizes.iter().map(|&s| s as usize).sum();
    if total != data.len() {
        return Err(Error::NetworkProtocol(format!(
            "audio batch sizes sum to {} but payload is {} bytes",
            total,
            data.len()
        )));
    }

    let mut frames = Vec::with_capacity(frame_sizes.len());
    let mut offset = 0;
    for &size in frame_sizes {
        let end = offset + size as usize;
        frames.push(&data[offset..end]);
        offset = end;
    }
    Ok(frames)
}

pub fn encode_packet(packet: &Packet) -> std::result::Result<Vec<u8>, EncodeError> {
    framing::encode_frame(packet, MAX_PACKET_SIZE)
}

pub fn decode_packet(buf: &[u8]) -> std::result::Result<(Packet, usize), DecodeError> {
    framing::decode_frame(buf, MAX_PACKET_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_batch_split() {
        let frames = vec![vec![1u8, 2, 3], vec![], vec![4u8; 10]];
        let packet = Packet::audio_batch(48_000, 20, &frames).unwrap();

        match &packet {
            Packet::AudioOpusBatch {
                frame_count,
                frame_sizes,
                data,
                ..
            } => {
                let split = split_audio_batch(*frame_count, frame_sizes, data).unwrap();
                assert_eq!(split.len(), 3);
                assert_eq!(split[0], &[1, 2, 3]);
                assert!(split[1].is_empty());
                assert_eq!(split[2], &[4u8; 10][..]);
            }
            other => panic!("Expected AudioOpusBatch, got {:?}", other),
        }
    }

    #[test]
    fn test_audio_batch_inconsistent_sizes() {
        assert!(split_audio_batch(2, &[3], &[0, 0, 0]).is_err());
        assert!(split_audio_batch(1, &[4], &[0, 0, 0]).is_err());
    }

    #[test]
    fn test_large_frame_fits() {
        let packet = Packet::ImageFrame {
            width: 640,
            height: 480,
            pixels: vec![0x80; 640 * 480 * 3],
        };
        let encoded = encode_packet(&packet).unwrap();
        let (decoded, used) = decode_packet(&encoded).unwrap();
        assert_eq!(used, encoded.len());
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let packet = Packet::ImageFrame {
            width: 2000,
            height: 1000,
            pixels: vec![0; MAX_PACKET_SIZE],
        };
        assert!(encode_packet(&packet).is_err());
    }
}
