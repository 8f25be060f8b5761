//! In-memory DCA1 clips.
//!
//! songbird plays tracks, not individual packets, so the frames written
//! during one speaking burst are wrapped into a DCA1 container that its
//! DCA reader can pass straight through to the voice connection:
//!
//! ```text
//! "DCA1" [meta_len: i32 LE][meta: JSON] ([len: i16 LE][opus packet])*
//! ```

use std::time::Duration;

use serde_json::json;

use super::VoiceError;
use crate::sound::Frame;

/// Playback time of one opus frame at 48 kHz.
pub const FRAME_DURATION: Duration = Duration::from_millis(20);

/// Extra time a clip gets on top of its own length before playback is
/// considered stuck.
pub const PLAYBACK_SLACK: Duration = Duration::from_secs(5);

const MAGIC: &[u8; 4] = b"DCA1";

fn metadata() -> serde_json::Value {
    json!({
        "dca": {
            "version": 1,
            "tool": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
                "url": null,
                "author": null
            }
        },
        "opus": {
            "mode": "voip",
            "sample_rate": 48000,
            "frame_size": 960,
            "abr": null,
            "vbr": true,
            "channels": 2
        }
    })
}

/// Wrap `frames` in a DCA1 container. Empty frames carry no audio and are
/// left out.
pub fn dca1(frames: &[Frame]) -> Result<Vec<u8>, VoiceError> {
    let meta = metadata().to_string().into_bytes();
    let meta_len = i32::try_from(meta.len())
        .map_err(|_| VoiceError::Protocol("DCA1 metadata too large".to_string()))?;

    let payload: usize = frames.iter().map(|f| f.len() + 2).sum();
    let mut out = Vec::with_capacity(MAGIC.len() + 4 + meta.len() + payload);
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&meta_len.to_le_bytes());
    out.extend_from_slice(&meta);

    for (index, frame) in frames.iter().enumerate() {
        if frame.is_empty() {
            continue;
        }
        let len = i16::try_from(frame.len()).map_err(|_| {
            VoiceError::Protocol(format!(
                "frame {index} is {} bytes, a DCA1 clip allows {}",
                frame.len(),
                i16::MAX
            ))
        })?;
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(frame.as_bytes());
    }
    Ok(out)
}

/// How long to wait for a clip of `frames` frames to finish playing.
pub fn playback_budget(frames: usize) -> Duration {
    FRAME_DURATION.saturating_mul(u32::try_from(frames).unwrap_or(u32::MAX)) + PLAYBACK_SLACK
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn split(clip: &[u8]) -> (serde_json::Value, &[u8]) {
        assert_eq!(&clip[..4], b"DCA1");
        let meta_len = i32::from_le_bytes(clip[4..8].try_into().unwrap()) as usize;
        let meta = serde_json::from_slice(&clip[8..8 + meta_len]).expect("metadata is JSON");
        (meta, &clip[8 + meta_len..])
    }

    // -- dca1() ------------------------------------------------------------

    #[test]
    fn header_carries_opus_metadata() {
        let clip = dca1(&[]).unwrap();
        let (meta, frames) = split(&clip);
        assert_eq!(meta["dca"]["version"], 1);
        assert_eq!(meta["dca"]["tool"]["name"], "golly");
        assert_eq!(meta["opus"]["sample_rate"], 48000);
        assert_eq!(meta["opus"]["frame_size"], 960);
        assert_eq!(meta["opus"]["channels"], 2);
        assert!(frames.is_empty());
    }

    #[test]
    fn frames_follow_in_order_with_i16_lengths() {
        let frames = [Frame::from(&[1u8, 2, 3][..]), Frame::from(vec![9u8; 300])];
        let clip = dca1(&frames).unwrap();
        let (_, body) = split(&clip);

        assert_eq!(&body[..2], &3i16.to_le_bytes());
        assert_eq!(&body[2..5], &[1, 2, 3]);
        assert_eq!(&body[5..7], &300i16.to_le_bytes());
        assert_eq!(body.len(), 7 + 300);
    }

    #[test]
    fn empty_frames_are_skipped() {
        let frames = [Frame::from(Vec::new()), Frame::from(&[7u8][..])];
        let clip = dca1(&frames).unwrap();
        let (_, body) = split(&clip);
        assert_eq!(body, &[1, 0, 7]);
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let frames = [Frame::from(vec![0u8; i16::MAX as usize + 1])];
        let err = dca1(&frames).unwrap_err();
        assert!(matches!(err, VoiceError::Protocol(msg) if msg.starts_with("frame 0")));
    }

    // -- playback_budget() -------------------------------------------------

    #[test]
    fn budget_is_clip_length_plus_slack() {
        assert_eq!(playback_budget(0), PLAYBACK_SLACK);
        assert_eq!(
            playback_budget(50),
            Duration::from_secs(1) + PLAYBACK_SLACK
        );
    }
}
