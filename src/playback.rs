//! Stream a [`FrameSequence`] into a voice channel.
//!
//! The driver only knows about the [`VoiceTransport`] / [`VoiceSession`]
//! traits; the Discord implementation lives in [`crate::voice`].

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::sound::{Frame, FrameSequence};
use crate::types::Snowflake;
use crate::voice::VoiceError;

/// Default wait before speaking and after the last frame.
pub const DEFAULT_SETTLE: Duration = Duration::from_millis(250);

// ---------------------------------------------------------------------------
// Destination
// ---------------------------------------------------------------------------

/// A voice channel inside a guild.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    pub guild_id: Snowflake,
    pub channel_id: Snowflake,
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.guild_id, self.channel_id)
    }
}

// ---------------------------------------------------------------------------
// Transport seam
// ---------------------------------------------------------------------------

/// Something that can open a transmission session to a [`Destination`].
#[async_trait]
pub trait VoiceTransport: Send + Sync {
    async fn join(&self, destination: &Destination) -> Result<Box<dyn VoiceSession>, VoiceError>;
}

/// A live connection to one voice channel. Owned by a single playback.
#[async_trait]
pub trait VoiceSession: Send {
    async fn set_speaking(&mut self, speaking: bool) -> Result<(), VoiceError>;

    async fn write(&mut self, frame: &Frame) -> Result<(), VoiceError>;

    async fn disconnect(self: Box<Self>) -> Result<(), VoiceError>;
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// Fixed waits around a playback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackTiming {
    /// Wait after joining, before the first frame.
    pub settle: Duration,
    /// Wait after the last frame, before leaving.
    pub flush: Duration,
}

impl Default for PlaybackTiming {
    fn default() -> Self {
        Self {
            settle: DEFAULT_SETTLE,
            flush: DEFAULT_SETTLE,
        }
    }
}

/// Join `destination`, send every frame in order, then leave.
///
/// A failed join returns before anything is sent. A failed write aborts the
/// playback; the session is still torn down.
pub async fn play(
    transport: &dyn VoiceTransport,
    destination: &Destination,
    frames: &FrameSequence,
    timing: PlaybackTiming,
) -> Result<(), VoiceError> {
    let mut session = transport.join(destination).await?;
    info!(destination = %destination, frames = frames.len(), "joined voice channel");

    tokio::time::sleep(timing.settle).await;

    if let Err(e) = transmit(session.as_mut(), frames).await {
        warn!(destination = %destination, error = %e, "playback aborted");
        if let Err(close_err) = session.disconnect().await {
            debug!(error = %close_err, "disconnect after failed playback also failed");
        }
        return Err(e);
    }

    tokio::time::sleep(timing.flush).await;

    session.disconnect().await?;
    info!(destination = %destination, "left voice channel");
    Ok(())
}

async fn transmit(session: &mut dyn VoiceSession, frames: &FrameSequence) -> Result<(), VoiceError> {
    session.set_speaking(true).await?;
    for frame in frames.iter() {
        session.write(frame).await?;
    }
    session.set_speaking(false).await
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::time::Instant;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Join(Destination),
        Speaking(bool),
        Write(Vec<u8>),
        Disconnect,
    }

    #[derive(Default)]
    struct Recorder {
        calls: Arc<Mutex<Vec<(Call, Instant)>>>,
        fail_join: bool,
        fail_write_at: Option<usize>,
    }

    impl Recorder {
        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().iter().map(|(c, _)| c.clone()).collect()
        }
    }

    struct RecordingSession {
        calls: Arc<Mutex<Vec<(Call, Instant)>>>,
        writes: usize,
        fail_write_at: Option<usize>,
    }

    impl RecordingSession {
        fn push(&self, call: Call) {
            self.calls.lock().unwrap().push((call, Instant::now()));
        }
    }

    #[async_trait]
    impl VoiceTransport for Recorder {
        async fn join(&self, destination: &Destination) -> Result<Box<dyn VoiceSession>, VoiceError> {
            if self.fail_join {
                return Err(VoiceError::Timeout("voice server update"));
            }
            self.calls
                .lock()
                .unwrap()
                .push((Call::Join(destination.clone()), Instant::now()));
            Ok(Box::new(RecordingSession {
                calls: Arc::clone(&self.calls),
                writes: 0,
                fail_write_at: self.fail_write_at,
            }))
        }
    }

    #[async_trait]
    impl VoiceSession for RecordingSession {
        async fn set_speaking(&mut self, speaking: bool) -> Result<(), VoiceError> {
            self.push(Call::Speaking(speaking));
            Ok(())
        }

        async fn write(&mut self, frame: &Frame) -> Result<(), VoiceError> {
            if self.fail_write_at == Some(self.writes) {
                return Err(VoiceError::Closed);
            }
            self.writes += 1;
            self.push(Call::Write(frame.as_bytes().to_vec()));
            Ok(())
        }

        async fn disconnect(self: Box<Self>) -> Result<(), VoiceError> {
            self.push(Call::Disconnect);
            Ok(())
        }
    }

    fn dest() -> Destination {
        Destination {
            guild_id: "1".to_string(),
            channel_id: "2".to_string(),
        }
    }

    fn three_frames() -> FrameSequence {
        let parts: [&[u8]; 3] = [b"a", b"bb", b"ccc"];
        parts.into_iter().map(Frame::from).collect()
    }

    // -- play() ------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn writes_every_frame_between_one_speaking_pair() {
        let recorder = Recorder::default();
        play(&recorder, &dest(), &three_frames(), PlaybackTiming::default())
            .await
            .unwrap();

        assert_eq!(
            recorder.calls(),
            vec![
                Call::Join(dest()),
                Call::Speaking(true),
                Call::Write(b"a".to_vec()),
                Call::Write(b"bb".to_vec()),
                Call::Write(b"ccc".to_vec()),
                Call::Speaking(false),
                Call::Disconnect,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn waits_before_speaking_and_before_leaving() {
        let recorder = Recorder::default();
        play(&recorder, &dest(), &three_frames(), PlaybackTiming::default())
            .await
            .unwrap();

        let calls = recorder.calls.lock().unwrap().clone();
        let joined = calls[0].1;
        let speaking = calls[1].1;
        let stopped = calls[5].1;
        let left = calls[6].1;
        assert!(speaking - joined >= DEFAULT_SETTLE);
        assert!(left - stopped >= DEFAULT_SETTLE);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_join_sends_nothing() {
        let recorder = Recorder {
            fail_join: true,
            ..Default::default()
        };
        let err = play(&recorder, &dest(), &three_frames(), PlaybackTiming::default())
            .await
            .unwrap_err();
        assert!(matches!(err, VoiceError::Timeout(_)));
        assert!(recorder.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_write_aborts_and_disconnects() {
        let recorder = Recorder {
            fail_write_at: Some(1),
            ..Default::default()
        };
        let err = play(&recorder, &dest(), &three_frames(), PlaybackTiming::default())
            .await
            .unwrap_err();
        assert!(matches!(err, VoiceError::Closed));

        let calls = recorder.calls();
        assert_eq!(calls.iter().filter(|c| matches!(c, Call::Write(_))).count(), 1);
        assert_eq!(calls.last(), Some(&Call::Disconnect));
    }

    #[tokio::test(start_paused = true)]
    async fn empty_sequence_still_brackets_speaking() {
        let recorder = Recorder::default();
        play(&recorder, &dest(), &FrameSequence::default(), PlaybackTiming::default())
            .await
            .unwrap();
        assert_eq!(
            recorder.calls(),
            vec![
                Call::Join(dest()),
                Call::Speaking(true),
                Call::Speaking(false),
                Call::Disconnect,
            ]
        );
    }

    #[test]
    fn destination_display() {
        assert_eq!(dest().to_string(), "1/2");
    }
}
