//! Loader for `.dca` sound clips.
//!
//! The container is nothing more than a run of opus packets, each preceded by
//! its length as a little-endian `u16`:
//!
//! ```text
//! [len: u16 LE][payload: len bytes][len: u16 LE][payload: len bytes] ...
//! ```
//!
//! The file is decoded once at startup into a [`FrameSequence`], which is
//! then shared read-only by every playback.

use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, ErrorKind, Read, Write};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failure while loading a frame container, tagged with the stage that failed.
#[derive(Debug, Error)]
pub enum SoundError {
    #[error("failed to open sound file {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to read length of frame {index}: {source}")]
    ReadLength {
        index: usize,
        #[source]
        source: io::Error,
    },

    #[error("frame {index} is truncated: header claims {expected} bytes, only {available} present")]
    TruncatedFrame {
        index: usize,
        expected: usize,
        available: usize,
    },

    #[error("failed to read payload of frame {index}: {source}")]
    ReadPayload {
        index: usize,
        #[source]
        source: io::Error,
    },

    #[error("frame {index} is {len} bytes, the container limit is {max}")]
    FrameTooLarge { index: usize, len: usize, max: usize },

    #[error("failed to write frame container: {0}")]
    Write(#[source] io::Error),
}

// ---------------------------------------------------------------------------
// Frame
// ---------------------------------------------------------------------------

/// One encoded opus packet. Opaque to everything but the voice transport.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame(Box<[u8]>);

impl Frame {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for Frame {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes.into_boxed_slice())
    }
}

impl From<&[u8]> for Frame {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.into())
    }
}

impl AsRef<[u8]> for Frame {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Frame({} bytes)", self.0.len())
    }
}

// ---------------------------------------------------------------------------
// FrameSequence
// ---------------------------------------------------------------------------

/// Ordered, immutable list of frames in file order.
///
/// Cloning is cheap: all clones point at the same frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameSequence(Arc<[Frame]>);

impl FrameSequence {
    /// Decode a frame container from `reader`.
    ///
    /// End of input exactly at a record boundary, or part-way through a
    /// length field, ends decoding normally. End of input inside a payload
    /// is an error and nothing decoded so far is returned.
    pub fn decode<R: Read>(mut reader: R) -> Result<Self, SoundError> {
        let mut frames = Vec::new();

        loop {
            let index = frames.len();

            let mut len_buf = [0u8; 2];
            let filled = read_full(&mut reader, &mut len_buf)
                .map_err(|source| SoundError::ReadLength { index, source })?;
            if filled < len_buf.len() {
                if filled > 0 {
                    debug!(index, "ignoring truncated length field at end of container");
                }
                break;
            }

            let expected = u16::from_le_bytes(len_buf) as usize;
            let mut payload = vec![0u8; expected];
            let available = read_full(&mut reader, &mut payload)
                .map_err(|source| SoundError::ReadPayload { index, source })?;
            if available < expected {
                return Err(SoundError::TruncatedFrame {
                    index,
                    expected,
                    available,
                });
            }

            frames.push(Frame::from(payload));
        }

        Ok(Self(frames.into()))
    }

    /// Open `path` and decode it. The file is closed before returning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SoundError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| SoundError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let frames = Self::decode(BufReader::new(file))?;
        debug!(
            path = %path.display(),
            frames = frames.len(),
            bytes = frames.total_bytes(),
            "loaded sound"
        );
        Ok(frames)
    }

    /// Write the frames back out in container format.
    pub fn encode<W: Write>(&self, mut writer: W) -> Result<(), SoundError> {
        for (index, frame) in self.0.iter().enumerate() {
            let len = u16::try_from(frame.len()).map_err(|_| SoundError::FrameTooLarge {
                index,
                len: frame.len(),
                max: u16::MAX as usize,
            })?;
            writer
                .write_all(&len.to_le_bytes())
                .and_then(|_| writer.write_all(frame.as_bytes()))
                .map_err(SoundError::Write)?;
        }
        writer.flush().map_err(SoundError::Write)
    }

    /// Sum of all payload sizes.
    pub fn total_bytes(&self) -> usize {
        self.0.iter().map(Frame::len).sum()
    }
}

impl Deref for FrameSequence {
    type Target = [Frame];

    fn deref(&self) -> &[Frame] {
        &self.0
    }
}

impl FromIterator<Frame> for FrameSequence {
    fn from_iter<I: IntoIterator<Item = Frame>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Default for FrameSequence {
    fn default() -> Self {
        Self(Arc::from(Vec::new()))
    }
}

/// Fill `buf` from `reader`, stopping early only at end of input.
/// Returns how many bytes were read.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn container(frames: &[&[u8]]) -> Vec<u8> {
        let mut buf = Vec::new();
        for f in frames {
            buf.extend_from_slice(&(f.len() as u16).to_le_bytes());
            buf.extend_from_slice(f);
        }
        buf
    }

    // -- decode() ----------------------------------------------------------

    #[test]
    fn decodes_hi_bye() {
        let bytes = [0x02, 0x00, b'h', b'i', 0x03, 0x00, b'b', b'y', b'e'];
        let frames = FrameSequence::decode(Cursor::new(bytes)).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].as_bytes(), b"hi");
        assert_eq!(frames[1].as_bytes(), b"bye");
    }

    #[test]
    fn short_payload_is_an_error() {
        let bytes = [0x05, 0x00, b'a', b'b'];
        let err = FrameSequence::decode(Cursor::new(bytes)).unwrap_err();
        assert!(
            matches!(
                err,
                SoundError::TruncatedFrame {
                    index: 0,
                    expected: 5,
                    available: 2
                }
            ),
            "unexpected error: {err:?}"
        );
    }

    #[test]
    fn truncated_payload_after_good_frames_reports_its_index() {
        let mut bytes = container(&[b"one", b"two"]);
        bytes.extend_from_slice(&[0x04, 0x00, b'x']);
        let err = FrameSequence::decode(Cursor::new(bytes)).unwrap_err();
        assert!(matches!(err, SoundError::TruncatedFrame { index: 2, .. }));
    }

    #[test]
    fn empty_input_yields_empty_sequence() {
        let frames = FrameSequence::decode(Cursor::new(Vec::<u8>::new())).unwrap();
        assert!(frames.is_empty());
    }

    #[test]
    fn stops_cleanly_at_record_boundary() {
        let bytes = container(&[b"abc".as_slice(), b"de".as_slice()]);
        let frames = FrameSequence::decode(Cursor::new(bytes)).unwrap();
        assert_eq!(frames.len(), 2);
    }

    #[test]
    fn tolerates_half_a_length_field() {
        let mut bytes = container(&[b"abc"]);
        bytes.push(0x07);
        let frames = FrameSequence::decode(Cursor::new(bytes)).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].as_bytes(), b"abc");
    }

    #[test]
    fn frame_sizes_follow_file_order() {
        let sizes = [1usize, 300, 17, 65535, 2];
        let payloads: Vec<Vec<u8>> = sizes
            .iter()
            .enumerate()
            .map(|(i, &n)| vec![i as u8; n])
            .collect();
        let refs: Vec<&[u8]> = payloads.iter().map(Vec::as_slice).collect();
        let frames = FrameSequence::decode(Cursor::new(container(&refs))).unwrap();

        let decoded: Vec<usize> = frames.iter().map(Frame::len).collect();
        assert_eq!(decoded, sizes);
        for (i, frame) in frames.iter().enumerate() {
            assert!(frame.as_bytes().iter().all(|&b| b == i as u8));
        }
    }

    #[test]
    fn zero_length_record_is_kept() {
        let bytes = container(&[b"", b"x"]);
        let frames = FrameSequence::decode(Cursor::new(bytes)).unwrap();
        assert_eq!(frames.len(), 2);
        assert!(frames[0].is_empty());
    }

    #[test]
    fn io_error_is_reported_with_stage() {
        struct Broken;
        impl Read for Broken {
            fn read(&mut self, _: &mut [u8]) -> io::Result<usize> {
                Err(io::Error::new(ErrorKind::Other, "disk on fire"))
            }
        }
        let err = FrameSequence::decode(Broken).unwrap_err();
        assert!(matches!(err, SoundError::ReadLength { index: 0, .. }));
    }

    #[test]
    fn reads_across_short_reads() {
        // A reader that hands out one byte at a time.
        struct Trickle(Cursor<Vec<u8>>);
        impl Read for Trickle {
            fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
                let n = buf.len().min(1);
                self.0.read(&mut buf[..n])
            }
        }
        let bytes = container(&[b"hello", b"world"]);
        let frames = FrameSequence::decode(Trickle(Cursor::new(bytes))).unwrap();
        assert_eq!(frames[1].as_bytes(), b"world");
    }

    // -- encode() ----------------------------------------------------------

    #[test]
    fn encode_then_decode_reproduces_frames() {
        let parts: [&[u8]; 3] = [b"alpha", b"", b"gamma delta"];
        let original: FrameSequence = parts
            .into_iter()
            .map(Frame::from)
            .collect();
        let mut buf = Vec::new();
        original.encode(&mut buf).unwrap();
        let decoded = FrameSequence::decode(Cursor::new(buf)).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn encode_rejects_oversized_frame() {
        let seq: FrameSequence = std::iter::once(Frame::from(vec![0u8; 70_000])).collect();
        let err = seq.encode(Vec::new()).unwrap_err();
        assert!(matches!(err, SoundError::FrameTooLarge { index: 0, .. }));
    }

    // -- load() ------------------------------------------------------------

    #[test]
    fn load_reads_file_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&container(&[b"ab", b"cde"])).unwrap();
        let frames = FrameSequence::load(file.path()).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames.total_bytes(), 5);
    }

    #[test]
    fn load_missing_file_is_open_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = FrameSequence::load(dir.path().join("nope.dca")).unwrap_err();
        assert!(matches!(err, SoundError::Open { .. }));
    }

    // -- sharing -----------------------------------------------------------

    #[test]
    fn clones_share_frames() {
        let a: FrameSequence = std::iter::once(Frame::from(&b"x"[..])).collect();
        let b = a.clone();
        assert!(std::ptr::eq(a.as_ptr(), b.as_ptr()));
    }

    static_assertions::assert_impl_all!(FrameSequence: Send, Sync, Clone);
}
