//! Compressed input units and the sources that supply them.

use std::collections::VecDeque;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tracing::{info, warn};

use super::frame::PixelFormat;
use crate::utils::frame_interval_us;

/// How a packet's payload is encoded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    /// One baseline/progressive JPEG image per packet
    Mjpeg,
    /// Uncompressed pixels, tightly packed
    Raw {
        format: PixelFormat,
        width: u32,
        height: u32,
    },
}

/// One unit from the demuxer
#[derive(Debug, Clone)]
pub struct Packet {
    /// Presentation timestamp in microseconds
    pub timestamp_us: u64,
    pub codec: Codec,
    pub payload: Bytes,
}

impl Packet {
    pub fn mjpeg(timestamp_us: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            timestamp_us,
            codec: Codec::Mjpeg,
            payload: payload.into(),
        }
    }

    pub fn raw(
        timestamp_us: u64,
        format: PixelFormat,
        width: u32,
        height: u32,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            timestamp_us,
            codec: Codec::Raw {
                format,
                width,
                height,
            },
            payload: payload.into(),
        }
    }
}

/// Demux boundary: yields packets in decode order, `None` at end of input.
pub trait PacketSource: Send {
    fn next_packet(&mut self) -> Option<Packet>;
}

/// Packets pushed by another thread over a flume channel. Ends when every
/// sender is dropped and the channel is drained.
pub struct ChannelSource {
    rx: flume::Receiver<Packet>,
}

impl ChannelSource {
    pub fn new(rx: flume::Receiver<Packet>) -> Self {
        Self { rx }
    }

    /// Bounded channel with its source end.
    pub fn bounded(capacity: usize) -> (flume::Sender<Packet>, Self) {
        let (tx, rx) = flume::bounded(capacity);
        (tx, Self::new(rx))
    }

    /// Packets still waiting in the channel
    pub fn pending(&self) -> usize {
        self.rx.len()
    }
}

impl PacketSource for ChannelSource {
    fn next_packet(&mut self) -> Option<Packet> {
        self.rx.recv().ok()
    }
}

/// Adapts any packet iterator.
pub struct IterSource<I>(pub I);

impl<I> PacketSource for IterSource<I>
where
    I: Iterator<Item = Packet> + Send,
{
    fn next_packet(&mut self) -> Option<Packet> {
        self.0.next()
    }
}

/// A directory of JPEG images played back at a fixed frame rate, in file
/// name order.
pub struct ImageSequence {
    files: VecDeque<PathBuf>,
    index: u64,
    frame_interval_us: u64,
}

impl ImageSequence {
    pub fn open(dir: impl AsRef<Path>, fps: u32) -> io::Result<Self> {
        let dir = dir.as_ref();
        let mut files = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if is_jpeg(&path) {
                files.push(path);
            }
        }
        files.sort();

        info!(dir = %dir.display(), frames = files.len(), fps, "Opened image sequence");

        Ok(Self {
            files: files.into(),
            index: 0,
            frame_interval_us: frame_interval_us(fps),
        })
    }

    pub fn remaining(&self) -> usize {
        self.files.len()
    }
}

impl PacketSource for ImageSequence {
    fn next_packet(&mut self) -> Option<Packet> {
        while let Some(path) = self.files.pop_front() {
            let timestamp_us = self.index * self.frame_interval_us;
            self.index += 1;
            match fs::read(&path) {
                Ok(data) => return Some(Packet::mjpeg(timestamp_us, data)),
                Err(e) => warn!(path = %path.display(), "skipping unreadable frame: {e}"),
            }
        }
        None
    }
}

fn is_jpeg(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("jpg") || ext.eq_ignore_ascii_case("jpeg"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_sequence_orders_and_stamps_files() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["002.jpg", "000.JPG", "001.jpeg", "notes.txt"] {
            fs::write(dir.path().join(name), name.as_bytes()).unwrap();
        }

        let mut source = ImageSequence::open(dir.path(), 25).unwrap();
        assert_eq!(source.remaining(), 3);

        let packets: Vec<Packet> = std::iter::from_fn(|| source.next_packet()).collect();
        let stamps: Vec<u64> = packets.iter().map(|p| p.timestamp_us).collect();
        assert_eq!(stamps, vec![0, 40_000, 80_000]);
        assert_eq!(&packets[0].payload[..], b"000.JPG");
        assert_eq!(packets[2].codec, Codec::Mjpeg);
    }

    #[test]
    fn channel_source_ends_when_senders_drop() {
        let (tx, mut source) = ChannelSource::bounded(4);
        tx.send(Packet::mjpeg(0, vec![1u8])).unwrap();
        tx.send(Packet::mjpeg(1, vec![2u8])).unwrap();
        drop(tx);

        assert_eq!(source.pending(), 2);
        assert_eq!(source.next_packet().map(|p| p.timestamp_us), Some(0));
        assert_eq!(source.next_packet().map(|p| p.timestamp_us), Some(1));
        assert!(source.next_packet().is_none());
    }
}
