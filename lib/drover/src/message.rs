//! Wire contract between the master rank and worker ranks.
//!
//! Four message kinds are exchanged point-to-point: workers announce
//! themselves with `Ready`, the master hands out a key with `Work`, the
//! worker replies with `Result`, and the master releases an idle worker with
//! `Exit`. On byte-stream transports each message is framed as
//! `[tag: u8][len: u32 LE][payload]`.

use anyhow::{anyhow, Result};
use std::io::Read;

/// Rank of the coordinating process.
pub const MASTER_RANK: usize = 0;

pub const FRAME_HEADER_LEN: usize = 5;

const TAG_READY: u8 = 0;
const TAG_WORK: u8 = 1;
const TAG_RESULT: u8 = 2;
const TAG_EXIT: u8 = 42;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Tag {
    /// worker -> master, empty payload: "I am idle, send me something".
    Ready,
    /// master -> worker, payload is the key bytes.
    Work,
    /// worker -> master, payload is the result bytes. An empty payload marks
    /// a key whose processing failed on the worker.
    Result,
    /// master -> worker, empty payload: no more work, shut down.
    Exit,
}

impl Tag {
    pub fn to_wire(self) -> u8 {
        match self {
            Tag::Ready => TAG_READY,
            Tag::Work => TAG_WORK,
            Tag::Result => TAG_RESULT,
            Tag::Exit => TAG_EXIT,
        }
    }

    pub fn from_wire(byte: u8) -> Option<Tag> {
        match byte {
            TAG_READY => Some(Tag::Ready),
            TAG_WORK => Some(Tag::Work),
            TAG_RESULT => Some(Tag::Result),
            TAG_EXIT => Some(Tag::Exit),
            _ => None,
        }
    }
}

/// Metadata of an incoming message, as reported by a probe. The message
/// itself stays queued until it is received.
#[derive(Clone, Copy, Debug)]
pub struct Envelope {
    pub source: usize,
    pub tag: Tag,
    pub len: usize,
}

pub fn encode_frame(tag: Tag, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.push(tag.to_wire());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(payload);
    frame
}

pub fn read_frame(reader: &mut impl Read) -> Result<(Tag, Vec<u8>)> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    reader.read_exact(&mut header)?;
    let tag = Tag::from_wire(header[0]).ok_or_else(|| anyhow!("unknown message tag {}", header[0]))?;
    let len = u32::from_le_bytes([header[1], header[2], header[3], header[4]]) as usize;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Ok((tag, payload))
}
