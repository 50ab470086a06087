// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Wire protocol: newline-delimited frames over a TCP stream.
//!
//! The first frame on a connection is the handshake: the decimal user id of
//! the client. Every later frame is an application frame of the form
//! `<sender>:<receiver>:<kind>:<content>`. Only the first three `:` split
//! fields; the content may contain further `:` characters.
//!
//! The relay does not interpret `content`. Forwarded frames are the exact
//! bytes received, re-terminated with `\n`.

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::storage::{MessageKind, NewMessage, UserId};

/// Frame terminator.
pub const FRAME_DELIMITER: u8 = b'\n';

/// Field separator inside an application frame.
pub const FIELD_SEPARATOR: char = ':';

/// Default maximum frame length in bytes (terminator excluded).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024;

/// Reasons a single frame is rejected. None of them close the connection.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame is not valid UTF-8")]
    InvalidUtf8,

    #[error("expected 4 fields, found {found}")]
    MissingFields { found: usize },

    #[error("sender id is not an integer: {0:?}")]
    InvalidSender(String),

    #[error("receiver id is not an integer: {0:?}")]
    InvalidReceiver(String),

    #[error("handshake is not an integer user id: {0:?}")]
    InvalidIdentity(String),

    #[error("frame exceeds the maximum length")]
    TooLong,
}

/// One unit produced by [`FrameCodec`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    /// A complete frame without its terminator.
    Data(Bytes),
    /// A frame longer than the limit. Its bytes are discarded up to the
    /// next terminator.
    Oversized,
}

/// Newline-delimited framing with a length limit.
///
/// Oversized frames are reported as [`InboundFrame::Oversized`] instead of a
/// decode error so the stream keeps going after them. A trailing `\r` is
/// stripped.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_length: usize,
    next_index: usize,
    discarding: bool,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::with_max_length(DEFAULT_MAX_FRAME_SIZE)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        FrameCodec {
            max_length,
            next_index: 0,
            discarding: false,
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn without_carriage_return(mut frame: BytesMut) -> Bytes {
    if frame.last() == Some(&b'\r') {
        frame.truncate(frame.len() - 1);
    }
    frame.freeze()
}

impl Decoder for FrameCodec {
    type Item = InboundFrame;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<InboundFrame>, io::Error> {
        loop {
            let read_to = self.max_length.saturating_add(1).min(buf.len());
            let newline = buf[self.next_index..read_to]
                .iter()
                .position(|b| *b == FRAME_DELIMITER);

            match (self.discarding, newline) {
                (true, Some(offset)) => {
                    buf.advance(self.next_index + offset + 1);
                    self.discarding = false;
                    self.next_index = 0;
                }
                (true, None) => {
                    buf.advance(read_to);
                    self.next_index = 0;
                    if buf.is_empty() {
                        return Ok(None);
                    }
                }
                (false, Some(offset)) => {
                    let end = self.next_index + offset;
                    self.next_index = 0;
                    let mut frame = buf.split_to(end + 1);
                    frame.truncate(end);
                    return Ok(Some(InboundFrame::Data(without_carriage_return(frame))));
                }
                (false, None) if buf.len() > self.max_length => {
                    self.discarding = true;
                    return Ok(Some(InboundFrame::Oversized));
                }
                (false, None) => {
                    self.next_index = read_to;
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<InboundFrame>, io::Error> {
        if let Some(frame) = self.decode(buf)? {
            return Ok(Some(frame));
        }
        // Peer closed mid-frame: hand over what arrived unless we were discarding
        self.next_index = 0;
        if buf.is_empty() || self.discarding {
            buf.clear();
            self.discarding = false;
            return Ok(None);
        }
        let frame = buf.split_to(buf.len());
        Ok(Some(InboundFrame::Data(without_carriage_return(frame))))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: Bytes, dst: &mut BytesMut) -> Result<(), io::Error> {
        dst.reserve(frame.len() + 1);
        dst.put(frame);
        dst.put_u8(FRAME_DELIMITER);
        Ok(())
    }
}

fn parse_user_id(field: &str) -> Option<UserId> {
    field.trim().parse().ok()
}

/// Parses the handshake frame into the announced user id.
pub fn parse_handshake(raw: &[u8]) -> Result<UserId, FrameError> {
    let text = std::str::from_utf8(raw).map_err(|_| FrameError::InvalidUtf8)?;
    parse_user_id(text).ok_or_else(|| FrameError::InvalidIdentity(text.to_string()))
}

/// A parsed application frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatFrame {
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub kind: MessageKind,
    pub content: String,
}

impl ChatFrame {
    /// Parses `<sender>:<receiver>:<kind>:<content>`.
    pub fn parse(raw: &[u8]) -> Result<Self, FrameError> {
        let text = std::str::from_utf8(raw).map_err(|_| FrameError::InvalidUtf8)?;
        let fields: Vec<&str> = text.splitn(4, FIELD_SEPARATOR).collect();
        let [sender, receiver, kind, content] = fields[..] else {
            return Err(FrameError::MissingFields {
                found: fields.len(),
            });
        };

        let sender_id =
            parse_user_id(sender).ok_or_else(|| FrameError::InvalidSender(sender.to_string()))?;
        let receiver_id = parse_user_id(receiver)
            .ok_or_else(|| FrameError::InvalidReceiver(receiver.to_string()))?;

        Ok(ChatFrame {
            sender_id,
            receiver_id,
            kind: MessageKind::from_tag(kind),
            content: content.to_string(),
        })
    }

    /// Converts the frame into a message ready to persist.
    pub fn into_message(self) -> NewMessage {
        NewMessage {
            sender_id: self.sender_id,
            receiver_id: self.receiver_id,
            kind: self.kind,
            content: self.content,
        }
    }
}
