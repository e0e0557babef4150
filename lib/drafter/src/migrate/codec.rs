// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Framing for the multiplexed migration protocol.
//!
//! Every frame is a 9-byte header followed by the payload: a 32-bit
//! little-endian stream id, a tag byte identifying the message type, and a
//! 32-bit little-endian payload length. Frames on different stream ids may
//! interleave arbitrarily; frames on the same stream arrive in source
//! order.
//!
//! The framing layer validates lengths and tags only; ordering invariants
//! (DevInfo-before-WriteAt and so on) are the engine's responsibility.

use bytes::{Buf, BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use thiserror::Error;
use tokio_util::codec;

/// Frames larger than this are rejected before any allocation happens; a
/// well-formed peer never sends payloads beyond one block plus header
/// slack, and blocks top out well below this.
pub const MAX_PAYLOAD: u32 = 32 * 1024 * 1024;

const HEADER_LEN: usize = 4 + 1 + 4;

/// Wire protocol errors. Any of these terminates the session for the
/// affected peer.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// We received an unknown tag byte
    #[error("couldn't decode message type ({0})")]
    InvalidMessageType(u8),

    /// We received an unknown event kind
    #[error("couldn't decode event kind ({0})")]
    InvalidEventKind(u8),

    /// The payload length doesn't match the message type's shape
    #[error("unexpected payload length {1} for type {0:?}")]
    UnexpectedPayloadLen(u8, usize),

    /// The advertised payload length exceeds the frame cap
    #[error("frame length {0} overflows maximum {MAX_PAYLOAD}")]
    FrameOverflow(u32),

    /// Received a non-UTF8 device name
    #[error("non-UTF8 device name: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    /// A frame arrived for a stream this side never opened
    #[error("frame for unknown stream {0}")]
    UnknownStream(u32),

    /// Encountered an I/O error on the transport
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Event kinds carried by [`Message::Event`].
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive,
)]
#[repr(u8)]
pub enum EventKind {
    PreLock,
    PostLock,
    PreUnlock,
    PostUnlock,
    AssumeAuthority,
    AllDevicesSent,
    Completed,
}

/// The messages exchanged on one logical device stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    DevInfo { name: String, size: u64, block_size: u32 },
    ReadAt { offset: u64, length: u32 },
    ReadAtResponse(Vec<u8>),
    WriteAt { offset: u64, data: Vec<u8> },
    WriteAtResponse,
    NeedAt { offset: u64, length: u32 },
    DontNeedAt { offset: u64, length: u32 },
    DirtyList(Vec<u32>),
    Event(EventKind),
    EventResponse,
}

/// Tag bytes identifying frame types on the wire. An implementation detail
/// of the format; must be kept in bijection with [`Message`].
#[derive(Copy, Clone, Debug, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
enum MessageType {
    DevInfo,
    ReadAt,
    ReadAtResponse,
    WriteAt,
    WriteAtResponse,
    NeedAt,
    DontNeedAt,
    DirtyList,
    Event,
    EventResponse,
}

/// By implementing `From<&Message>` on MessageType we translate each
/// message into its tag, ensuring full coverage.
impl From<&Message> for MessageType {
    fn from(m: &Message) -> MessageType {
        match m {
            Message::DevInfo { .. } => MessageType::DevInfo,
            Message::ReadAt { .. } => MessageType::ReadAt,
            Message::ReadAtResponse(_) => MessageType::ReadAtResponse,
            Message::WriteAt { .. } => MessageType::WriteAt,
            Message::WriteAtResponse => MessageType::WriteAtResponse,
            Message::NeedAt { .. } => MessageType::NeedAt,
            Message::DontNeedAt { .. } => MessageType::DontNeedAt,
            Message::DirtyList(_) => MessageType::DirtyList,
            Message::Event(_) => MessageType::Event,
            Message::EventResponse => MessageType::EventResponse,
        }
    }
}

/// One frame: a message addressed to a logical stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub stream: u32,
    pub message: Message,
}

impl Frame {
    pub fn new(stream: u32, message: Message) -> Self {
        Self { stream, message }
    }
}

/// Encoder/decoder for [`Frame`]s over a byte-ordered transport.
#[derive(Default)]
pub struct FrameCodec {}

impl FrameCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes the 9-byte frame header and reserves room for the payload.
    fn put_header(
        &mut self,
        stream: u32,
        tag: MessageType,
        len: usize,
        dst: &mut BytesMut,
    ) {
        dst.reserve(HEADER_LEN + len);
        dst.put_u32_le(stream);
        dst.put_u8(tag.into());
        dst.put_u32_le(len as u32);
    }

    fn put_offset_length(&mut self, offset: u64, length: u32, dst: &mut BytesMut) {
        dst.put_u64_le(offset);
        dst.put_u32_le(length);
    }

    fn get_offset_length(
        &mut self,
        tag: MessageType,
        src: &mut BytesMut,
        len: usize,
    ) -> Result<(u64, u32), ProtocolError> {
        if len != 12 {
            return Err(ProtocolError::UnexpectedPayloadLen(tag as u8, len));
        }
        let offset = src.get_u64_le();
        let length = src.get_u32_le();
        Ok((offset, length))
    }
}

impl codec::Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(
        &mut self,
        frame: Frame,
        dst: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        let tag = MessageType::from(&frame.message);
        match frame.message {
            Message::DevInfo { name, size, block_size } => {
                let name = name.into_bytes();
                self.put_header(frame.stream, tag, 12 + name.len(), dst);
                dst.put_u64_le(size);
                dst.put_u32_le(block_size);
                dst.put(&name[..]);
            }
            Message::ReadAt { offset, length }
            | Message::NeedAt { offset, length }
            | Message::DontNeedAt { offset, length } => {
                self.put_header(frame.stream, tag, 12, dst);
                self.put_offset_length(offset, length, dst);
            }
            Message::ReadAtResponse(data) => {
                self.put_header(frame.stream, tag, data.len(), dst);
                dst.put(&data[..]);
            }
            Message::WriteAt { offset, data } => {
                self.put_header(frame.stream, tag, 8 + data.len(), dst);
                dst.put_u64_le(offset);
                dst.put(&data[..]);
            }
            Message::WriteAtResponse | Message::EventResponse => {
                self.put_header(frame.stream, tag, 0, dst);
            }
            Message::DirtyList(blocks) => {
                self.put_header(frame.stream, tag, 4 + blocks.len() * 4, dst);
                dst.put_u32_le(blocks.len() as u32);
                for block in blocks {
                    dst.put_u32_le(block);
                }
            }
            Message::Event(kind) => {
                self.put_header(frame.stream, tag, 1, dst);
                dst.put_u8(kind.into());
            }
        }
        Ok(())
    }
}

impl codec::Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(
        &mut self,
        src: &mut BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        if src.remaining() < HEADER_LEN {
            return Ok(None);
        }
        // Validate the tag and length before waiting for (or allocating)
        // the payload.
        let tag_byte = src[4];
        let tag = MessageType::try_from(tag_byte)
            .map_err(|_| ProtocolError::InvalidMessageType(tag_byte))?;
        let len = u32::from_le_bytes([src[5], src[6], src[7], src[8]]);
        if len > MAX_PAYLOAD {
            return Err(ProtocolError::FrameOverflow(len));
        }
        let len = len as usize;
        if src.remaining() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.remaining());
            return Ok(None);
        }

        let stream = u32::from_le_bytes([src[0], src[1], src[2], src[3]]);
        src.advance(HEADER_LEN);

        let message = match tag {
            MessageType::DevInfo => {
                if len < 12 {
                    return Err(ProtocolError::UnexpectedPayloadLen(
                        tag as u8, len,
                    ));
                }
                let size = src.get_u64_le();
                let block_size = src.get_u32_le();
                let name =
                    std::str::from_utf8(&src[..len - 12])?.to_string();
                src.advance(len - 12);
                Message::DevInfo { name, size, block_size }
            }
            MessageType::ReadAt => {
                let (offset, length) = self.get_offset_length(tag, src, len)?;
                Message::ReadAt { offset, length }
            }
            MessageType::NeedAt => {
                let (offset, length) = self.get_offset_length(tag, src, len)?;
                Message::NeedAt { offset, length }
            }
            MessageType::DontNeedAt => {
                let (offset, length) = self.get_offset_length(tag, src, len)?;
                Message::DontNeedAt { offset, length }
            }
            MessageType::ReadAtResponse => {
                let data = src[..len].to_vec();
                src.advance(len);
                Message::ReadAtResponse(data)
            }
            MessageType::WriteAt => {
                if len < 8 {
                    return Err(ProtocolError::UnexpectedPayloadLen(
                        tag as u8, len,
                    ));
                }
                let offset = src.get_u64_le();
                let data = src[..len - 8].to_vec();
                src.advance(len - 8);
                Message::WriteAt { offset, data }
            }
            MessageType::WriteAtResponse => {
                if len != 0 {
                    return Err(ProtocolError::UnexpectedPayloadLen(
                        tag as u8, len,
                    ));
                }
                Message::WriteAtResponse
            }
            MessageType::DirtyList => {
                if len < 4 {
                    return Err(ProtocolError::UnexpectedPayloadLen(
                        tag as u8, len,
                    ));
                }
                let count = src.get_u32_le() as usize;
                if len != 4 + count * 4 {
                    return Err(ProtocolError::UnexpectedPayloadLen(
                        tag as u8, len,
                    ));
                }
                let mut blocks = Vec::with_capacity(count);
                for _ in 0..count {
                    blocks.push(src.get_u32_le());
                }
                Message::DirtyList(blocks)
            }
            MessageType::Event => {
                if len != 1 {
                    return Err(ProtocolError::UnexpectedPayloadLen(
                        tag as u8, len,
                    ));
                }
                let kind_byte = src.get_u8();
                let kind = EventKind::try_from(kind_byte)
                    .map_err(|_| ProtocolError::InvalidEventKind(kind_byte))?;
                Message::Event(kind)
            }
            MessageType::EventResponse => {
                if len != 0 {
                    return Err(ProtocolError::UnexpectedPayloadLen(
                        tag as u8, len,
                    ));
                }
                Message::EventResponse
            }
        };
        Ok(Some(Frame { stream, message }))
    }
}
