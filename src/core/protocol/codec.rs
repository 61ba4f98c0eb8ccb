// src/core/protocol/codec.rs

//! `Encoder` and `Decoder` for PeerLink frames.

use super::frame::{
    Answer, ExecStatus, FRAME_ANSWER, FRAME_QUERY, FRAME_SHUTDOWN, Frame, MAX_METHOD_NAME_LEN,
    Query, QueryFlags,
};
use crate::core::errors::PeerLinkError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

/// Default cap on a single payload or token block.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// A `tokio_util::codec` implementation for PeerLink frames.
///
/// Both directions enforce `max_message_size` on payload and token blocks.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_message_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_SIZE)
    }
}

impl FrameCodec {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            max_message_size: max_message_size.min(u32::MAX as usize),
        }
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    /// Encodes a frame into a standalone byte vector.
    pub fn encode_to_vec(&mut self, frame: Frame) -> Result<Vec<u8>, PeerLinkError> {
        let mut buf = BytesMut::new();
        self.encode(frame, &mut buf)?;
        Ok(buf.to_vec())
    }

    fn decode_frame(&self, bytes: &mut &[u8]) -> Result<Frame, PeerLinkError> {
        match take_u8(bytes)? {
            FRAME_QUERY => self.decode_query(bytes).map(Frame::Query),
            FRAME_ANSWER => self.decode_answer(bytes).map(Frame::Answer),
            FRAME_SHUTDOWN => Ok(Frame::Shutdown),
            other => Err(PeerLinkError::InvalidProtocol(format!(
                "unexpected frame type byte 0x{other:02x}"
            ))),
        }
    }

    fn decode_query(&self, bytes: &mut &[u8]) -> Result<Query, PeerLinkError> {
        let request_id = take_request_id(bytes)?;
        let flags = QueryFlags::from_bits(take_u8(bytes)?)
            .ok_or_else(|| PeerLinkError::InvalidProtocol("unknown query flag bits".into()))?;

        let name_len = take_u8(bytes)? as usize;
        if name_len == 0 {
            return Err(PeerLinkError::InvalidProtocol("empty method name".into()));
        }
        let name = take_bytes(bytes, name_len)?;
        let method = String::from_utf8(name.to_vec())
            .map_err(|_| PeerLinkError::InvalidProtocol("method name is not UTF-8".into()))?;

        let payload = self.take_block(bytes)?;
        let auth_token = if flags.contains(QueryFlags::EXTRA_AUTH) {
            Some(self.take_block(bytes)?)
        } else {
            None
        };

        Ok(Query {
            request_id,
            method,
            payload,
            auth_token,
        })
    }

    fn decode_answer(&self, bytes: &mut &[u8]) -> Result<Answer, PeerLinkError> {
        let request_id = take_request_id(bytes)?;
        let status = ExecStatus::try_from(take_u8(bytes)?)?;
        let payload = self.take_block(bytes)?;
        Ok(Answer {
            request_id,
            status,
            payload,
        })
    }

    /// Reads a u32-length-prefixed block, rejecting it before buffering if the
    /// declared size is over the limit.
    fn take_block(&self, bytes: &mut &[u8]) -> Result<Bytes, PeerLinkError> {
        let len = take_u32(bytes)? as usize;
        if len > self.max_message_size {
            return Err(PeerLinkError::MessageTooLarge {
                size: len,
                max: self.max_message_size,
            });
        }
        take_bytes(bytes, len)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = PeerLinkError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        let mut bytes = &src[..];
        match self.decode_frame(&mut bytes) {
            Ok(frame) => {
                let consumed = src.len() - bytes.len();
                src.advance(consumed);
                Ok(Some(frame))
            }
            // Not enough bytes yet: leave the buffer untouched and wait for more.
            Err(PeerLinkError::IncompleteData) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = PeerLinkError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            Frame::Query(query) => {
                if query.request_id == 0 {
                    return Err(PeerLinkError::ZeroRequestId);
                }
                let name = query.method.as_bytes();
                if name.is_empty() || name.len() > MAX_METHOD_NAME_LEN {
                    return Err(PeerLinkError::InvalidProtocol(format!(
                        "method name must be 1..={MAX_METHOD_NAME_LEN} bytes, got {}",
                        name.len()
                    )));
                }
                self.check_size(query.payload.len())?;
                if let Some(token) = &query.auth_token {
                    self.check_size(token.len())?;
                }

                let token_len = query.auth_token.as_ref().map_or(0, |t| 4 + t.len());
                dst.reserve(1 + 8 + 1 + 1 + name.len() + 4 + query.payload.len() + token_len);
                dst.put_u8(FRAME_QUERY);
                dst.put_u64(query.request_id);
                dst.put_u8(query.flags().bits());
                dst.put_u8(name.len() as u8);
                dst.put_slice(name);
                dst.put_u32(query.payload.len() as u32);
                dst.put_slice(&query.payload);
                if let Some(token) = &query.auth_token {
                    dst.put_u32(token.len() as u32);
                    dst.put_slice(token);
                }
            }
            Frame::Answer(answer) => {
                if answer.request_id == 0 {
                    return Err(PeerLinkError::ZeroRequestId);
                }
                let payload = if answer.payload.len() > self.max_message_size {
                    warn!(
                        request_id = answer.request_id,
                        size = answer.payload.len(),
                        max = self.max_message_size,
                        "Answer payload over the size limit, sending an empty payload instead"
                    );
                    Bytes::new()
                } else {
                    answer.payload
                };
                dst.reserve(1 + 8 + 1 + 4 + payload.len());
                dst.put_u8(FRAME_ANSWER);
                dst.put_u64(answer.request_id);
                dst.put_u8(answer.status as u8);
                dst.put_u32(payload.len() as u32);
                dst.put_slice(&payload);
            }
            Frame::Shutdown => dst.put_u8(FRAME_SHUTDOWN),
        }
        Ok(())
    }
}

impl FrameCodec {
    fn check_size(&self, size: usize) -> Result<(), PeerLinkError> {
        if size > self.max_message_size {
            return Err(PeerLinkError::MessageTooLarge {
                size,
                max: self.max_message_size,
            });
        }
        Ok(())
    }
}

fn take_u8(bytes: &mut &[u8]) -> Result<u8, PeerLinkError> {
    if bytes.is_empty() {
        return Err(PeerLinkError::IncompleteData);
    }
    Ok(bytes.get_u8())
}

fn take_u32(bytes: &mut &[u8]) -> Result<u32, PeerLinkError> {
    if bytes.len() < 4 {
        return Err(PeerLinkError::IncompleteData);
    }
    Ok(bytes.get_u32())
}

fn take_request_id(bytes: &mut &[u8]) -> Result<u64, PeerLinkError> {
    if bytes.len() < 8 {
        return Err(PeerLinkError::IncompleteData);
    }
    match bytes.get_u64() {
        0 => Err(PeerLinkError::ZeroRequestId),
        id => Ok(id),
    }
}

fn take_bytes(bytes: &mut &[u8], len: usize) -> Result<Bytes, PeerLinkError> {
    if bytes.len() < len {
        return Err(PeerLinkError::IncompleteData);
    }
    let data = Bytes::copy_from_slice(&bytes[..len]);
    bytes.advance(len);
    Ok(data)
}
