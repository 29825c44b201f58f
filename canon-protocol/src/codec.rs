//! Length-prefixed JSON framing
//!
//! Each frame is a 4-byte big-endian length followed by one JSON document.
//! [`ClientCodec`] and [`ServerCodec`] are the two directions of the same
//! [`FrameCodec`].

use std::fmt;
use std::marker::PhantomData;

use bytes::{Buf, BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::codec::{Decoder, Encoder};

use crate::messages::{ClientMessage, ServerMessage};

/// Default frame size cap (16 MiB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

const LEN_PREFIX: usize = 4;

/// Protocol codec error
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Frame too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },
}

/// A message type that can arrive on a link
pub trait Inbound: DeserializeOwned {
    /// What to yield for a frame that does not parse
    fn undecodable(err: serde_json::Error) -> Result<Self, CodecError>;
}

impl Inbound for ServerMessage {
    /// The client tolerates anything the backend sends
    fn undecodable(_err: serde_json::Error) -> Result<Self, CodecError> {
        Ok(ServerMessage::Unknown)
    }
}

impl Inbound for ClientMessage {
    fn undecodable(err: serde_json::Error) -> Result<Self, CodecError> {
        Err(err.into())
    }
}

/// Encodes `Out` and decodes `In`
pub struct FrameCodec<Out, In> {
    max_frame: usize,
    _direction: PhantomData<fn(Out) -> In>,
}

/// Client side: sends [`ClientMessage`], receives [`ServerMessage`]
pub type ClientCodec = FrameCodec<ClientMessage, ServerMessage>;

/// Backend side (and test doubles of it)
pub type ServerCodec = FrameCodec<ServerMessage, ClientMessage>;

impl<Out, In> FrameCodec<Out, In> {
    pub fn new() -> Self {
        Self::with_max_frame(MAX_FRAME_SIZE)
    }

    pub fn with_max_frame(max_frame: usize) -> Self {
        Self {
            max_frame,
            _direction: PhantomData,
        }
    }

    pub fn max_frame(&self) -> usize {
        self.max_frame
    }

    fn check_size(&self, size: usize) -> Result<(), CodecError> {
        if size > self.max_frame {
            return Err(CodecError::MessageTooLarge {
                size,
                max: self.max_frame,
            });
        }
        Ok(())
    }
}

impl<Out, In> Default for FrameCodec<Out, In> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Out, In> fmt::Debug for FrameCodec<Out, In> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameCodec")
            .field("max_frame", &self.max_frame)
            .finish()
    }
}

impl<Out, In: Inbound> Decoder for FrameCodec<Out, In> {
    type Item = In;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<In>, CodecError> {
        if src.len() < LEN_PREFIX {
            return Ok(None);
        }
        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        self.check_size(len)?;

        let needed = LEN_PREFIX + len;
        if src.len() < needed {
            src.reserve(needed - src.len());
            return Ok(None);
        }

        src.advance(LEN_PREFIX);
        let frame = src.split_to(len);
        match serde_json::from_slice(&frame) {
            Ok(msg) => Ok(Some(msg)),
            Err(e) => In::undecodable(e).map(Some),
        }
    }
}

impl<Out: Serialize, In> Encoder<Out> for FrameCodec<Out, In> {
    type Error = CodecError;

    fn encode(&mut self, item: Out, dst: &mut BytesMut) -> Result<(), CodecError> {
        let body = serde_json::to_vec(&item)?;
        self.check_size(body.len())?;

        dst.reserve(LEN_PREFIX + body.len());
        dst.put_u32(body.len() as u32);
        dst.extend_from_slice(&body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RemoteSession;

    fn frame(payload: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u32(payload.len() as u32);
        buf.put_slice(payload);
        buf
    }

    #[test]
    fn test_attach_request_reaches_backend() {
        let msg = ClientMessage::Reconnect {
            id: "canon-shell-1".into(),
        };

        let mut buf = BytesMut::new();
        ClientCodec::new().encode(msg.clone(), &mut buf).unwrap();

        assert_eq!(&buf[..LEN_PREFIX], &((buf.len() - LEN_PREFIX) as u32).to_be_bytes());
        assert_eq!(ServerCodec::new().decode(&mut buf).unwrap(), Some(msg));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_report_reaches_client() {
        let msg = ServerMessage::Terminals {
            sessions: vec![RemoteSession::new("canon-a").into()],
            recovery_complete: true,
            connection_count: 1,
        };

        let mut buf = BytesMut::new();
        ServerCodec::new().encode(msg.clone(), &mut buf).unwrap();
        assert_eq!(ClientCodec::new().decode(&mut buf).unwrap(), Some(msg));
    }

    #[test]
    fn test_split_frame_waits_for_rest() {
        let mut buf = BytesMut::new();
        ClientCodec::new()
            .encode(ClientMessage::ListTerminals, &mut buf)
            .unwrap();

        let mut server = ServerCodec::new();
        let mut head = buf.split_to(LEN_PREFIX + 2);
        assert!(server.decode(&mut head).unwrap().is_none());

        head.unsplit(buf);
        assert_eq!(
            server.decode(&mut head).unwrap(),
            Some(ClientMessage::ListTerminals)
        );
    }

    #[test]
    fn test_oversize_frame_is_rejected_both_ways() {
        let mut codec = ClientCodec::with_max_frame(8);

        let mut buf = BytesMut::new();
        buf.put_u32(9);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::MessageTooLarge { size: 9, max: 8 })
        ));

        let result = codec.encode(
            ClientMessage::CloseTerminal {
                id: "canon-shell-long-id".into(),
            },
            &mut BytesMut::new(),
        );
        assert!(matches!(result, Err(CodecError::MessageTooLarge { .. })));
    }

    #[test]
    fn test_garbage_is_unknown_for_client_but_error_for_backend() {
        let mut buf = frame(b"{not json");
        assert_eq!(
            ClientCodec::new().decode(&mut buf).unwrap(),
            Some(ServerMessage::Unknown)
        );
        assert!(buf.is_empty());

        let mut buf = frame(b"{not json");
        assert!(matches!(
            ServerCodec::new().decode(&mut buf),
            Err(CodecError::Json(_))
        ));
    }

    #[test]
    fn test_back_to_back_frames() {
        let mut server = ServerCodec::new();
        let mut client = ClientCodec::new();
        let mut buf = BytesMut::new();

        server
            .encode(ServerMessage::ConnectionCount { count: 3 }, &mut buf)
            .unwrap();
        server
            .encode(
                ServerMessage::TerminalClosed {
                    id: "canon-a".into(),
                },
                &mut buf,
            )
            .unwrap();

        assert_eq!(
            client.decode(&mut buf).unwrap(),
            Some(ServerMessage::ConnectionCount { count: 3 })
        );
        assert_eq!(
            client.decode(&mut buf).unwrap(),
            Some(ServerMessage::TerminalClosed {
                id: "canon-a".into()
            })
        );
        assert_eq!(client.decode(&mut buf).unwrap(), None);
    }
}
