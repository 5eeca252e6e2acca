//! Stream framing shared by client and server.
//!
//! Every frame is `[4 body_len LE][1 kind][body]`. State and input bodies use the
//! bit-exact codec in [`super::protocol`]; control bodies are rkyv archives.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use rkyv::util::AlignedVec;
use rkyv::{Archive, Deserialize, Serialize, rancor};
use tokio_util::codec::{Decoder, Encoder};

use super::error::{ConnectionError, ProtocolError};
use super::protocol::{InputCommand, PROTOCOL_MAGIC, PROTOCOL_VERSION, StateUpdate};

pub const MAX_FRAME_SIZE: usize = 1 << 20;
pub const FRAME_HEADER_LEN: usize = 5;

const KIND_STATE: u8 = 0x01;
const KIND_INPUT: u8 = 0x02;
const KIND_CONTROL: u8 = 0x03;

#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub enum DenyReason {
    ServerFull { max_players: u32 },
    VersionMismatch { expected: u32, actual: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub enum ControlMessage {
    Hello { magic: u32, version: u32 },
    Welcome { player_id: u64, max_players: u32 },
    Denied(DenyReason),
    Ping { timestamp_ms: u64 },
    Pong { timestamp_ms: u64 },
    Disconnect,
}

impl ControlMessage {
    pub fn hello() -> Self {
        Self::Hello {
            magic: PROTOCOL_MAGIC,
            version: PROTOCOL_VERSION,
        }
    }

    pub fn serialize(&self) -> Result<Vec<u8>, ProtocolError> {
        rkyv::to_bytes::<rancor::Error>(self)
            .map(|aligned| aligned.into_vec())
            .map_err(ProtocolError::Control)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, ProtocolError> {
        // Frame bodies land at arbitrary offsets; archives must be read from aligned memory.
        let mut aligned = AlignedVec::<16>::with_capacity(data.len());
        aligned.extend_from_slice(data);
        rkyv::from_bytes::<Self, rancor::Error>(&aligned).map_err(ProtocolError::Control)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    State(StateUpdate),
    /// A state update body already run through the codec, shared across fan-out recipients.
    EncodedState(Bytes),
    Input(InputCommand),
    Control(ControlMessage),
}

impl From<ControlMessage> for Frame {
    fn from(message: ControlMessage) -> Self {
        Self::Control(message)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl FrameCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ConnectionError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, ConnectionError> {
        if src.len() < FRAME_HEADER_LEN {
            src.reserve(FRAME_HEADER_LEN - src.len());
            return Ok(None);
        }

        let len = u32::from_le_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                len,
                max: MAX_FRAME_SIZE,
            }
            .into());
        }

        let kind = src[4];
        if !matches!(kind, KIND_STATE | KIND_INPUT | KIND_CONTROL) {
            return Err(ProtocolError::UnknownFrameKind(kind).into());
        }

        let total = FRAME_HEADER_LEN + len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(FRAME_HEADER_LEN);
        let body = src.split_to(len);

        let frame = match kind {
            KIND_STATE => Frame::State(StateUpdate::decode(&body)?),
            KIND_INPUT => Frame::Input(InputCommand::decode(&body)?),
            _ => Frame::Control(ControlMessage::deserialize(&body)?),
        };
        Ok(Some(frame))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ConnectionError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), ConnectionError> {
        match frame {
            Frame::State(update) => put_frame(dst, KIND_STATE, &update.encode()?),
            Frame::EncodedState(body) => put_frame(dst, KIND_STATE, &body),
            Frame::Input(command) => put_frame(dst, KIND_INPUT, &command.encode()?),
            Frame::Control(message) => put_frame(dst, KIND_CONTROL, &message.serialize()?),
        }
    }
}

fn put_frame(dst: &mut BytesMut, kind: u8, body: &[u8]) -> Result<(), ConnectionError> {
    if body.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            len: body.len(),
            max: MAX_FRAME_SIZE,
        }
        .into());
    }
    dst.reserve(FRAME_HEADER_LEN + body.len());
    dst.put_u32_le(body.len() as u32);
    dst.put_u8(kind);
    dst.put_slice(body);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::protocol::ComponentData;

    fn encode(frame: Frame) -> BytesMut {
        let mut buf = BytesMut::new();
        FrameCodec.encode(frame, &mut buf).unwrap();
        buf
    }

    #[test]
    fn partial_frames_wait_for_more_bytes() {
        let update = StateUpdate::new(10, 1).with_component(ComponentData::new("hp", vec![1]));
        let full = encode(Frame::State(update.clone()));

        let mut buf = BytesMut::from(&full[..3]);
        assert!(FrameCodec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&full[3..full.len() - 1]);
        assert!(FrameCodec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&full[full.len() - 1..]);
        assert_eq!(
            FrameCodec.decode(&mut buf).unwrap(),
            Some(Frame::State(update))
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn back_to_back_frames() {
        let mut buf = encode(Frame::Control(ControlMessage::Ping { timestamp_ms: 7 }));
        buf.extend_from_slice(&encode(Frame::Input(InputCommand::new(
            1, 2, 3, "move", vec![0; 8],
        ))));

        assert!(matches!(
            FrameCodec.decode(&mut buf).unwrap(),
            Some(Frame::Control(ControlMessage::Ping { timestamp_ms: 7 }))
        ));
        assert!(matches!(
            FrameCodec.decode(&mut buf).unwrap(),
            Some(Frame::Input(cmd)) if cmd.sequence_number == 3
        ));
        assert!(FrameCodec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn pre_encoded_state_matches_direct_encoding() {
        let update = StateUpdate::new(5, 9);
        let direct = encode(Frame::State(update.clone()));
        let shared = encode(Frame::EncodedState(Bytes::from(update.encode().unwrap())));
        assert_eq!(direct, shared);
    }

    #[test]
    fn control_messages_survive_framing() {
        let messages = [
            ControlMessage::hello(),
            ControlMessage::Welcome {
                player_id: 4,
                max_players: 8,
            },
            ControlMessage::Denied(DenyReason::ServerFull { max_players: 2 }),
            ControlMessage::Pong { timestamp_ms: 99 },
            ControlMessage::Disconnect,
        ];
        for message in messages {
            let mut buf = encode(Frame::Control(message.clone()));
            assert_eq!(
                FrameCodec.decode(&mut buf).unwrap(),
                Some(Frame::Control(message))
            );
        }
    }

    #[test]
    fn unknown_kind_is_rejected_from_header() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(100);
        buf.put_u8(0x7F);
        assert!(matches!(
            FrameCodec.decode(&mut buf),
            Err(ConnectionError::Protocol(ProtocolError::UnknownFrameKind(0x7F)))
        ));
    }

    #[test]
    fn oversized_length_is_rejected_before_buffering() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(u32::MAX);
        buf.put_u8(KIND_STATE);
        assert!(matches!(
            FrameCodec.decode(&mut buf),
            Err(ConnectionError::Protocol(ProtocolError::FrameTooLarge { .. }))
        ));
    }

    #[test]
    fn malformed_body_is_a_protocol_error() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(4);
        buf.put_u8(KIND_INPUT);
        buf.put_slice(&[1, 2, 3, 4]);
        assert!(matches!(
            FrameCodec.decode(&mut buf),
            Err(ConnectionError::Protocol(ProtocolError::Truncated { .. }))
        ));
    }
}
