//! Bit-exact binary codec for the two synchronization messages.
//!
//! All integers are little-endian; strings and byte payloads are length-prefixed.
//!
//! ```text
//! StateUpdate:  [8 timestamp][8 entity_id][1 priority][4 sequence][2 component_count]
//!               { [2 type_len][type][4 data_len][data] } * component_count
//! InputCommand: [8 player_id][8 timestamp][4 sequence][2 type_len][type][4 data_len][data]
//! ```

use bytes::{Buf, BufMut};
use glam::Vec2;

use super::error::ProtocolError;

pub const PROTOCOL_VERSION: u32 = 1;
pub const PROTOCOL_MAGIC: u32 = 0x4E53_594E;
pub const DEFAULT_PORT: u16 = 27015;
pub const DEFAULT_UPDATE_RATE: u32 = 20;

pub const STATE_UPDATE_HEADER_LEN: usize = 8 + 8 + 1 + 4 + 2;
pub const COMPONENT_HEADER_LEN: usize = 2 + 4;
pub const INPUT_COMMAND_HEADER_LEN: usize = 8 + 8 + 4 + 2 + 4;

pub const POSITION_COMPONENT: &str = "position";
pub const VELOCITY_COMPONENT: &str = "velocity";
pub const INPUT_ACK_COMPONENT: &str = "input_ack";

const MAX_TYPE_LEN: usize = u16::MAX as usize;
const MAX_DATA_LEN: usize = u32::MAX as usize;
const MAX_COMPONENTS: usize = u16::MAX as usize;

const SEQUENCE_WRAP_THRESHOLD: u32 = u32::MAX / 2;

#[inline]
pub fn sequence_greater_than(s1: u32, s2: u32) -> bool {
    ((s1 > s2) && (s1 - s2 <= SEQUENCE_WRAP_THRESHOLD))
        || ((s1 < s2) && (s2 - s1 > SEQUENCE_WRAP_THRESHOLD))
}

/// One opaque component payload. Only the simulation layer knows what `data` means.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ComponentData {
    pub component_type: String,
    pub data: Vec<u8>,
}

impl ComponentData {
    pub fn new(component_type: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            component_type: component_type.into(),
            data: data.into(),
        }
    }

    pub fn vec2(component_type: impl Into<String>, value: Vec2) -> Self {
        let mut data = Vec::with_capacity(8);
        data.put_f32_le(value.x);
        data.put_f32_le(value.y);
        Self::new(component_type, data)
    }

    pub fn position(position: Vec2) -> Self {
        Self::vec2(POSITION_COMPONENT, position)
    }

    pub fn velocity(velocity: Vec2) -> Self {
        Self::vec2(VELOCITY_COMPONENT, velocity)
    }

    pub fn input_ack(sequence: u32) -> Self {
        Self::new(INPUT_ACK_COMPONENT, sequence.to_le_bytes().to_vec())
    }

    pub fn as_vec2(&self) -> Result<Vec2, ProtocolError> {
        let mut data = self.exact_payload(8)?;
        Ok(Vec2::new(data.get_f32_le(), data.get_f32_le()))
    }

    pub fn as_u32(&self) -> Result<u32, ProtocolError> {
        let mut data = self.exact_payload(4)?;
        Ok(data.get_u32_le())
    }

    fn exact_payload(&self, expected: usize) -> Result<&[u8], ProtocolError> {
        if self.data.len() != expected {
            return Err(ProtocolError::InvalidComponent {
                component: self.component_type.clone(),
                expected,
                actual: self.data.len(),
            });
        }
        Ok(&self.data)
    }
}

/// Authoritative state for one entity at one server tick.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StateUpdate {
    pub timestamp: u64,
    pub entity_id: u64,
    pub priority: u8,
    pub sequence_number: u32,
    pub components: Vec<ComponentData>,
}

impl StateUpdate {
    pub fn new(timestamp: u64, entity_id: u64) -> Self {
        Self {
            timestamp,
            entity_id,
            ..Default::default()
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_component(mut self, component: ComponentData) -> Self {
        self.components.push(component);
        self
    }

    pub fn component(&self, component_type: &str) -> Option<&ComponentData> {
        self.components
            .iter()
            .find(|c| c.component_type == component_type)
    }

    /// Highest input sequence the server applied for this entity's owner, if stamped.
    pub fn input_ack(&self) -> Result<Option<u32>, ProtocolError> {
        self.component(INPUT_ACK_COMPONENT)
            .map(ComponentData::as_u32)
            .transpose()
    }

    pub fn encoded_len(&self) -> usize {
        STATE_UPDATE_HEADER_LEN
            + self
                .components
                .iter()
                .map(|c| COMPONENT_HEADER_LEN + c.component_type.len() + c.data.len())
                .sum::<usize>()
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut out)?;
        Ok(out)
    }

    /// Validates every length before writing, so a failed encode leaves `out` untouched.
    pub fn encode_into(&self, out: &mut impl BufMut) -> Result<(), ProtocolError> {
        if self.components.len() > MAX_COMPONENTS {
            return Err(ProtocolError::TooManyComponents(self.components.len()));
        }
        for component in &self.components {
            check_len("component type", component.component_type.len(), MAX_TYPE_LEN)?;
            check_len("component data", component.data.len(), MAX_DATA_LEN)?;
        }

        out.put_u64_le(self.timestamp);
        out.put_u64_le(self.entity_id);
        out.put_u8(self.priority);
        out.put_u32_le(self.sequence_number);
        out.put_u16_le(self.components.len() as u16);
        for component in &self.components {
            out.put_u16_le(component.component_type.len() as u16);
            out.put_slice(component.component_type.as_bytes());
            out.put_u32_le(component.data.len() as u32);
            out.put_slice(&component.data);
        }
        Ok(())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut buf = bytes;

        let timestamp = read_u64(&mut buf, "timestamp")?;
        let entity_id = read_u64(&mut buf, "entity id")?;
        let priority = read_u8(&mut buf, "priority")?;
        let sequence_number = read_u32(&mut buf, "sequence")?;
        let count = read_u16(&mut buf, "component count")? as usize;

        // Each component needs at least its header, so cap the preallocation by what is left.
        let mut components = Vec::with_capacity(count.min(buf.len() / COMPONENT_HEADER_LEN));
        for _ in 0..count {
            let type_len = read_u16(&mut buf, "component type length")? as usize;
            let component_type = read_string(&mut buf, "component type", type_len)?;
            let data_len = read_u32(&mut buf, "component data length")? as usize;
            let data = read_bytes(&mut buf, "component data", data_len)?.to_vec();
            components.push(ComponentData {
                component_type,
                data,
            });
        }

        ensure_consumed(buf)?;

        Ok(Self {
            timestamp,
            entity_id,
            priority,
            sequence_number,
            components,
        })
    }
}

/// One discrete input event from a client.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InputCommand {
    pub player_id: u64,
    pub timestamp: u64,
    pub sequence_number: u32,
    pub input_type: String,
    pub data: Vec<u8>,
}

impl InputCommand {
    pub fn new(
        player_id: u64,
        timestamp: u64,
        sequence_number: u32,
        input_type: impl Into<String>,
        data: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            player_id,
            timestamp,
            sequence_number,
            input_type: input_type.into(),
            data: data.into(),
        }
    }

    pub fn encoded_len(&self) -> usize {
        INPUT_COMMAND_HEADER_LEN + self.input_type.len() + self.data.len()
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut out)?;
        Ok(out)
    }

    pub fn encode_into(&self, out: &mut impl BufMut) -> Result<(), ProtocolError> {
        check_len("input type", self.input_type.len(), MAX_TYPE_LEN)?;
        check_len("input data", self.data.len(), MAX_DATA_LEN)?;

        out.put_u64_le(self.player_id);
        out.put_u64_le(self.timestamp);
        out.put_u32_le(self.sequence_number);
        out.put_u16_le(self.input_type.len() as u16);
        out.put_slice(self.input_type.as_bytes());
        out.put_u32_le(self.data.len() as u32);
        out.put_slice(&self.data);
        Ok(())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut buf = bytes;

        let player_id = read_u64(&mut buf, "player id")?;
        let timestamp = read_u64(&mut buf, "timestamp")?;
        let sequence_number = read_u32(&mut buf, "sequence")?;
        let type_len = read_u16(&mut buf, "input type length")? as usize;
        let input_type = read_string(&mut buf, "input type", type_len)?;
        let data_len = read_u32(&mut buf, "input data length")? as usize;
        let data = read_bytes(&mut buf, "input data", data_len)?.to_vec();

        ensure_consumed(buf)?;

        Ok(Self {
            player_id,
            timestamp,
            sequence_number,
            input_type,
            data,
        })
    }
}

pub fn encode_state_update(update: &StateUpdate) -> Result<Vec<u8>, ProtocolError> {
    update.encode()
}

pub fn decode_state_update(bytes: &[u8]) -> Result<StateUpdate, ProtocolError> {
    StateUpdate::decode(bytes)
}

pub fn encode_input_command(command: &InputCommand) -> Result<Vec<u8>, ProtocolError> {
    command.encode()
}

pub fn decode_input_command(bytes: &[u8]) -> Result<InputCommand, ProtocolError> {
    InputCommand::decode(bytes)
}

fn check_len(field: &'static str, len: usize, max: usize) -> Result<(), ProtocolError> {
    if len > max {
        return Err(ProtocolError::FieldTooLong { field, len, max });
    }
    Ok(())
}

fn ensure_remaining(buf: &[u8], field: &'static str, needed: usize) -> Result<(), ProtocolError> {
    if buf.remaining() < needed {
        return Err(ProtocolError::Truncated {
            field,
            needed,
            remaining: buf.remaining(),
        });
    }
    Ok(())
}

fn read_u8(buf: &mut &[u8], field: &'static str) -> Result<u8, ProtocolError> {
    ensure_remaining(buf, field, 1)?;
    Ok(buf.get_u8())
}

fn read_u16(buf: &mut &[u8], field: &'static str) -> Result<u16, ProtocolError> {
    ensure_remaining(buf, field, 2)?;
    Ok(buf.get_u16_le())
}

fn read_u32(buf: &mut &[u8], field: &'static str) -> Result<u32, ProtocolError> {
    ensure_remaining(buf, field, 4)?;
    Ok(buf.get_u32_le())
}

fn read_u64(buf: &mut &[u8], field: &'static str) -> Result<u64, ProtocolError> {
    ensure_remaining(buf, field, 8)?;
    Ok(buf.get_u64_le())
}

fn read_bytes<'a>(
    buf: &mut &'a [u8],
    field: &'static str,
    len: usize,
) -> Result<&'a [u8], ProtocolError> {
    ensure_remaining(buf, field, len)?;
    let slice: &'a [u8] = *buf;
    let (head, tail) = slice.split_at(len);
    *buf = tail;
    Ok(head)
}

fn read_string(buf: &mut &[u8], field: &'static str, len: usize) -> Result<String, ProtocolError> {
    let raw = read_bytes(buf, field, len)?;
    std::str::from_utf8(raw)
        .map(str::to_owned)
        .map_err(|_| ProtocolError::InvalidUtf8 { field })
}

fn ensure_consumed(buf: &[u8]) -> Result<(), ProtocolError> {
    if buf.is_empty() {
        Ok(())
    } else {
        Err(ProtocolError::TrailingBytes(buf.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position_update() -> StateUpdate {
        let mut update = StateUpdate::new(1000, 42)
            .with_priority(128)
            .with_component(ComponentData::new(POSITION_COMPONENT, vec![1, 2, 3, 4, 5, 6, 7, 8]));
        update.sequence_number = 5;
        update
    }

    #[test]
    fn test_sequence_comparison() {
        assert!(sequence_greater_than(2, 1));
        assert!(!sequence_greater_than(1, 2));
        assert!(sequence_greater_than(0, u32::MAX));
        assert!(!sequence_greater_than(u32::MAX, 0));
    }

    #[test]
    fn state_update_layout() {
        let update = position_update();
        let bytes = encode_state_update(&update).unwrap();

        // 23-byte header (count included) + 22-byte component
        assert_eq!(bytes.len(), 45);
        assert_eq!(update.encoded_len(), 45);
        assert_eq!(&bytes[0..8], &1000u64.to_le_bytes());
        assert_eq!(&bytes[8..16], &42u64.to_le_bytes());
        assert_eq!(bytes[16], 128);
        assert_eq!(&bytes[17..21], &5u32.to_le_bytes());
        assert_eq!(&bytes[21..23], &1u16.to_le_bytes());
        assert_eq!(&bytes[23..25], &8u16.to_le_bytes());
        assert_eq!(&bytes[25..33], b"position");
        assert_eq!(&bytes[33..37], &8u32.to_le_bytes());

        assert_eq!(decode_state_update(&bytes).unwrap(), update);
    }

    #[test]
    fn state_update_with_several_components() {
        let update = StateUpdate::new(u64::MAX, 7)
            .with_component(ComponentData::position(Vec2::new(1.5, -2.0)))
            .with_component(ComponentData::velocity(Vec2::new(0.0, 3.25)))
            .with_component(ComponentData::input_ack(99))
            .with_component(ComponentData::new("health", Vec::new()));

        let decoded = StateUpdate::decode(&update.encode().unwrap()).unwrap();
        assert_eq!(decoded, update);
        assert_eq!(decoded.input_ack().unwrap(), Some(99));
        assert_eq!(
            decoded.component(VELOCITY_COMPONENT).unwrap().as_vec2().unwrap(),
            Vec2::new(0.0, 3.25)
        );
    }

    #[test]
    fn input_command_layout() {
        let command = InputCommand::new(3, 2000, 12, "move", vec![9; 8]);
        let bytes = encode_input_command(&command).unwrap();

        assert_eq!(bytes.len(), INPUT_COMMAND_HEADER_LEN + 4 + 8);
        assert_eq!(&bytes[0..8], &3u64.to_le_bytes());
        assert_eq!(&bytes[16..20], &12u32.to_le_bytes());
        assert_eq!(&bytes[22..26], b"move");
        assert_eq!(decode_input_command(&bytes).unwrap(), command);
    }

    #[test]
    fn header_only_truncation_is_rejected() {
        let bytes = position_update().encode().unwrap();

        let err = decode_state_update(&bytes[..21]).unwrap_err();
        assert!(matches!(err, ProtocolError::Truncated { field: "component count", .. }));

        let err = decode_state_update(&bytes[..STATE_UPDATE_HEADER_LEN]).unwrap_err();
        assert!(matches!(err, ProtocolError::Truncated { .. }));
    }

    #[test]
    fn every_prefix_is_rejected() {
        let update = StateUpdate::new(1, 2)
            .with_component(ComponentData::position(Vec2::ONE))
            .with_component(ComponentData::new("tag", b"abc".to_vec()));
        let bytes = update.encode().unwrap();
        for len in 0..bytes.len() {
            assert!(
                StateUpdate::decode(&bytes[..len]).is_err(),
                "prefix of {len} bytes decoded"
            );
        }

        let command = InputCommand::new(1, 2, 3, "fire", vec![1, 2, 3]);
        let bytes = command.encode().unwrap();
        for len in 0..bytes.len() {
            assert!(
                InputCommand::decode(&bytes[..len]).is_err(),
                "prefix of {len} bytes decoded"
            );
        }
    }

    #[test]
    fn oversized_length_prefix_does_not_allocate_or_panic() {
        let mut bytes = StateUpdate::new(1, 1).encode().unwrap();
        // claim 65535 components with nothing behind them
        bytes[21] = 0xFF;
        bytes[22] = 0xFF;
        assert!(matches!(
            StateUpdate::decode(&bytes),
            Err(ProtocolError::Truncated { .. })
        ));

        let mut bytes = InputCommand::new(1, 1, 1, "", Vec::new()).encode().unwrap();
        let len = bytes.len();
        bytes[len - 4..].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(
            InputCommand::decode(&bytes),
            Err(ProtocolError::Truncated { .. })
        ));
    }

    #[test]
    fn invalid_utf8_type_is_rejected() {
        let mut bytes = InputCommand::new(1, 1, 1, "ab", Vec::new()).encode().unwrap();
        bytes[22] = 0xFF;
        assert!(matches!(
            InputCommand::decode(&bytes),
            Err(ProtocolError::InvalidUtf8 { .. })
        ));
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut bytes = position_update().encode().unwrap();
        bytes.push(0);
        assert!(matches!(
            StateUpdate::decode(&bytes),
            Err(ProtocolError::TrailingBytes(1))
        ));
    }

    #[test]
    fn oversized_type_fails_to_encode() {
        let command = InputCommand::new(1, 1, 1, "x".repeat(MAX_TYPE_LEN + 1), Vec::new());
        assert!(matches!(
            command.encode(),
            Err(ProtocolError::FieldTooLong { .. })
        ));
    }

    #[test]
    fn malformed_component_payload() {
        let component = ComponentData::new(POSITION_COMPONENT, vec![0; 3]);
        assert!(matches!(
            component.as_vec2(),
            Err(ProtocolError::InvalidComponent { expected: 8, actual: 3, .. })
        ));
    }
}
