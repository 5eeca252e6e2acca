//! Client-side prediction: apply local input immediately, keep it until the server
//! acknowledges it.

use bytes::{Buf, BufMut};
use glam::Vec2;

use crate::net::{InputCommand, sequence_greater_than};
use crate::snapshot::EntitySnapshot;

/// Enough for 5 seconds of unacknowledged input at 50 inputs per second.
pub const DEFAULT_PENDING_CAPACITY: usize = 256;
pub const MOVE_INPUT: &str = "move";
pub const DEFAULT_MOVE_SPEED: f32 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PredictionError {
    #[error("pending input buffer is full ({capacity} unacknowledged inputs)")]
    BufferFull { capacity: usize },
    #[error("input {sequence} is not newer than {newest}")]
    OutOfOrder { sequence: u32, newest: u32 },
}

/// The deterministic effect of one input, shared by client prediction and the server.
pub trait PredictionModel {
    type State: Clone;

    fn apply_input(&self, state: &mut Self::State, input: &InputCommand);
}

/// Top-down movement: a `"move"` input carries a direction as two little-endian `f32`s.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MovementModel {
    pub speed: f32,
    /// Seconds of motion each input represents.
    pub dt: f32,
}

impl Default for MovementModel {
    fn default() -> Self {
        Self::new(DEFAULT_MOVE_SPEED, 1.0 / 20.0)
    }
}

impl MovementModel {
    pub fn new(speed: f32, dt: f32) -> Self {
        Self { speed, dt }
    }

    pub fn encode_move(direction: Vec2) -> Vec<u8> {
        let mut data = Vec::with_capacity(8);
        data.put_f32_le(direction.x);
        data.put_f32_le(direction.y);
        data
    }

    pub fn decode_move(input: &InputCommand) -> Option<Vec2> {
        if input.input_type != MOVE_INPUT || input.data.len() != 8 {
            return None;
        }
        let mut data = input.data.as_slice();
        Some(Vec2::new(data.get_f32_le(), data.get_f32_le()))
    }
}

impl PredictionModel for MovementModel {
    type State = EntitySnapshot;

    fn apply_input(&self, state: &mut EntitySnapshot, input: &InputCommand) {
        let Some(direction) = Self::decode_move(input) else {
            return;
        };
        state.velocity = direction.normalize_or_zero() * self.speed;
        state.position += state.velocity * self.dt;
    }
}

/// Unacknowledged inputs in a fixed ring indexed by `sequence % capacity`.
///
/// The capacity is rounded up to a power of two so the index stays contiguous across
/// sequence wrap-around. A full buffer rejects new inputs rather than evicting ones the
/// server has not yet acknowledged.
#[derive(Debug, Clone)]
pub struct PendingInputBuffer {
    slots: Vec<Option<InputCommand>>,
    oldest: Option<u32>,
    newest: Option<u32>,
    len: usize,
}

impl Default for PendingInputBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_PENDING_CAPACITY)
    }
}

impl PendingInputBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1).next_power_of_two();
        Self {
            slots: vec![None; capacity],
            oldest: None,
            newest: None,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Highest sequence ever pushed, acknowledged or not.
    pub fn newest(&self) -> Option<u32> {
        self.newest
    }

    pub fn oldest(&self) -> Option<u32> {
        self.oldest
    }

    pub fn push(&mut self, input: InputCommand) -> Result<(), PredictionError> {
        let sequence = input.sequence_number;
        if let Some(newest) = self.newest {
            if !sequence_greater_than(sequence, newest) {
                return Err(PredictionError::OutOfOrder { sequence, newest });
            }
        }
        if let Some(oldest) = self.oldest {
            if sequence.wrapping_sub(oldest) as usize >= self.capacity() {
                return Err(PredictionError::BufferFull {
                    capacity: self.capacity(),
                });
            }
        }

        let index = self.index(sequence);
        self.slots[index] = Some(input);
        self.oldest.get_or_insert(sequence);
        self.newest = Some(sequence);
        self.len += 1;
        Ok(())
    }

    pub fn get(&self, sequence: u32) -> Option<&InputCommand> {
        self.slots[self.index(sequence)]
            .as_ref()
            .filter(|input| input.sequence_number == sequence)
    }

    /// Drops every entry with sequence ≤ `sequence`. Returns how many were dropped.
    pub fn acknowledge(&mut self, sequence: u32) -> usize {
        let (Some(oldest), Some(newest)) = (self.oldest, self.newest) else {
            return 0;
        };

        let mut removed = 0;
        let mut next_oldest = None;
        for offset in 0..=newest.wrapping_sub(oldest) {
            let current = oldest.wrapping_add(offset);
            let index = self.index(current);
            let Some(input) = &self.slots[index] else {
                continue;
            };
            if input.sequence_number != current {
                continue;
            }
            if sequence_greater_than(current, sequence) {
                next_oldest = Some(current);
                break;
            }
            self.slots[index] = None;
            removed += 1;
        }

        self.len -= removed;
        self.oldest = next_oldest;
        removed
    }

    /// Pending inputs in ascending sequence order.
    pub fn iter(&self) -> impl Iterator<Item = &InputCommand> + '_ {
        let span = match (self.oldest, self.newest) {
            (Some(oldest), Some(newest)) => Some((oldest, newest.wrapping_sub(oldest))),
            _ => None,
        };
        span.into_iter().flat_map(move |(oldest, span)| {
            (0..=span).filter_map(move |offset| self.get(oldest.wrapping_add(offset)))
        })
    }

    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
        self.oldest = None;
        self.newest = None;
        self.len = 0;
    }

    fn index(&self, sequence: u32) -> usize {
        sequence as usize & (self.slots.len() - 1)
    }
}

/// Holds the provisional local state and the inputs that produced it.
#[derive(Debug, Clone)]
pub struct PredictionEngine<M: PredictionModel> {
    pub(crate) model: M,
    pub(crate) predicted: M::State,
    pub(crate) pending: PendingInputBuffer,
    pub(crate) last_acked: Option<u32>,
}

impl<M: PredictionModel> PredictionEngine<M> {
    pub fn new(model: M, initial: M::State) -> Self {
        Self::with_capacity(model, initial, DEFAULT_PENDING_CAPACITY)
    }

    pub fn with_capacity(model: M, initial: M::State, capacity: usize) -> Self {
        Self {
            model,
            predicted: initial,
            pending: PendingInputBuffer::new(capacity),
            last_acked: None,
        }
    }

    /// Buffers the input and applies it to the predicted state right away.
    pub fn predict(&mut self, input: InputCommand) -> Result<&M::State, PredictionError> {
        self.pending.push(input.clone())?;
        self.model.apply_input(&mut self.predicted, &input);
        Ok(&self.predicted)
    }

    pub fn predicted(&self) -> &M::State {
        &self.predicted
    }

    pub fn pending(&self) -> &PendingInputBuffer {
        &self.pending
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn last_acked(&self) -> Option<u32> {
        self.last_acked
    }

    pub fn reset(&mut self, state: M::State) {
        self.predicted = state;
        self.pending.clear();
        self.last_acked = None;
    }
}
