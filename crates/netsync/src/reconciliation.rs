//! Reconciliation of predicted state against authoritative server state.

use glam::Vec2;

use crate::net::{InputCommand, ProtocolError, StateUpdate, sequence_greater_than};
use crate::prediction::{PredictionEngine, PredictionError, PredictionModel};
use crate::snapshot::EntitySnapshot;

const ERROR_CORRECTION_SPEED: f32 = 20.0;
const ERROR_THRESHOLD: f32 = 0.0001;
const SNAP_THRESHOLD: f32 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Reconciliation {
    pub discarded: usize,
    pub replayed: usize,
    /// The acknowledgement was older than one already applied; nothing changed.
    pub stale: bool,
}

impl<M: PredictionModel> PredictionEngine<M> {
    /// Rebuilds the predicted state from the server's view.
    ///
    /// Inputs up to and including `acked_sequence` are dropped, the predicted state snaps to
    /// `authoritative`, and the remaining inputs are replayed in order. Repeating the call
    /// with the same arguments yields the same state.
    pub fn reconcile(&mut self, authoritative: M::State, acked_sequence: u32) -> Reconciliation {
        if let Some(last) = self.last_acked {
            if sequence_greater_than(last, acked_sequence) {
                return Reconciliation {
                    stale: true,
                    ..Default::default()
                };
            }
        }
        self.last_acked = Some(acked_sequence);

        let discarded = self.pending.acknowledge(acked_sequence);
        self.predicted = authoritative;

        let mut replayed = 0;
        for input in self.pending.iter() {
            self.model.apply_input(&mut self.predicted, input);
            replayed += 1;
        }

        Reconciliation {
            discarded,
            replayed,
            stale: false,
        }
    }
}

/// Hides the visible jump a correction causes by decaying a render-only offset.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CorrectionSmoother {
    offset: Vec2,
    speed: f32,
    snap_threshold: f32,
}

impl Default for CorrectionSmoother {
    fn default() -> Self {
        Self::new(ERROR_CORRECTION_SPEED, SNAP_THRESHOLD)
    }
}

impl CorrectionSmoother {
    pub fn new(speed: f32, snap_threshold: f32) -> Self {
        Self {
            offset: Vec2::ZERO,
            speed,
            snap_threshold,
        }
    }

    /// Records a correction of the logical position from `before` to `after`.
    pub fn correct(&mut self, before: Vec2, after: Vec2) {
        let error = after - before;
        let magnitude = error.length();
        if magnitude < ERROR_THRESHOLD {
            return;
        }

        if magnitude > self.snap_threshold {
            self.offset = Vec2::ZERO;
        } else {
            // Keep the rendered position where it was: new visual = new logic + offset.
            self.offset -= error;
        }
    }

    pub fn update(&mut self, dt: f32) {
        self.offset *= (-self.speed * dt).exp();
    }

    pub fn offset(&self) -> Vec2 {
        self.offset
    }

    pub fn reset(&mut self) {
        self.offset = Vec2::ZERO;
    }
}

/// Client glue: predicts the local entity and reconciles it against server updates.
#[derive(Debug, Clone)]
pub struct Reconciler<M: PredictionModel<State = EntitySnapshot>> {
    entity_id: u64,
    engine: PredictionEngine<M>,
    smoother: CorrectionSmoother,
}

impl<M: PredictionModel<State = EntitySnapshot>> Reconciler<M> {
    pub fn new(entity_id: u64, engine: PredictionEngine<M>) -> Self {
        Self {
            entity_id,
            engine,
            smoother: CorrectionSmoother::default(),
        }
    }

    pub fn entity_id(&self) -> u64 {
        self.entity_id
    }

    pub fn predict(&mut self, input: InputCommand) -> Result<&EntitySnapshot, PredictionError> {
        self.engine.predict(input)
    }

    /// Returns `None` for updates about other entities or without a position.
    ///
    /// An update without `input_ack` repeats the last acknowledgement (zero before the
    /// first one), so every input still pending is replayed on top of it.
    pub fn apply_update(
        &mut self,
        update: &StateUpdate,
    ) -> Result<Option<Reconciliation>, ProtocolError> {
        if update.entity_id != self.entity_id {
            return Ok(None);
        }
        let acked = match update.input_ack()? {
            Some(acked) => acked,
            None => self.engine.last_acked().unwrap_or(0),
        };
        let Some(authoritative) = EntitySnapshot::from_update(update)? else {
            return Ok(None);
        };

        let before = self.engine.predicted().position;
        let result = self.engine.reconcile(authoritative, acked);
        if !result.stale {
            self.smoother
                .correct(before, self.engine.predicted().position);
        }
        Ok(Some(result))
    }

    pub fn update(&mut self, dt: f32) {
        self.smoother.update(dt);
    }

    pub fn predicted(&self) -> &EntitySnapshot {
        self.engine.predicted()
    }

    /// Predicted position plus the decaying correction offset.
    pub fn visual_position(&self) -> Vec2 {
        self.engine.predicted().position + self.smoother.offset()
    }

    pub fn engine(&self) -> &PredictionEngine<M> {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut PredictionEngine<M> {
        &mut self.engine
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::ComponentData;
    use crate::prediction::{MOVE_INPUT, MovementModel};

    fn move_input(sequence: u32, direction: Vec2) -> InputCommand {
        InputCommand::new(1, 0, sequence, MOVE_INPUT, MovementModel::encode_move(direction))
    }

    fn engine() -> PredictionEngine<MovementModel> {
        PredictionEngine::new(MovementModel::new(1.0, 1.0), EntitySnapshot::new(1, Vec2::ZERO))
    }

    #[test]
    fn ack_replays_only_unacknowledged() {
        let mut engine = engine();
        for sequence in 10..=12 {
            engine.predict(move_input(sequence, Vec2::X)).unwrap();
        }

        let authoritative = EntitySnapshot::new(1, Vec2::new(5.0, 0.0));
        let result = engine.reconcile(authoritative, 11);

        assert_eq!(
            result,
            Reconciliation {
                discarded: 2,
                replayed: 1,
                stale: false
            }
        );
        let remaining: Vec<_> = engine.pending().iter().map(|i| i.sequence_number).collect();
        assert_eq!(remaining, vec![12]);
        assert_eq!(engine.predicted().position, Vec2::new(6.0, 0.0));
    }

    #[test]
    fn reconcile_is_idempotent() {
        let mut engine = engine();
        for sequence in 1..=3 {
            engine.predict(move_input(sequence, Vec2::Y)).unwrap();
        }
        let authoritative = EntitySnapshot::new(1, Vec2::new(0.0, 0.5));

        engine.reconcile(authoritative, 1);
        let first = *engine.predicted();
        let again = engine.reconcile(authoritative, 1);
        assert!(!again.stale);
        assert_eq!(*engine.predicted(), first);
        assert_eq!(first.position, Vec2::new(0.0, 2.5));
    }

    #[test]
    fn older_ack_is_stale() {
        let mut engine = engine();
        for sequence in 1..=3 {
            engine.predict(move_input(sequence, Vec2::X)).unwrap();
        }
        engine.reconcile(EntitySnapshot::new(1, Vec2::new(2.0, 0.0)), 2);
        let predicted = *engine.predicted();

        let result = engine.reconcile(EntitySnapshot::new(1, Vec2::new(-50.0, 0.0)), 1);
        assert!(result.stale);
        assert_eq!(*engine.predicted(), predicted);
    }

    #[test]
    fn smoother_hides_small_corrections() {
        let mut smoother = CorrectionSmoother::default();
        smoother.correct(Vec2::ZERO, Vec2::new(0.5, 0.0));
        assert_eq!(smoother.offset(), Vec2::new(-0.5, 0.0));

        smoother.update(0.05);
        assert!(smoother.offset().x > -0.5);
        assert!(smoother.offset().x < 0.0);

        // Large corrections snap.
        smoother.correct(Vec2::ZERO, Vec2::new(3.0, 0.0));
        assert_eq!(smoother.offset(), Vec2::ZERO);
    }

    #[test]
    fn reconciler_uses_input_ack_component() {
        let mut reconciler = Reconciler::new(1, engine());
        for sequence in 1..=3 {
            reconciler.predict(move_input(sequence, Vec2::X)).unwrap();
        }
        assert_eq!(reconciler.predicted().position, Vec2::new(3.0, 0.0));

        // Another entity is ignored.
        let other = EntitySnapshot::new(2, Vec2::ONE).to_update(100);
        assert_eq!(reconciler.apply_update(&other).unwrap(), None);

        // Server applied inputs 1..=2 and landed slightly off the prediction.
        let update = EntitySnapshot::new(1, Vec2::new(2.2, 0.0))
            .to_update(100)
            .with_component(ComponentData::input_ack(2));
        let result = reconciler.apply_update(&update).unwrap().unwrap();
        assert_eq!(result.discarded, 2);
        assert_eq!(result.replayed, 1);

        let predicted = reconciler.predicted().position;
        assert!((predicted - Vec2::new(3.2, 0.0)).length() < 1e-5);
        // Visual stays near the old prediction until the offset decays.
        assert!((reconciler.visual_position() - Vec2::new(3.0, 0.0)).length() < 1e-5);
    }

    #[test]
    fn update_without_ack_keeps_last_acknowledgement() {
        let mut reconciler = Reconciler::new(1, engine());
        for sequence in 1..=3 {
            reconciler.predict(move_input(sequence, Vec2::X)).unwrap();
        }
        let acked = EntitySnapshot::new(1, Vec2::new(1.0, 0.0))
            .to_update(100)
            .with_component(ComponentData::input_ack(1));
        reconciler.apply_update(&acked).unwrap().unwrap();

        // No ack: inputs 2 and 3 are still pending and replay on the new position.
        let bare = EntitySnapshot::new(1, Vec2::new(1.0, 1.0)).to_update(150);
        let result = reconciler.apply_update(&bare).unwrap().unwrap();
        assert!(!result.stale);
        assert_eq!(result.discarded, 0);
        assert_eq!(result.replayed, 2);
        assert_eq!(reconciler.engine().last_acked(), Some(1));
        assert!((reconciler.predicted().position - Vec2::new(3.0, 1.0)).length() < 1e-5);
    }
}
