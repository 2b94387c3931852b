//! Message router — selects and applies the next pipeline effect
//!
//! The router runs the declarative output pipeline for a message and tracks
//! progress on the message route. It is a pure state machine: all broker
//! interaction happens in the consumers.

use crate::effects::Effect;
use crate::message::{EffectStatus, Message};
use crate::outputs::{OutputBackend, SendError};
use std::sync::Arc;

/// A resolved output pipeline: yields the effects for a message in order
pub type PipelineFn = Arc<dyn Fn(&Message) -> Vec<Effect> + Send + Sync>;

/// Routes messages through the effects of a delivery pipeline
#[derive(Clone)]
pub struct Router {
    pipeline: PipelineFn,
}

impl Router {
    /// Router over a resolved pipeline function
    pub fn new(pipeline: PipelineFn) -> Self {
        Self { pipeline }
    }

    /// Sugar for a list of backends: one send effect over all of them
    pub fn from_outputs(outputs: Vec<Arc<dyn OutputBackend>>) -> Self {
        Self::new(Arc::new(move |_message: &Message| {
            vec![crate::effects::send(outputs.clone())]
        }))
    }

    /// First yielded effect whose route status is PENDING (or absent),
    /// or `None` when the pipeline is exhausted
    pub fn next_effect(&self, message: &Message) -> Option<Effect> {
        (self.pipeline)(message).into_iter().find(|effect| {
            matches!(
                message.route_status(effect),
                None | Some(EffectStatus::Pending)
            )
        })
    }

    /// Apply the next effect to the message and record the new state
    ///
    /// The route entry is marked FINISHED when the effect has no further
    /// action, PENDING otherwise. A backend failure propagates with the
    /// route left pending; broker-level re-publish drives the retry.
    pub fn apply_next_effect(
        &self,
        message: &mut Message,
    ) -> std::result::Result<(), SendError> {
        let Some(effect) = self.next_effect(message) else {
            return Ok(());
        };

        let state = effect.apply(message)?;
        let status = if effect.next_action(Some(&state)).is_none() {
            EffectStatus::Finished
        } else {
            EffectStatus::Pending
        };
        message.set_route_state(&effect, state, status);
        Ok(())
    }

    /// Mark the next action of the current effect as skipped (slot FAIL)
    /// without invoking the backend
    ///
    /// Used by the message consumer when the selected output has no live
    /// consumer in the cluster. Returns false when the pipeline is already
    /// exhausted.
    pub fn skip_next_effect(&self, message: &mut Message) -> bool {
        let Some(effect) = self.next_effect(message) else {
            return false;
        };

        let state = effect.skip(message.route_state(&effect));
        let status = if effect.next_action(Some(&state)).is_none() {
            EffectStatus::Finished
        } else {
            EffectStatus::Pending
        };
        message.set_route_state(&effect, state, status);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effects::{send, Action};
    use crate::outputs::{NeverDeliveredOutput, NullOutput};

    fn simple_pipeline() -> PipelineFn {
        Arc::new(|_message: &Message| vec![send(vec![Arc::new(NullOutput::new())])])
    }

    fn sequence_pipeline() -> PipelineFn {
        Arc::new(|_message: &Message| {
            vec![
                send(vec![Arc::new(NullOutput::tagged(2))]),
                send(vec![Arc::new(NullOutput::tagged(1))]),
            ]
        })
    }

    #[test]
    fn test_simple_pipeline() {
        let router = Router::new(simple_pipeline());
        let mut message = Message::new("test_simple", "example_event");

        let effect = router.next_effect(&message).unwrap();
        assert_eq!(effect.name(), "send");

        router.apply_next_effect(&mut message).unwrap();

        assert_eq!(message.route.len(), 1);
        assert_eq!(message.route[0].effect, effect);
        assert_eq!(message.route[0].status, EffectStatus::Finished);
        assert!(router.next_effect(&message).is_none());
    }

    #[test]
    fn test_sequence_pipeline() {
        let router = Router::new(sequence_pipeline());
        let mut message = Message::new("test_sequence", "example_event");

        let effect = router.next_effect(&message).unwrap();
        let Some(Action::Send(output)) = effect.next_action(None) else {
            panic!("expected a send action");
        };
        assert_eq!(output.spec().kwargs["test_arg"], 2);

        router.apply_next_effect(&mut message).unwrap();
        assert_eq!(message.route.len(), 1);
        assert_eq!(message.route[0].status, EffectStatus::Finished);

        // The second yielded effect is now the next one
        let effect = router.next_effect(&message).unwrap();
        let Some(Action::Send(output)) = effect.next_action(None) else {
            panic!("expected a send action");
        };
        assert_eq!(output.spec().kwargs["test_arg"], 1);

        router.apply_next_effect(&mut message).unwrap();
        assert_eq!(message.route.len(), 2);
        assert!(router.next_effect(&message).is_none());
    }

    #[test]
    fn test_from_outputs_sugar() {
        let router = Router::from_outputs(vec![
            Arc::new(NullOutput::tagged(1)),
            Arc::new(NullOutput::tagged(2)),
        ]);
        let mut message = Message::new("test_sugar", "example_event");

        // Both slots of the single send effect must complete
        router.apply_next_effect(&mut message).unwrap();
        assert_eq!(message.route[0].status, EffectStatus::Pending);
        router.apply_next_effect(&mut message).unwrap();
        assert_eq!(message.route[0].status, EffectStatus::Finished);
        assert!(router.next_effect(&message).is_none());
    }

    #[test]
    fn test_skip_next_effect() {
        let router = Router::new(Arc::new(|_m: &Message| {
            vec![send(vec![Arc::new(NeverDeliveredOutput::new())])]
        }));
        let mut message = Message::new("test_skip", "example_event");

        assert!(router.skip_next_effect(&mut message));
        assert_eq!(message.route[0].status, EffectStatus::Finished);
        assert!(router.next_effect(&message).is_none());

        // Exhausted pipeline: nothing to skip
        assert!(!router.skip_next_effect(&mut message));
    }

    #[test]
    fn test_apply_on_exhausted_pipeline_is_noop() {
        let router = Router::new(simple_pipeline());
        let mut message = Message::new("test_noop", "example_event");
        router.apply_next_effect(&mut message).unwrap();
        let route = message.route.clone();

        router.apply_next_effect(&mut message).unwrap();
        assert_eq!(message.route, route);
    }
}
