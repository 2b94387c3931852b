//! Pipeline effects — the delivery state machine
//!
//! A pipeline yields effects instead of performing heavy operations. Any
//! effect can be serialized into a message route, transferred over the
//! broker, and re-entered at the place of execution. [`SendEffect`] is the
//! one concrete kind: an ordered list of output backends driven slot by
//! slot through [`OutputStatus`] transitions.

use crate::error::{CourierError, Result};
use crate::message::Message;
use crate::outputs::{OutputBackend, OutputRegistry, OutputSpec, SendError};
use std::sync::Arc;

/// Per-output delivery status inside a send effect's state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStatus {
    Pending = 1,
    Check = 2,
    Success = 3,
    Fail = 4,
    Retry = 5,
}

impl OutputStatus {
    /// Wire integer
    pub fn to_wire(self) -> u8 {
        self as u8
    }

    /// Parse the wire integer
    pub fn from_wire(value: u64) -> Result<Self> {
        match value {
            1 => Ok(OutputStatus::Pending),
            2 => Ok(OutputStatus::Check),
            3 => Ok(OutputStatus::Success),
            4 => Ok(OutputStatus::Fail),
            5 => Ok(OutputStatus::Retry),
            other => Err(CourierError::Codec(format!(
                "invalid output status: {other}"
            ))),
        }
    }
}

/// A concrete side effect the consumers perform for an effect
#[derive(Clone)]
pub enum Action {
    /// Send the message through the output
    Send(Arc<dyn OutputBackend>),
    /// Check delivery status on the output
    Check(Arc<dyn OutputBackend>),
}

impl Action {
    /// The output backend this action targets
    pub fn output(&self) -> &Arc<dyn OutputBackend> {
        match self {
            Action::Send(output) | Action::Check(output) => output,
        }
    }

    /// Invoke the backend
    pub fn execute(
        &self,
        message: &Message,
        retry: u32,
    ) -> std::result::Result<bool, SendError> {
        match self {
            Action::Send(output) => output.send(message, retry),
            Action::Check(output) => output.check(message),
        }
    }
}

impl std::fmt::Debug for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::Send(output) => write!(f, "Send({})", output.name()),
            Action::Check(output) => write!(f, "Check({})", output.name()),
        }
    }
}

/// Effect: send the message through an ordered list of outputs
///
/// State is a sequence of [`OutputStatus`], one slot per output. Outputs
/// are tried in declaration order; the effect is complete only when no
/// PENDING and no CHECK slot remains. A SUCCESS slot does not short-circuit
/// later PENDING slots.
#[derive(Debug, Clone)]
pub struct SendEffect {
    outputs: Vec<Arc<dyn OutputBackend>>,
}

impl SendEffect {
    pub fn new(outputs: Vec<Arc<dyn OutputBackend>>) -> Self {
        Self { outputs }
    }

    /// The configured outputs, in declaration order
    pub fn outputs(&self) -> &[Arc<dyn OutputBackend>] {
        &self.outputs
    }

    /// Serialized specs of the configured outputs
    pub fn output_specs(&self) -> Vec<OutputSpec> {
        self.outputs.iter().map(|o| o.spec()).collect()
    }

    /// Normalize a decoded state: fill an unset/empty state with PENDING
    /// slots and promote RETRY back to PENDING once no PENDING remains
    /// (the retry wave).
    fn normalized(&self, state: Option<Vec<OutputStatus>>) -> Vec<OutputStatus> {
        let mut state = match state {
            Some(state) if state.len() == self.outputs.len() => state,
            Some(state) if !state.is_empty() => {
                tracing::warn!(
                    expected = self.outputs.len(),
                    got = state.len(),
                    "Send effect state length mismatch, resetting"
                );
                vec![OutputStatus::Pending; self.outputs.len()]
            }
            _ => vec![OutputStatus::Pending; self.outputs.len()],
        };

        if !state.contains(&OutputStatus::Pending) && state.contains(&OutputStatus::Retry) {
            for slot in state.iter_mut() {
                if *slot == OutputStatus::Retry {
                    *slot = OutputStatus::Pending;
                }
            }
        }
        state
    }

    /// Position of the next actionable slot: first PENDING, else first CHECK
    fn next_pos(state: &[OutputStatus]) -> Option<usize> {
        state
            .iter()
            .position(|s| *s == OutputStatus::Pending)
            .or_else(|| state.iter().position(|s| *s == OutputStatus::Check))
    }

    fn action_at(&self, state: &[OutputStatus], pos: usize) -> Action {
        let output = Arc::clone(&self.outputs[pos]);
        if state[pos] == OutputStatus::Check {
            Action::Check(output)
        } else {
            Action::Send(output)
        }
    }

    /// Decode a wire state value; `Ok(None)` for unset/empty
    fn decode_state(&self, value: Option<&serde_json::Value>) -> Result<Option<Vec<OutputStatus>>> {
        let Some(value) = value else {
            return Ok(None);
        };
        if value.is_null() {
            return Ok(None);
        }
        let slots = value
            .as_array()
            .ok_or_else(|| CourierError::Codec(format!("send state is not an array: {value}")))?;
        if slots.is_empty() {
            return Ok(None);
        }
        slots
            .iter()
            .map(|slot| {
                slot.as_u64()
                    .ok_or_else(|| {
                        CourierError::Codec(format!("send state slot is not an integer: {slot}"))
                    })
                    .and_then(OutputStatus::from_wire)
            })
            .collect::<Result<Vec<_>>>()
            .map(Some)
    }

    /// Tolerant decode for the hot path: malformed state resets to unset
    fn decode_state_lossy(&self, value: Option<&serde_json::Value>) -> Option<Vec<OutputStatus>> {
        match self.decode_state(value) {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!(error = %e, "Invalid send effect state, resetting");
                None
            }
        }
    }

    fn encode_state(state: &[OutputStatus]) -> serde_json::Value {
        serde_json::Value::Array(
            state
                .iter()
                .map(|s| serde_json::Value::from(s.to_wire()))
                .collect(),
        )
    }
}

/// Convenience constructor mirroring the pipeline vocabulary:
/// `send([a, b])` yields a [`SendEffect`] over outputs `a` then `b`.
pub fn send(outputs: Vec<Arc<dyn OutputBackend>>) -> Effect {
    Effect::Send(SendEffect::new(outputs))
}

/// A serializable node of a delivery pipeline
///
/// The closed set of effect kinds; the wire name selects the variant when
/// decoding. Adding a kind means extending this enum and the codec match
/// in [`Effect::from_wire`].
#[derive(Debug, Clone)]
pub enum Effect {
    Send(SendEffect),
}

impl Effect {
    /// Registered wire name of this effect kind
    pub fn name(&self) -> &'static str {
        match self {
            Effect::Send(_) => "send",
        }
    }

    /// Wire form: `[name, args, kwargs]`
    pub fn to_wire(&self) -> serde_json::Value {
        match self {
            Effect::Send(effect) => {
                let args: Vec<serde_json::Value> =
                    effect.output_specs().iter().map(|s| s.to_wire()).collect();
                serde_json::json!(["send", args, {}])
            }
        }
    }

    /// Decode the wire form, resolving outputs against the registry
    pub fn from_wire(value: &serde_json::Value, registry: &OutputRegistry) -> Result<Self> {
        let parts = value
            .as_array()
            .ok_or_else(|| CourierError::Codec(format!("effect is not an array: {value}")))?;
        let name = parts
            .first()
            .and_then(|n| n.as_str())
            .ok_or_else(|| CourierError::Codec("effect has no name".to_string()))?;

        match name {
            "send" => {
                let args = match parts.get(1) {
                    Some(serde_json::Value::Array(args)) => args.as_slice(),
                    None | Some(serde_json::Value::Null) => &[],
                    Some(other) => {
                        return Err(CourierError::Codec(format!(
                            "send effect args is not an array: {other}"
                        )))
                    }
                };
                let outputs = args
                    .iter()
                    .map(|arg| OutputSpec::from_wire(arg).and_then(|spec| registry.build(&spec)))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Effect::Send(SendEffect::new(outputs)))
            }
            other => Err(CourierError::UnknownEffect(other.to_string())),
        }
    }

    /// Next action for this effect given the route state from the last
    /// `apply`, or `None` when the effect is complete
    pub fn next_action(&self, state: Option<&serde_json::Value>) -> Option<Action> {
        match self {
            Effect::Send(effect) => {
                let state = effect.normalized(effect.decode_state_lossy(state));
                let pos = SendEffect::next_pos(&state)?;
                Some(effect.action_at(&state, pos))
            }
        }
    }

    /// Apply the next action to the message and return the new state
    ///
    /// Updates the message's retry counter on a retry transition. Only an
    /// unexpected backend failure propagates; flow signals become slot
    /// transitions.
    pub fn apply(
        &self,
        message: &mut Message,
    ) -> std::result::Result<serde_json::Value, SendError> {
        match self {
            Effect::Send(effect) => {
                let mut state =
                    effect.normalized(effect.decode_state_lossy(message.route_state(self)));
                let Some(pos) = SendEffect::next_pos(&state) else {
                    return Ok(SendEffect::encode_state(&state));
                };
                let action = effect.action_at(&state, pos);
                let retry = message.route_retry(self);

                match action.execute(message, retry) {
                    Ok(false) => state[pos] = OutputStatus::Fail,
                    Ok(_) => state[pos] = OutputStatus::Success,
                    Err(SendError::CheckDelivery { .. }) => state[pos] = OutputStatus::Check,
                    Err(SendError::Retry { reason, .. }) => {
                        state[pos] = OutputStatus::Retry;
                        message.set_route_retry(self, retry + 1);
                        tracing::info!(
                            message_id = %message.id,
                            output = action.output().name(),
                            retry = retry + 1,
                            reason = %reason,
                            "Delivery retried"
                        );
                    }
                    Err(SendError::NoDeliveryCheck) => state[pos] = OutputStatus::Fail,
                    Err(err @ SendError::Failed(_)) => return Err(err),
                }

                Ok(SendEffect::encode_state(&state))
            }
        }
    }

    /// Mark the next actionable slot FAIL without invoking the backend
    ///
    /// Used when no consumer in the cluster serves the selected output.
    pub fn skip(&self, state: Option<&serde_json::Value>) -> serde_json::Value {
        match self {
            Effect::Send(effect) => {
                let mut state = effect.normalized(effect.decode_state_lossy(state));
                if let Some(pos) = SendEffect::next_pos(&state) {
                    state[pos] = OutputStatus::Fail;
                }
                SendEffect::encode_state(&state)
            }
        }
    }

    /// Strict state validation, used when decoding a message route
    pub fn validate_state(&self, state: &serde_json::Value) -> Result<()> {
        match self {
            Effect::Send(effect) => effect.decode_state(Some(state)).map(|_| ()),
        }
    }
}

impl PartialEq for Effect {
    fn eq(&self, other: &Self) -> bool {
        self.to_wire() == other.to_wire()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outputs::{
        CheckOutput, NeverDeliveredOutput, NullOutput, OutputRegistry, RetryOutput,
    };

    fn null_effect() -> Effect {
        send(vec![Arc::new(NullOutput::new())])
    }

    fn decode(state: &serde_json::Value) -> Vec<u64> {
        state
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_u64().unwrap())
            .collect()
    }

    #[test]
    fn test_send_simple() {
        let effect = null_effect();
        let mut message = Message::new("test_send_simple", "test_event");

        assert!(matches!(effect.next_action(None), Some(Action::Send(_))));

        let state = effect.apply(&mut message).unwrap();
        assert_eq!(decode(&state), vec![OutputStatus::Success.to_wire() as u64]);
        assert!(effect.next_action(Some(&state)).is_none());
    }

    #[test]
    fn test_fallback_state_sequence() {
        let effect = send(vec![
            Arc::new(NeverDeliveredOutput::new()),
            Arc::new(NullOutput::new()),
        ]);
        let mut message = Message::new("test_fallback", "test_event");

        let state = effect.apply(&mut message).unwrap();
        assert_eq!(decode(&state), vec![4, 1]); // [FAIL, PENDING]
        message.set_route_state(&effect, state.clone(), crate::message::EffectStatus::Pending);

        assert!(effect.next_action(Some(&state)).is_some());
        let state = effect.apply(&mut message).unwrap();
        assert_eq!(decode(&state), vec![4, 3]); // [FAIL, SUCCESS]
        assert!(effect.next_action(Some(&state)).is_none());
    }

    #[test]
    fn test_retry_wave() {
        let effect = send(vec![Arc::new(RetryOutput::new(2))]);
        let mut message = Message::new("test_retry", "test_event");

        // PENDING -> RETRY (retry 1)
        let state = effect.apply(&mut message).unwrap();
        assert_eq!(decode(&state), vec![5]);
        assert_eq!(message.route_retry(&effect), 1);
        message.set_route_state(&effect, state.clone(), crate::message::EffectStatus::Pending);

        // RETRY promoted back to PENDING, second attempt -> RETRY (retry 2)
        assert!(matches!(effect.next_action(Some(&state)), Some(Action::Send(_))));
        let state = effect.apply(&mut message).unwrap();
        assert_eq!(decode(&state), vec![5]);
        assert_eq!(message.route_retry(&effect), 2);
        message.set_route_state(&effect, state.clone(), crate::message::EffectStatus::Pending);

        // Third attempt reaches the threshold -> SUCCESS
        let state = effect.apply(&mut message).unwrap();
        assert_eq!(decode(&state), vec![3]);
        assert_eq!(message.route_retry(&effect), 2);
        assert!(effect.next_action(Some(&state)).is_none());
    }

    #[test]
    fn test_check_cycle() {
        let effect = send(vec![Arc::new(CheckOutput::new())]);
        let mut message = Message::new("test_check", "test_event");

        let state = effect.apply(&mut message).unwrap();
        assert_eq!(decode(&state), vec![2]); // [CHECK]
        message.set_route_state(&effect, state.clone(), crate::message::EffectStatus::Pending);

        assert!(matches!(effect.next_action(Some(&state)), Some(Action::Check(_))));

        let state = effect.apply(&mut message).unwrap();
        assert_eq!(decode(&state), vec![3]); // [SUCCESS]
        assert!(effect.next_action(Some(&state)).is_none());
    }

    #[test]
    fn test_success_does_not_short_circuit_pending() {
        let effect = send(vec![
            Arc::new(NullOutput::tagged(1)),
            Arc::new(NullOutput::tagged(2)),
        ]);
        let mut message = Message::new("test_no_short_circuit", "test_event");

        let state = effect.apply(&mut message).unwrap();
        assert_eq!(decode(&state), vec![3, 1]); // second output still pending
        assert!(effect.next_action(Some(&state)).is_some());
    }

    #[test]
    fn test_skip_marks_slot_fail() {
        let effect = send(vec![
            Arc::new(NullOutput::tagged(1)),
            Arc::new(NullOutput::tagged(2)),
        ]);
        let state = effect.skip(None);
        assert_eq!(decode(&state), vec![4, 1]);

        let state = effect.skip(Some(&state));
        assert_eq!(decode(&state), vec![4, 4]);
        assert!(effect.next_action(Some(&state)).is_none());
    }

    #[test]
    fn test_effect_wire_roundtrip() {
        let registry = OutputRegistry::with_builtins();
        let effect = send(vec![
            Arc::new(RetryOutput::new(2)),
            Arc::new(NullOutput::new()),
        ]);

        let wire = effect.to_wire();
        let parsed = Effect::from_wire(&wire, &registry).unwrap();
        assert_eq!(parsed, effect);
        assert_eq!(parsed.to_wire(), wire);
    }

    #[test]
    fn test_effect_from_wire_unknown_name() {
        let registry = OutputRegistry::with_builtins();
        let err = Effect::from_wire(&serde_json::json!(["call", [], {}]), &registry).unwrap_err();
        assert!(matches!(err, CourierError::UnknownEffect(_)));
    }

    #[test]
    fn test_malformed_state_resets() {
        let effect = null_effect();
        // Wrong length and garbage both reset to a fresh pending state
        let action = effect.next_action(Some(&serde_json::json!([1, 1, 1])));
        assert!(matches!(action, Some(Action::Send(_))));
        let action = effect.next_action(Some(&serde_json::json!("bogus")));
        assert!(matches!(action, Some(Action::Send(_))));
    }

    #[test]
    fn test_output_status_wire() {
        for (status, wire) in [
            (OutputStatus::Pending, 1),
            (OutputStatus::Check, 2),
            (OutputStatus::Success, 3),
            (OutputStatus::Fail, 4),
            (OutputStatus::Retry, 5),
        ] {
            assert_eq!(status.to_wire() as u64, wire);
            assert_eq!(OutputStatus::from_wire(wire).unwrap(), status);
        }
        assert!(OutputStatus::from_wire(0).is_err());
        assert!(OutputStatus::from_wire(6).is_err());
    }
}
