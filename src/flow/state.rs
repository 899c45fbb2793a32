//! Flow engine state machine and flow type codes.

use std::sync::Mutex;

use tracing::{debug, warn};

/// Engine state. Same-state transitions are no-ops; anything outside the
/// permitted adjacency set is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlowState {
    #[default]
    Idle,
    Running,
    Paused,
    Resuming,
    Cancelling,
}

impl FlowState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Resuming => "resuming",
            Self::Cancelling => "cancelling",
        }
    }
}

impl std::fmt::Display for FlowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pure transition predicate; all locking stays in the mutating entry
/// point.
pub fn valid_transition(from: FlowState, to: FlowState) -> bool {
    use FlowState::*;
    if from == to {
        return true;
    }
    match from {
        Idle => matches!(to, Running),
        Running => matches!(to, Paused | Cancelling | Idle),
        Paused => matches!(to, Resuming | Cancelling | Running),
        Resuming => matches!(to, Running),
        Cancelling => matches!(to, Idle),
    }
}

/// Mutex-protected state holder used by the engine.
#[derive(Default)]
pub(crate) struct FlowStateMachine {
    state: Mutex<FlowState>,
}

impl FlowStateMachine {
    pub(crate) fn state(&self) -> FlowState {
        *self.state.lock().unwrap()
    }

    /// Attempt a transition, returning whether it was applied (or was a
    /// same-state no-op).
    pub(crate) fn transition(&self, to: FlowState) -> bool {
        let mut state = self.state.lock().unwrap();
        let from = *state;
        if !valid_transition(from, to) {
            warn!(%from, %to, "rejected flow state transition");
            return false;
        }
        if from != to {
            *state = to;
            debug!(%from, %to, "flow state transition");
        }
        true
    }

    /// Hard reset to `Idle` regardless of the transition rules; used by
    /// cleanup after completion or cancellation.
    pub(crate) fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        if *state != FlowState::Idle {
            debug!(from = %*state, "flow state reset to idle");
            *state = FlowState::Idle;
        }
    }
}

/// Closed enumeration of flows with stable integer codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowType {
    GetAppInfo = 0,
    RecoverAccount = 1,
    LoadAccount = 2,
    Login = 3,
    ExportPublic = 4,
    Sign = 5,
    ChangePin = 6,
    ChangePuk = 7,
    ChangePairing = 8,
    GetMetadata = 12,
    StoreMetadata = 13,
}

impl FlowType {
    /// Resolve a stable integer code.
    pub const fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::GetAppInfo),
            1 => Some(Self::RecoverAccount),
            2 => Some(Self::LoadAccount),
            3 => Some(Self::Login),
            4 => Some(Self::ExportPublic),
            5 => Some(Self::Sign),
            6 => Some(Self::ChangePin),
            7 => Some(Self::ChangePuk),
            8 => Some(Self::ChangePairing),
            12 => Some(Self::GetMetadata),
            13 => Some(Self::StoreMetadata),
            _ => None,
        }
    }

    pub const fn code(self) -> i32 {
        self as i32
    }
}

#[cfg(test)]
mod tests {
    use super::FlowState::*;
    use super::*;

    const ALL: [FlowState; 5] = [Idle, Running, Paused, Resuming, Cancelling];

    #[test]
    fn full_adjacency_matrix() {
        let permitted = [
            (Idle, Running),
            (Running, Paused),
            (Running, Cancelling),
            (Running, Idle),
            (Paused, Resuming),
            (Paused, Cancelling),
            (Paused, Running),
            (Resuming, Running),
            (Cancelling, Idle),
        ];
        for from in ALL {
            for to in ALL {
                let expected = from == to || permitted.contains(&(from, to));
                assert_eq!(
                    valid_transition(from, to),
                    expected,
                    "transition {from:?} -> {to:?}"
                );
            }
        }
    }

    #[test]
    fn machine_rejects_invalid_and_allows_noop() {
        let machine = FlowStateMachine::default();
        assert_eq!(machine.state(), Idle);
        assert!(machine.transition(Idle));
        assert!(!machine.transition(Paused));
        assert!(machine.transition(Running));
        assert!(machine.transition(Paused));
        assert!(machine.transition(Resuming));
        assert!(machine.transition(Running));
        machine.reset();
        assert_eq!(machine.state(), Idle);
    }

    #[test]
    fn codes_are_stable() {
        for (code, flow) in [
            (0, FlowType::GetAppInfo),
            (1, FlowType::RecoverAccount),
            (2, FlowType::LoadAccount),
            (3, FlowType::Login),
            (4, FlowType::ExportPublic),
            (5, FlowType::Sign),
            (6, FlowType::ChangePin),
            (7, FlowType::ChangePuk),
            (8, FlowType::ChangePairing),
            (12, FlowType::GetMetadata),
            (13, FlowType::StoreMetadata),
        ] {
            assert_eq!(FlowType::from_code(code), Some(flow));
            assert_eq!(flow.code(), code);
        }
        assert_eq!(FlowType::from_code(9), None);
        assert_eq!(FlowType::from_code(-1), None);
    }
}
