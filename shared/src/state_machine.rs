//! Device Link State Machine
//!
//! Defines valid transitions while a device link is brought up:
//! `Disconnected -> Scanning -> Associating -> SocketBinding -> Ready`,
//! with a failure edge back to `Disconnected` from every state.

use std::fmt;

/// Lifecycle of the link to the active device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LinkState {
    #[default]
    Disconnected,
    Scanning,
    Associating,
    SocketBinding,
    Ready,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LinkState::Disconnected => "disconnected",
            LinkState::Scanning => "scanning",
            LinkState::Associating => "associating",
            LinkState::SocketBinding => "socket-binding",
            LinkState::Ready => "ready",
        })
    }
}

/// Events that can trigger link transitions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Access point scan started
    ScanStarted,
    /// Target SSID resolved to a network handle
    AccessPointResolved,
    /// Socket binding started (after association, or with no access point to join)
    BindStarted,
    /// Command and telemetry sockets are bound
    SocketsBound,
    /// Any step failed
    Failed { reason: String },
    /// Link released on purpose
    Released,
}

/// Result of a transition attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionResult {
    /// Transition was valid and state changed
    Success(LinkState),
    /// Transition was invalid from current state
    Invalid { from: LinkState, event: LinkEvent },
    /// A step failed and the link fell back to `Disconnected`
    Dropped { from: LinkState, reason: String },
}

/// State machine for the active device link
#[derive(Debug, Default)]
pub struct LinkStateMachine {
    current_state: LinkState,
}

impl LinkStateMachine {
    /// Create a new state machine in Disconnected state
    pub fn new() -> Self {
        Self::default()
    }

    /// Get current state
    pub fn state(&self) -> LinkState {
        self.current_state
    }

    pub fn is_ready(&self) -> bool {
        self.current_state == LinkState::Ready
    }

    /// Process an event and return the transition result
    pub fn process_event(&mut self, event: LinkEvent) -> TransitionResult {
        match event {
            LinkEvent::Failed { reason } => {
                let from = self.current_state;
                self.current_state = LinkState::Disconnected;
                return TransitionResult::Dropped { from, reason };
            }
            LinkEvent::Released => {
                self.current_state = LinkState::Disconnected;
                return TransitionResult::Success(LinkState::Disconnected);
            }
            _ => {}
        }

        match self.get_next_state(&event) {
            Some(state) => {
                self.current_state = state;
                TransitionResult::Success(state)
            }
            None => TransitionResult::Invalid {
                from: self.current_state,
                event,
            },
        }
    }

    /// Get the next state for a given event, if the transition is valid
    fn get_next_state(&self, event: &LinkEvent) -> Option<LinkState> {
        use LinkEvent::*;
        use LinkState::*;

        match (self.current_state, event) {
            (Disconnected, ScanStarted) => Some(Scanning),
            (Scanning, AccessPointResolved) => Some(Associating),

            // No access point to join, or already associated
            (Disconnected | Associating, BindStarted) => Some(SocketBinding),

            (SocketBinding, SocketsBound) => Some(Ready),

            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let fsm = LinkStateMachine::new();
        assert_eq!(fsm.state(), LinkState::Disconnected);
        assert!(!fsm.is_ready());
    }

    #[test]
    fn test_access_point_flow() {
        let mut fsm = LinkStateMachine::new();

        let result = fsm.process_event(LinkEvent::ScanStarted);
        assert_eq!(result, TransitionResult::Success(LinkState::Scanning));

        let result = fsm.process_event(LinkEvent::AccessPointResolved);
        assert_eq!(result, TransitionResult::Success(LinkState::Associating));

        let result = fsm.process_event(LinkEvent::BindStarted);
        assert_eq!(result, TransitionResult::Success(LinkState::SocketBinding));

        let result = fsm.process_event(LinkEvent::SocketsBound);
        assert_eq!(result, TransitionResult::Success(LinkState::Ready));
        assert!(fsm.is_ready());
    }

    #[test]
    fn test_direct_bind_without_access_point() {
        let mut fsm = LinkStateMachine::new();
        fsm.process_event(LinkEvent::BindStarted);
        fsm.process_event(LinkEvent::SocketsBound);
        assert_eq!(fsm.state(), LinkState::Ready);
    }

    #[test]
    fn test_failure_from_any_state() {
        let mut fsm = LinkStateMachine::new();
        fsm.process_event(LinkEvent::ScanStarted);
        fsm.process_event(LinkEvent::AccessPointResolved);

        let result = fsm.process_event(LinkEvent::Failed {
            reason: "association refused".into(),
        });
        assert!(matches!(
            result,
            TransitionResult::Dropped {
                from: LinkState::Associating,
                ..
            }
        ));
        assert_eq!(fsm.state(), LinkState::Disconnected);
    }

    #[test]
    fn test_invalid_transition() {
        let mut fsm = LinkStateMachine::new();

        // Can't be ready without binding first
        let result = fsm.process_event(LinkEvent::SocketsBound);
        assert!(matches!(result, TransitionResult::Invalid { .. }));
        assert_eq!(fsm.state(), LinkState::Disconnected);
    }

    #[test]
    fn test_release_from_ready() {
        let mut fsm = LinkStateMachine::new();
        fsm.process_event(LinkEvent::BindStarted);
        fsm.process_event(LinkEvent::SocketsBound);

        fsm.process_event(LinkEvent::Released);
        assert_eq!(fsm.state(), LinkState::Disconnected);
    }
}
