//! Additional unit tests for resize phase transitions

use postgres_storage_operator::controller::state_machine::{
    PhaseEvent, ResizeStateMachine, TransitionContext, TransitionResult, implied_phase,
};
use postgres_storage_operator::crd::ResizePhase;

mod requesting_transitions {
    use super::*;

    #[test]
    fn test_failed_request_stays_requesting() {
        let sm = ResizeStateMachine::new();
        let result = sm.transition(
            &ResizePhase::Requesting,
            PhaseEvent::RequestFailed,
            &TransitionContext::new(1, 0),
        );
        assert_eq!(result.phase(), ResizePhase::Requesting);
    }

    #[test]
    fn test_deferred_request_awaits_propagation() {
        let sm = ResizeStateMachine::new();
        let result = sm.transition(
            &ResizePhase::Requesting,
            PhaseEvent::RequestDeferred,
            &TransitionContext::new(0, 2),
        );
        assert_eq!(result.phase(), ResizePhase::AwaitingPropagation);
    }

    #[test]
    fn test_deferred_guard_requires_every_request_issued() {
        let sm = ResizeStateMachine::new();
        let result = sm.transition(
            &ResizePhase::Requesting,
            PhaseEvent::RequestDeferred,
            &TransitionContext::new(1, 1),
        );
        assert!(matches!(result, TransitionResult::GuardFailed { .. }));
        assert_eq!(result.phase(), ResizePhase::Requesting);
    }
}

mod propagation_transitions {
    use super::*;

    #[test]
    fn test_pending_propagation_keeps_waiting() {
        let sm = ResizeStateMachine::new();
        let result = sm.transition(
            &ResizePhase::AwaitingPropagation,
            PhaseEvent::PropagationPending,
            &TransitionContext::new(0, 1),
        );
        assert_eq!(result.phase(), ResizePhase::AwaitingPropagation);
    }

    #[test]
    fn test_observed_guard_requires_nothing_awaiting() {
        let sm = ResizeStateMachine::new();
        let result = sm.transition(
            &ResizePhase::AwaitingPropagation,
            PhaseEvent::PropagationObserved,
            &TransitionContext::new(0, 1),
        );
        match result {
            TransitionResult::GuardFailed { reason, .. } => {
                assert!(reason.contains("still propagating"));
            }
            other => panic!("expected guard failure, got {:?}", other),
        }
    }

    #[test]
    fn test_timeout_returns_to_idle() {
        let sm = ResizeStateMachine::new();
        let result = sm.transition(
            &ResizePhase::AwaitingPropagation,
            PhaseEvent::PropagationTimedOut,
            &TransitionContext::default(),
        );
        assert_eq!(result.phase(), ResizePhase::Idle);
    }

    #[test]
    fn test_new_trigger_while_propagating() {
        let sm = ResizeStateMachine::new();
        let result = sm.transition(
            &ResizePhase::AwaitingPropagation,
            PhaseEvent::TriggerFired,
            &TransitionContext::new(1, 1),
        );
        assert_eq!(result.phase(), ResizePhase::Requesting);
    }
}

mod phase_table_tests {
    use super::*;

    #[test]
    fn test_every_phase_has_an_exit() {
        let sm = ResizeStateMachine::new();
        for phase in [
            ResizePhase::Idle,
            ResizePhase::Evaluating,
            ResizePhase::Requesting,
            ResizePhase::AwaitingPropagation,
        ] {
            assert!(!sm.valid_events(&phase).is_empty(), "{} has no exit", phase);
        }
    }

    #[test]
    fn test_evaluating_cannot_skip_to_propagation() {
        let sm = ResizeStateMachine::new();
        assert!(!sm.can_transition(&ResizePhase::Evaluating, &PhaseEvent::RequestAccepted));
        assert!(!sm.can_transition(&ResizePhase::Idle, &PhaseEvent::TriggerFired));
    }

    #[test]
    fn test_implied_phase_prefers_requesting() {
        assert_eq!(implied_phase(&TransitionContext::new(1, 3)), ResizePhase::Requesting);
        assert_eq!(
            implied_phase(&TransitionContext::new(0, 3)),
            ResizePhase::AwaitingPropagation
        );
        assert_eq!(implied_phase(&TransitionContext::default()), ResizePhase::Idle);
    }
}
