//! Finite state machine for the per-cluster resize phase
//!
//! The coordinator reports what happened during a tick as events; only the
//! transitions in the table below are accepted, so the persisted phase always
//! follows `Idle -> Evaluating -> Requesting -> AwaitingPropagation -> Idle`.

use std::fmt;

use crate::crd::ResizePhase;

/// Events that move the resize phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PhaseEvent {
    /// A tick started evaluating usage
    TickStarted,
    /// No volume needs a new resize
    NoTrigger,
    /// At least one new resize intent was recorded
    TriggerFired,
    /// Every outstanding request was accepted by the backend
    RequestAccepted,
    /// Every outstanding request was accepted, some awaiting pod recycling
    RequestDeferred,
    /// Some request could not be issued and will be retried
    RequestFailed,
    /// Every requested size is now committed
    PropagationObserved,
    /// The remaining requests gave up waiting for their size
    PropagationTimedOut,
    /// Some requested sizes are not committed yet
    PropagationPending,
}

impl fmt::Display for PhaseEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhaseEvent::TickStarted => write!(f, "TickStarted"),
            PhaseEvent::NoTrigger => write!(f, "NoTrigger"),
            PhaseEvent::TriggerFired => write!(f, "TriggerFired"),
            PhaseEvent::RequestAccepted => write!(f, "RequestAccepted"),
            PhaseEvent::RequestDeferred => write!(f, "RequestDeferred"),
            PhaseEvent::RequestFailed => write!(f, "RequestFailed"),
            PhaseEvent::PropagationObserved => write!(f, "PropagationObserved"),
            PhaseEvent::PropagationTimedOut => write!(f, "PropagationTimedOut"),
            PhaseEvent::PropagationPending => write!(f, "PropagationPending"),
        }
    }
}

/// Outstanding work at the time of a transition
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransitionContext {
    /// Intents whose request has not reached the backend
    pub requesting: usize,
    /// Intents waiting for their size to be committed
    pub awaiting: usize,
}

impl TransitionContext {
    pub fn new(requesting: usize, awaiting: usize) -> Self {
        Self {
            requesting,
            awaiting,
        }
    }
}

/// A state transition definition
#[derive(Debug)]
pub struct Transition {
    pub from: ResizePhase,
    pub to: ResizePhase,
    pub event: PhaseEvent,
    pub description: &'static str,
}

impl Transition {
    const fn new(
        from: ResizePhase,
        to: ResizePhase,
        event: PhaseEvent,
        description: &'static str,
    ) -> Self {
        Self {
            from,
            to,
            event,
            description,
        }
    }
}

/// Result of attempting a state transition
#[derive(Debug, PartialEq, Eq)]
pub enum TransitionResult {
    Success {
        from: ResizePhase,
        to: ResizePhase,
        event: PhaseEvent,
        description: &'static str,
    },
    InvalidTransition {
        current: ResizePhase,
        event: PhaseEvent,
    },
    GuardFailed {
        from: ResizePhase,
        to: ResizePhase,
        event: PhaseEvent,
        reason: String,
    },
}

impl TransitionResult {
    /// Phase after the attempt; unchanged unless the transition succeeded
    pub fn phase(&self) -> ResizePhase {
        match self {
            TransitionResult::Success { to, .. } => *to,
            TransitionResult::InvalidTransition { current, .. } => *current,
            TransitionResult::GuardFailed { from, .. } => *from,
        }
    }
}

pub struct ResizeStateMachine {
    transitions: Vec<Transition>,
}

impl Default for ResizeStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ResizeStateMachine {
    pub fn new() -> Self {
        use PhaseEvent as E;
        use ResizePhase as P;

        Self {
            transitions: vec![
                // === Idle ===
                Transition::new(P::Idle, P::Evaluating, E::TickStarted, "Evaluating volume usage"),
                // === Evaluating ===
                Transition::new(P::Evaluating, P::Idle, E::NoTrigger, "No volume needs resizing"),
                Transition::new(
                    P::Evaluating,
                    P::Requesting,
                    E::TriggerFired,
                    "Resize intent recorded",
                ),
                // === Requesting ===
                Transition::new(
                    P::Requesting,
                    P::AwaitingPropagation,
                    E::RequestAccepted,
                    "Storage backend accepted the new sizes",
                ),
                Transition::new(
                    P::Requesting,
                    P::AwaitingPropagation,
                    E::RequestDeferred,
                    "New sizes requested, waiting for pod recycling",
                ),
                Transition::new(
                    P::Requesting,
                    P::Requesting,
                    E::RequestFailed,
                    "Resize request will be retried",
                ),
                // === AwaitingPropagation ===
                Transition::new(
                    P::AwaitingPropagation,
                    P::Idle,
                    E::PropagationObserved,
                    "Requested sizes are committed",
                ),
                Transition::new(
                    P::AwaitingPropagation,
                    P::Idle,
                    E::PropagationTimedOut,
                    "Gave up waiting for requested sizes",
                ),
                Transition::new(
                    P::AwaitingPropagation,
                    P::AwaitingPropagation,
                    E::PropagationPending,
                    "Waiting for requested sizes",
                ),
                Transition::new(
                    P::AwaitingPropagation,
                    P::Requesting,
                    E::TriggerFired,
                    "Resize intent recorded while others propagate",
                ),
            ],
        }
    }

    /// Attempt a transition
    pub fn transition(
        &self,
        current: &ResizePhase,
        event: PhaseEvent,
        ctx: &TransitionContext,
    ) -> TransitionResult {
        let transition = self
            .transitions
            .iter()
            .find(|t| t.from == *current && t.event == event);

        match transition {
            Some(t) => {
                if let Some(reason) = self.check_guard(t, ctx) {
                    TransitionResult::GuardFailed {
                        from: t.from,
                        to: t.to,
                        event,
                        reason,
                    }
                } else {
                    TransitionResult::Success {
                        from: t.from,
                        to: t.to,
                        event,
                        description: t.description,
                    }
                }
            }
            None => TransitionResult::InvalidTransition {
                current: *current,
                event,
            },
        }
    }

    /// Check if a transition is valid (ignoring guards)
    pub fn can_transition(&self, from: &ResizePhase, event: &PhaseEvent) -> bool {
        self.transitions
            .iter()
            .any(|t| t.from == *from && t.event == *event)
    }

    /// Get all valid events for a given state
    pub fn valid_events(&self, state: &ResizePhase) -> Vec<&PhaseEvent> {
        self.transitions
            .iter()
            .filter(|t| t.from == *state)
            .map(|t| &t.event)
            .collect()
    }

    fn check_guard(&self, transition: &Transition, ctx: &TransitionContext) -> Option<String> {
        match (&transition.to, &transition.event) {
            (ResizePhase::AwaitingPropagation, PhaseEvent::RequestAccepted)
            | (ResizePhase::AwaitingPropagation, PhaseEvent::RequestDeferred)
                if ctx.requesting > 0 =>
            {
                Some(format!("{} request(s) not yet accepted", ctx.requesting))
            }
            (ResizePhase::Idle, PhaseEvent::PropagationObserved)
            | (ResizePhase::Idle, PhaseEvent::PropagationTimedOut)
                if ctx.awaiting > 0 =>
            {
                Some(format!("{} resize(s) still propagating", ctx.awaiting))
            }
            (ResizePhase::Idle, PhaseEvent::NoTrigger) if ctx.requesting + ctx.awaiting > 0 => {
                Some("resize intents are outstanding".to_string())
            }
            _ => None,
        }
    }
}

/// Phase implied by the outstanding intents alone
pub fn implied_phase(ctx: &TransitionContext) -> ResizePhase {
    if ctx.requesting > 0 {
        ResizePhase::Requesting
    } else if ctx.awaiting > 0 {
        ResizePhase::AwaitingPropagation
    } else {
        ResizePhase::Idle
    }
}
