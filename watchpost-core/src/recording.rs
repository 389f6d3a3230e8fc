//! Recording state machine.
//!
//! Decides when a recording session starts, is extended and ends. The machine
//! is an explicit tagged state plus a pure transition function; the server's
//! recording controller feeds it events and carries out the returned
//! [`Effect`]s (opening the writer, finalizing the file).
//!
//! ```text
//!                 manual start / motion (enabled)
//!        ┌──────┐ ─────────────────────────────► ┌───────────────────────┐
//!        │ Idle │                                │ Recording{trigger,exp}│◄─┐ motion re-arms
//!        └──────┘ ◄─┐                            └───────────────────────┘ ─┘ (Motion trigger only)
//!                   │ finalized                     │ expiry / stop / source or
//!                   │                               │ write failure / shutdown
//!                   │         ┌────────────┐        │
//!                   └──────── │ Finalizing │ ◄──────┘
//!                             └────────────┘
//! ```
//!
//! Misuse (start while a session exists, stop with nothing recording) is
//! reported as a [`RecordingError`] and never changes the state.
//!
//! All times are milliseconds on the service clock.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::error::RecordingError;
use crate::motion::MotionEvent;

/// Session identifier, unique for the lifetime of the process
pub type SessionId = u64;

/// Fixed length of the motion recording window
pub const MOTION_WINDOW_MS: u64 = 180_000;

/// What started a recording session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Trigger {
    Manual,
    Motion,
}

/// Why a session is being finalized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "camelCase")]
pub enum FinalizeReason {
    Expired,
    Stopped,
    SourceFailure,
    WriteFailure,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecorderState {
    #[default]
    Idle,
    Recording {
        session: SessionId,
        trigger: Trigger,
        started_ms: u64,
        /// `None` for an unbounded manual session
        expiry_ms: Option<u64>,
    },
    /// Transient: the writer is being flushed, closed and registered
    Finalizing {
        session: SessionId,
        trigger: Trigger,
        started_ms: u64,
        reason: FinalizeReason,
    },
}

impl RecorderState {
    pub fn is_idle(&self) -> bool {
        matches!(self, RecorderState::Idle)
    }

    pub fn is_recording(&self) -> bool {
        matches!(self, RecorderState::Recording { .. })
    }

    pub fn session(&self) -> Option<SessionId> {
        match self {
            RecorderState::Idle => None,
            RecorderState::Recording { session, .. } | RecorderState::Finalizing { session, .. } => {
                Some(*session)
            }
        }
    }

    pub fn trigger(&self) -> Option<Trigger> {
        match self {
            RecorderState::Idle => None,
            RecorderState::Recording { trigger, .. } | RecorderState::Finalizing { trigger, .. } => {
                Some(*trigger)
            }
        }
    }

    pub fn elapsed_ms(&self, now_ms: u64) -> Option<u64> {
        match self {
            RecorderState::Idle => None,
            RecorderState::Recording { started_ms, .. }
            | RecorderState::Finalizing { started_ms, .. } => Some(now_ms.saturating_sub(*started_ms)),
        }
    }

    /// Time left until expiry; `None` when idle or unbounded.
    pub fn remaining_ms(&self, now_ms: u64) -> Option<u64> {
        match self {
            RecorderState::Recording {
                expiry_ms: Some(expiry),
                ..
            } => Some(expiry.saturating_sub(now_ms)),
            RecorderState::Finalizing { .. } => Some(0),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            RecorderState::Idle => "idle",
            RecorderState::Recording { .. } => "recording",
            RecorderState::Finalizing { .. } => "finalizing",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RecorderEvent {
    /// `None` falls back to the policy's default manual duration
    ManualStart { duration_ms: Option<u64> },
    ManualStop,
    Motion(MotionEvent),
    /// Periodic clock tick, used to detect expiry
    Tick,
    /// The camera source failed or was replaced mid-session
    SourceFailure,
    /// The session file could not be written
    WriteFailure,
    Shutdown,
    /// The writer has been closed and the file registered
    Finalized,
}

/// Side effects the owner of the machine must perform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    OpenSession {
        session: SessionId,
        trigger: Trigger,
    },
    Finalize {
        session: SessionId,
        reason: FinalizeReason,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingPolicy {
    /// Length of the rolling window a motion event opens or re-arms
    pub motion_window_ms: u64,
    /// Hard cap on a motion session measured from its start; `None` lets
    /// continuous motion keep the session open indefinitely
    pub max_motion_session_ms: Option<u64>,
    /// Used when a manual start gives no duration; `None` is unbounded
    pub default_manual_duration_ms: Option<u64>,
}

impl Default for RecordingPolicy {
    fn default() -> Self {
        RecordingPolicy {
            motion_window_ms: MOTION_WINDOW_MS,
            max_motion_session_ms: None,
            default_manual_duration_ms: None,
        }
    }
}

impl RecordingPolicy {
    fn motion_expiry(&self, started_ms: u64, now_ms: u64) -> u64 {
        let rolling = now_ms.saturating_add(self.motion_window_ms);
        match self.max_motion_session_ms {
            Some(max) => rolling.min(started_ms.saturating_add(max)),
            None => rolling,
        }
    }
}

/// Inputs to [`transition`] besides the state and event
#[derive(Debug, Clone, Copy)]
pub struct TransitionContext<'a> {
    pub policy: &'a RecordingPolicy,
    pub motion_enabled: bool,
    /// Id given to a session opened by this transition
    pub next_session: SessionId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub state: RecorderState,
    pub effects: Vec<Effect>,
}

impl Transition {
    fn unchanged(state: &RecorderState) -> Self {
        Transition {
            state: *state,
            effects: Vec::new(),
        }
    }

    fn finalize(
        session: SessionId,
        trigger: Trigger,
        started_ms: u64,
        reason: FinalizeReason,
    ) -> Self {
        Transition {
            state: RecorderState::Finalizing {
                session,
                trigger,
                started_ms,
                reason,
            },
            effects: vec![Effect::Finalize { session, reason }],
        }
    }
}

/// The transition function: state × event → state × effects.
pub fn transition(
    state: &RecorderState,
    event: RecorderEvent,
    now_ms: u64,
    ctx: &TransitionContext,
) -> Result<Transition, RecordingError> {
    use RecorderEvent as E;
    use RecorderState as S;

    let next = match (*state, event) {
        // -- Starting --------------------------------------------------------
        (S::Idle, E::ManualStart { duration_ms }) => {
            let duration = duration_ms.or(ctx.policy.default_manual_duration_ms);
            open(
                ctx.next_session,
                Trigger::Manual,
                now_ms,
                duration.map(|d| now_ms.saturating_add(d)),
            )
        }
        (S::Recording { .. } | S::Finalizing { .. }, E::ManualStart { .. }) => {
            return Err(RecordingError::AlreadyRecording);
        }
        (S::Idle, E::Motion(_)) if ctx.motion_enabled => open(
            ctx.next_session,
            Trigger::Motion,
            now_ms,
            Some(ctx.policy.motion_expiry(now_ms, now_ms)),
        ),

        // -- Extending -------------------------------------------------------
        (
            S::Recording {
                session,
                trigger: Trigger::Motion,
                started_ms,
                ..
            },
            E::Motion(_),
        ) if ctx.motion_enabled => Transition {
            state: S::Recording {
                session,
                trigger: Trigger::Motion,
                started_ms,
                expiry_ms: Some(ctx.policy.motion_expiry(started_ms, now_ms)),
            },
            effects: Vec::new(),
        },
        // Manual sessions, disabled detection and finalizing all ignore motion
        (_, E::Motion(_)) => Transition::unchanged(state),

        // -- Ending ----------------------------------------------------------
        (
            S::Recording {
                session,
                trigger,
                started_ms,
                ..
            },
            E::ManualStop,
        ) => Transition::finalize(session, trigger, started_ms, FinalizeReason::Stopped),
        (S::Idle | S::Finalizing { .. }, E::ManualStop) => {
            return Err(RecordingError::NotRecording);
        }
        (
            S::Recording {
                session,
                trigger,
                started_ms,
                expiry_ms: Some(expiry),
            },
            E::Tick,
        ) if now_ms >= expiry => {
            Transition::finalize(session, trigger, started_ms, FinalizeReason::Expired)
        }
        (
            S::Recording {
                session,
                trigger,
                started_ms,
                ..
            },
            E::SourceFailure | E::WriteFailure | E::Shutdown,
        ) => {
            let reason = match event {
                E::SourceFailure => FinalizeReason::SourceFailure,
                E::WriteFailure => FinalizeReason::WriteFailure,
                _ => FinalizeReason::Shutdown,
            };
            Transition::finalize(session, trigger, started_ms, reason)
        }
        (S::Finalizing { .. }, E::Finalized) => Transition {
            state: S::Idle,
            effects: Vec::new(),
        },

        _ => Transition::unchanged(state),
    };
    Ok(next)
}

fn open(session: SessionId, trigger: Trigger, now_ms: u64, expiry_ms: Option<u64>) -> Transition {
    Transition {
        state: RecorderState::Recording {
            session,
            trigger,
            started_ms: now_ms,
            expiry_ms,
        },
        effects: vec![Effect::OpenSession { session, trigger }],
    }
}

// =============================================================================
// Machine
// =============================================================================

/// Owns the current state and hands out session ids.
#[derive(Debug, Clone)]
pub struct RecorderMachine {
    state: RecorderState,
    policy: RecordingPolicy,
    next_session: SessionId,
}

impl RecorderMachine {
    pub fn new(policy: RecordingPolicy) -> Self {
        RecorderMachine {
            state: RecorderState::Idle,
            policy,
            next_session: 1,
        }
    }

    pub fn state(&self) -> &RecorderState {
        &self.state
    }

    pub fn policy(&self) -> &RecordingPolicy {
        &self.policy
    }

    /// Apply an event. On error the state is left untouched.
    pub fn handle(
        &mut self,
        event: RecorderEvent,
        now_ms: u64,
        motion_enabled: bool,
    ) -> Result<Vec<Effect>, RecordingError> {
        let ctx = TransitionContext {
            policy: &self.policy,
            motion_enabled,
            next_session: self.next_session,
        };
        let t = transition(&self.state, event, now_ms, &ctx)?;
        if t
            .effects
            .iter()
            .any(|e| matches!(e, Effect::OpenSession { .. }))
        {
            self.next_session += 1;
        }
        self.state = t.state;
        Ok(t.effects)
    }
}
