use std::fmt;

use thiserror::Error;

/// A sub-step of a trial with its own play-before-rate gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Single,
    Chord,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Single => write!(f, "single"),
            Self::Chord => write!(f, "chord"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GateError {
    #[error("The {0} phase must be played before it can be rated")]
    NotPlayed(Phase),
    #[error("Expected the {expected} phase, got {got}")]
    PhaseOutOfOrder { expected: Phase, got: Phase },
    #[error("The {0} phase rating has not been confirmed")]
    NotConfirmed(Phase),
    #[error("All phases of this trial are already confirmed")]
    TrialComplete,
    #[error("Rating values must be between {min} and {max}, got {value}")]
    OutOfRange { value: u8, min: u8, max: u8 },
}

/// Lowest and highest point of each rating scale.
pub const RATING_MIN: u8 = 1;
pub const RATING_MAX: u8 = 5;

/// One confirmed rating triple, each value in `1..=5`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rating {
    valence: u8,
    arousal: u8,
    diff: u8,
}

impl Rating {
    pub fn new(valence: u8, arousal: u8, diff: u8) -> Result<Self, GateError> {
        for value in [valence, arousal, diff] {
            if !(RATING_MIN..=RATING_MAX).contains(&value) {
                return Err(GateError::OutOfRange {
                    value,
                    min: RATING_MIN,
                    max: RATING_MAX,
                });
            }
        }
        Ok(Self {
            valence,
            arousal,
            diff,
        })
    }

    pub fn valence(&self) -> u8 {
        self.valence
    }

    pub fn arousal(&self) -> u8 {
        self.arousal
    }

    pub fn diff(&self) -> u8 {
        self.diff
    }
}

/// Playback state of the active phase. `play_count > 0` iff played.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PhaseState {
    play_count: u32,
}

impl PhaseState {
    pub fn played(&self) -> bool {
        self.play_count > 0
    }

    pub fn play_count(&self) -> u32 {
        self.play_count
    }
}

/// A phase whose rating has been confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfirmedPhase {
    pub phase: Phase,
    pub rating: Rating,
    pub play_count: u32,
}

/// Per-trial gate: phases in fixed order, each must be played before rating.
///
/// ```text
/// NotPlayed --play--> Played --play--> Played (count += 1)
///                       |
///                    confirm --> next phase (reset) | trial complete
/// ```
#[derive(Debug, Clone)]
pub struct PhaseGate {
    phases: &'static [Phase],
    current: usize,
    state: PhaseState,
    confirmed: Vec<ConfirmedPhase>,
}

impl PhaseGate {
    pub fn new(phases: &'static [Phase]) -> Self {
        Self {
            phases,
            current: 0,
            state: PhaseState::default(),
            confirmed: Vec::with_capacity(phases.len()),
        }
    }

    /// The phase awaiting play/rating, or `None` once all are confirmed.
    pub fn active(&self) -> Option<Phase> {
        if self.confirmed.len() > self.current {
            // Confirmed but not yet moved on
            return None;
        }
        self.phases.get(self.current).copied()
    }

    pub fn state(&self) -> PhaseState {
        self.state
    }

    pub fn phases(&self) -> &'static [Phase] {
        self.phases
    }

    pub fn confirmed(&self) -> &[ConfirmedPhase] {
        &self.confirmed
    }

    /// True when `phase` is the last phase of the trial.
    pub fn is_final(&self, phase: Phase) -> bool {
        self.phases.last() == Some(&phase)
    }

    /// Error unless `phase` is the one currently awaiting play/rating.
    pub fn ensure_active(&self, phase: Phase) -> Result<(), GateError> {
        match self.active() {
            Some(expected) if expected == phase => Ok(()),
            Some(expected) => Err(GateError::PhaseOutOfOrder {
                expected,
                got: phase,
            }),
            None if self.is_complete() => Err(GateError::TrialComplete),
            // Current phase confirmed, next one not entered yet
            None => Err(GateError::PhaseOutOfOrder {
                expected: self.phases[self.current + 1],
                got: phase,
            }),
        }
    }

    /// Register a play action. Returns the new play count.
    pub fn play(&mut self, phase: Phase) -> Result<u32, GateError> {
        self.ensure_active(phase)?;
        self.state.play_count += 1;
        Ok(self.state.play_count)
    }

    /// Whether `phase` may be rated right now.
    pub fn can_rate(&self, phase: Phase) -> bool {
        self.active() == Some(phase) && self.state.played()
    }

    /// Validate a rating for `phase` without changing state.
    ///
    /// Called at submission time, so a stale view can't bypass the gate.
    pub fn check_rate(&self, phase: Phase) -> Result<(), GateError> {
        self.ensure_active(phase)?;
        if !self.state.played() {
            return Err(GateError::NotPlayed(phase));
        }
        Ok(())
    }

    /// The confirmed phases plus `rating` for `phase`, as they would be
    /// after [`confirm`](Self::confirm). Leaves the gate untouched.
    pub fn preview(&self, phase: Phase, rating: Rating) -> Result<Vec<ConfirmedPhase>, GateError> {
        self.check_rate(phase)?;
        let mut all = self.confirmed.clone();
        all.push(ConfirmedPhase {
            phase,
            rating,
            play_count: self.state.play_count,
        });
        Ok(all)
    }

    /// Confirm the rating of the active phase.
    pub fn confirm(&mut self, phase: Phase, rating: Rating) -> Result<(), GateError> {
        self.check_rate(phase)?;
        self.confirmed.push(ConfirmedPhase {
            phase,
            rating,
            play_count: self.state.play_count,
        });
        Ok(())
    }

    /// True iff the current phase's rating has been confirmed and another phase follows.
    pub fn can_enter_next_phase(&self) -> bool {
        self.confirmed.len() > self.current && self.current + 1 < self.phases.len()
    }

    /// Move to the next phase with a fresh play state.
    pub fn enter_next_phase(&mut self) -> Result<Phase, GateError> {
        if !self.can_enter_next_phase() {
            return match self.phases.get(self.current) {
                Some(&p) if self.confirmed.len() <= self.current => Err(GateError::NotConfirmed(p)),
                _ => Err(GateError::TrialComplete),
            };
        }
        self.current += 1;
        self.state = PhaseState::default();
        Ok(self.phases[self.current])
    }

    /// All phases confirmed.
    pub fn is_complete(&self) -> bool {
        self.confirmed.len() == self.phases.len()
    }

    /// Back to the first phase, nothing played or confirmed.
    pub fn reset(&mut self) {
        *self = Self::new(self.phases);
    }
}
