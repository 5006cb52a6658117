use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use thiserror::Error;

use crate::catalog::{Trial, TrialSet};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SequenceError {
    #[error("Presentation order already drawn for this session")]
    AlreadyStarted,
    #[error("Presentation order has not been drawn yet")]
    NotStarted,
    #[error("The run is complete")]
    RunComplete,
    #[error("Trial at position {0} has not been recorded")]
    TrialNotRecorded(usize),
}

/// What the cursor points at.
#[derive(Debug, PartialEq, Eq)]
pub enum Current<'a> {
    Trial {
        position: usize,
        index: usize,
        trial: &'a Trial,
    },
    Done,
}

/// Owns the randomized trial order and the cursor into it.
///
/// The order is drawn once per session by [`start`](Self::start); `advance`
/// only moves past a trial after [`mark_recorded`](Self::mark_recorded).
#[derive(Debug, Clone)]
pub struct TrialSequencer {
    trials: TrialSet,
    order: Vec<usize>,
    seed: Option<u64>,
    position: usize,
    recorded: bool,
}

impl TrialSequencer {
    pub fn new(trials: TrialSet) -> Self {
        Self {
            trials,
            order: Vec::new(),
            seed: None,
            position: 0,
            recorded: false,
        }
    }

    /// Draw a uniform permutation of `0..len`. A fresh seed is drawn when
    /// `seed` is `None`; either way it is kept so the order can be reproduced.
    pub fn start(&mut self, seed: Option<u64>) -> Result<&[usize], SequenceError> {
        if self.seed.is_some() {
            return Err(SequenceError::AlreadyStarted);
        }
        let seed = seed.unwrap_or_else(rand::random);
        let mut rng = StdRng::seed_from_u64(seed);

        let mut order: Vec<usize> = (0..self.trials.len()).collect();
        order.shuffle(&mut rng);

        log::debug!("Presentation order (seed {seed}): {order:?}");
        self.order = order;
        self.seed = Some(seed);
        self.position = 0;
        self.recorded = false;
        Ok(&self.order)
    }

    pub fn is_started(&self) -> bool {
        self.seed.is_some()
    }

    pub fn seed(&self) -> Option<u64> {
        self.seed
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn len(&self) -> usize {
        self.trials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trials.is_empty()
    }

    pub fn is_done(&self) -> bool {
        self.is_started() && self.position >= self.order.len()
    }

    /// The trial at the cursor, or `Done` past the last one.
    pub fn current(&self) -> Result<Current<'_>, SequenceError> {
        if !self.is_started() {
            return Err(SequenceError::NotStarted);
        }
        let Some(&index) = self.order.get(self.position) else {
            return Ok(Current::Done);
        };
        let trial = self
            .trials
            .get(index)
            .ok_or(SequenceError::NotStarted)?;
        Ok(Current::Trial {
            position: self.position,
            index,
            trial,
        })
    }

    /// Note that the trial at the cursor has been durably recorded.
    pub fn mark_recorded(&mut self) -> Result<(), SequenceError> {
        if self.is_done() {
            return Err(SequenceError::RunComplete);
        }
        if !self.is_started() {
            return Err(SequenceError::NotStarted);
        }
        self.recorded = true;
        Ok(())
    }

    /// Move past a recorded trial. Returns the new position.
    pub fn advance(&mut self) -> Result<usize, SequenceError> {
        if !self.is_started() {
            return Err(SequenceError::NotStarted);
        }
        if self.is_done() {
            return Err(SequenceError::RunComplete);
        }
        if !self.recorded {
            return Err(SequenceError::TrialNotRecorded(self.position));
        }
        self.recorded = false;
        self.position += 1;
        Ok(self.position)
    }

    /// Drop the drawn order and rewind; the next `start` draws a new one.
    pub fn reset(&mut self) {
        self.order.clear();
        self.seed = None;
        self.position = 0;
        self.recorded = false;
    }
}
