use std::path::PathBuf;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use thiserror::Error;

use crate::catalog::{self, Catalog, CatalogError, OrphanPolicy, StimulusDirs, StimulusStore, Trial};
use crate::gate::{GateError, Phase, PhaseGate, Rating};
use crate::playback::{AudioSink, NullSink, PlaybackError};
use crate::recorder::{Clock, RecordError, ResponseRecorder, ResultRecord, SystemClock};
use crate::sequencer::{Current, SequenceError, TrialSequencer};
use crate::table::TableError;

static PARTICIPANT_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_]+$").unwrap());

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Invalid participant ID '{0}'")]
    InvalidIdentifier(String),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error("Could not read stimulus {}", .0.display())]
    StimulusReadFailure(PathBuf),
    #[error("Playback of {name} failed: {source}")]
    PlaybackFailed {
        name: String,
        #[source]
        source: PlaybackError,
    },
    #[error(transparent)]
    Gate(#[from] GateError),
    #[error(transparent)]
    Sequence(#[from] SequenceError),
    #[error("Could not save the result: {0}")]
    AppendFailure(#[source] TableError),
    #[error(transparent)]
    Record(RecordError),
}

impl From<RecordError> for SessionError {
    fn from(e: RecordError) -> Self {
        match e {
            RecordError::Append(t) => Self::AppendFailure(t),
            other => Self::Record(other),
        }
    }
}

impl SessionError {
    /// Hint shown next to the error message, if there is one.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::InvalidIdentifier(_) => Some("Use only letters, digits and underscores."),
            Self::Catalog(e) => Some(e.hint()),
            Self::StimulusReadFailure(_) => {
                Some("Check that the file exists and is readable, then press play again.")
            }
            Self::PlaybackFailed { .. } => Some("Check the player command in the config file."),
            Self::Gate(GateError::NotPlayed(_)) => Some("Play the stimulus before rating it."),
            Self::AppendFailure(_) => {
                Some("Your ratings are kept. Check write permissions on the results file, then confirm again.")
            }
            _ => None,
        }
    }

    /// Errors after which the session cannot continue.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Catalog(_))
    }
}

/// Who is at the keyboard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    Participant(String),
    Admin,
}

impl Identity {
    /// The admin PIN, when configured, takes precedence over the ID format check.
    pub fn parse(input: &str, admin_pin: Option<&str>) -> Result<Self, SessionError> {
        let input = input.trim();
        if admin_pin.is_some_and(|pin| !pin.is_empty() && pin == input) {
            return Ok(Self::Admin);
        }
        validate_participant_id(input).map(Self::Participant)
    }
}

/// Trimmed participant ID, if it matches `^[A-Za-z0-9_]+$`.
pub fn validate_participant_id(input: &str) -> Result<String, SessionError> {
    let input = input.trim();
    if PARTICIPANT_ID_RE.is_match(input) {
        Ok(input.to_string())
    } else {
        Err(SessionError::InvalidIdentifier(input.to_string()))
    }
}

/// A participant action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Play(Phase),
    ConfirmRating(Phase, Rating),
    Advance,
}

/// Result of applying a [`Command`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Played {
        phase: Phase,
        play_count: u32,
        stimuli: Vec<String>,
    },
    PhaseConfirmed {
        next: Phase,
    },
    TrialRecorded {
        record: ResultRecord,
        position: usize,
        finished: bool,
    },
    Advanced {
        position: usize,
        finished: bool,
    },
}

/// Everything one participant's run owns. Nothing here is shared between
/// sessions; the results table lives in [`Experiment`].
#[derive(Debug, Clone)]
pub struct SessionState {
    participant_id: String,
    sequencer: TrialSequencer,
    gate: PhaseGate,
}

impl SessionState {
    pub fn participant_id(&self) -> &str {
        &self.participant_id
    }

    pub fn sequencer(&self) -> &TrialSequencer {
        &self.sequencer
    }

    pub fn gate(&self) -> &PhaseGate {
        &self.gate
    }

    pub fn current_trial(&self) -> Option<&Trial> {
        match self.sequencer.current() {
            Ok(Current::Trial { trial, .. }) => Some(trial),
            _ => None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.sequencer.is_done()
    }

    /// Snapshot for rendering.
    pub fn view(&self) -> View {
        let trial = self.current_trial();
        let phase = trial.and(self.gate.active());
        View {
            participant_id: self.participant_id.clone(),
            position: self.sequencer.position(),
            total: self.sequencer.len(),
            trial_label: trial.map(Trial::label),
            phase,
            stimuli: match (trial, phase) {
                (Some(t), Some(p)) => t.stimuli(p).iter().map(|f| f.name.clone()).collect(),
                _ => Vec::new(),
            },
            play_count: self.gate.state().play_count(),
            can_rate: phase.is_some_and(|p| self.gate.can_rate(p)),
            finished: self.is_finished(),
        }
    }
}

/// What the participant should see right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct View {
    pub participant_id: String,
    pub position: usize,
    pub total: usize,
    pub trial_label: Option<String>,
    pub phase: Option<Phase>,
    pub stimuli: Vec<String>,
    pub play_count: u32,
    pub can_rate: bool,
    pub finished: bool,
}

/// Shared experiment wiring: stimulus source, results recorder, player, clock.
pub struct Experiment {
    store: Arc<dyn StimulusStore>,
    dirs: StimulusDirs,
    orphans: OrphanPolicy,
    recorder: ResponseRecorder,
    sink: Box<dyn AudioSink>,
    clock: Box<dyn Clock>,
}

impl Experiment {
    pub fn new(
        store: Arc<dyn StimulusStore>,
        dirs: StimulusDirs,
        orphans: OrphanPolicy,
        recorder: ResponseRecorder,
    ) -> Self {
        Self {
            store,
            dirs,
            orphans,
            recorder,
            sink: Box::new(NullSink),
            clock: Box::new(SystemClock),
        }
    }

    pub fn with_sink(mut self, sink: Box<dyn AudioSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_clock(mut self, clock: Box<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Discover the trial set from the configured directories.
    pub fn catalog(&self) -> Result<Catalog, CatalogError> {
        catalog::discover(self.store.as_ref(), self.recorder.variant(), &self.dirs, self.orphans)
    }

    /// Start a run for `participant_id` with a freshly drawn order.
    pub fn begin(&self, participant_id: &str, seed: Option<u64>) -> Result<SessionState, SessionError> {
        let participant_id = validate_participant_id(participant_id)?;

        let catalog = self.catalog()?;
        let mut sequencer = TrialSequencer::new(catalog.trials);
        sequencer.start(seed)?;

        let gate = match sequencer.current()? {
            Current::Trial { trial, .. } => PhaseGate::new(trial.phases()),
            Current::Done => return Err(SequenceError::RunComplete.into()),
        };

        log::info!(
            "Session started for {}: {} trials, seed {}",
            participant_id,
            sequencer.len(),
            sequencer.seed().unwrap_or_default()
        );
        Ok(SessionState {
            participant_id,
            sequencer,
            gate,
        })
    }

    /// Fresh state for the same participant: catalog rebuilt, order redrawn.
    pub fn reset(&self, state: &SessionState, seed: Option<u64>) -> Result<SessionState, SessionError> {
        log::info!("Resetting session for {}", state.participant_id);
        self.begin(&state.participant_id, seed)
    }

    /// Apply one participant command to `state`.
    ///
    /// On error `state` is left as it was, so the same command can be retried.
    pub fn apply(&self, state: &mut SessionState, command: Command) -> Result<Outcome, SessionError> {
        match command {
            Command::Play(phase) => self.play(state, phase),
            Command::ConfirmRating(phase, rating) => self.confirm(state, phase, rating),
            Command::Advance => self.advance(state),
        }
    }

    fn play(&self, state: &mut SessionState, phase: Phase) -> Result<Outcome, SessionError> {
        let trial = match state.sequencer.current()? {
            Current::Trial { trial, .. } => trial,
            Current::Done => return Err(SequenceError::RunComplete.into()),
        };
        state.gate.ensure_active(phase)?;

        // Read everything first so a missing B doesn't leave A half-counted.
        let mut clips = Vec::new();
        for file in trial.stimuli(phase) {
            let path = file.path();
            let bytes = self
                .store
                .read_bytes(&path)
                .ok_or(SessionError::StimulusReadFailure(path))?;
            clips.push((file.name.clone(), bytes));
        }

        for (name, bytes) in &clips {
            self.sink
                .play(name, bytes)
                .map_err(|source| SessionError::PlaybackFailed {
                    name: name.clone(),
                    source,
                })?;
        }

        let play_count = state.gate.play(phase)?;
        log::debug!("{} played {} phase ({}x)", state.participant_id, phase, play_count);
        Ok(Outcome::Played {
            phase,
            play_count,
            stimuli: clips.into_iter().map(|(name, _)| name).collect(),
        })
    }

    fn confirm(&self, state: &mut SessionState, phase: Phase, rating: Rating) -> Result<Outcome, SessionError> {
        let trial = match state.sequencer.current()? {
            Current::Trial { trial, .. } => trial,
            Current::Done => return Err(SequenceError::RunComplete.into()),
        };

        if !state.gate.is_final(phase) {
            state.gate.confirm(phase, rating)?;
            let next = state.gate.enter_next_phase()?;
            return Ok(Outcome::PhaseConfirmed { next });
        }

        // Final phase: append first, touch state only once the row is durable.
        let phases = state.gate.preview(phase, rating)?;
        let record = self
            .recorder
            .record_trial(&state.participant_id, trial, &phases, self.clock.as_ref())?;

        state.gate.confirm(phase, rating)?;
        state.sequencer.mark_recorded()?;
        match self.advance(state)? {
            Outcome::Advanced { position, finished } => Ok(Outcome::TrialRecorded {
                record,
                position,
                finished,
            }),
            other => Ok(other),
        }
    }

    fn advance(&self, state: &mut SessionState) -> Result<Outcome, SessionError> {
        let position = state.sequencer.advance()?;
        let finished = match state.sequencer.current()? {
            Current::Trial { trial, .. } => {
                state.gate = PhaseGate::new(trial.phases());
                false
            }
            Current::Done => {
                log::info!("Run complete for {}", state.participant_id);
                true
            }
        };
        Ok(Outcome::Advanced { position, finished })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Variant;
    use crate::catalog::tests::{MemoryStore, dirs, paired_store};
    use crate::recorder::tests::{FlakyTable, fixed_clock};
    use crate::table::memory::MemoryTable;
    use crate::table::{AppendOnlyTable, parse_csv};
    use std::sync::Mutex;

    /// Sink that remembers what it was asked to play.
    struct RecordingSink {
        played: Arc<Mutex<Vec<String>>>,
    }

    impl AudioSink for RecordingSink {
        fn play(&self, name: &str, _bytes: &[u8]) -> Result<(), PlaybackError> {
            self.played.lock().unwrap().push(name.to_string());
            Ok(())
        }
    }

    fn experiment(store: MemoryStore, table: Arc<dyn AppendOnlyTable>, variant: Variant) -> Experiment {
        let recorder = ResponseRecorder::new(table, variant);
        Experiment::new(Arc::new(store), dirs(), OrphanPolicy::Silent, recorder)
            .with_clock(Box::new(fixed_clock()))
    }

    fn rating(v: u8) -> Rating {
        Rating::new(v, v, v).unwrap()
    }

    fn complete_paired_trial(exp: &Experiment, state: &mut SessionState) -> Outcome {
        exp.apply(state, Command::Play(Phase::Single)).unwrap();
        exp.apply(state, Command::ConfirmRating(Phase::Single, rating(2))).unwrap();
        exp.apply(state, Command::Play(Phase::Chord)).unwrap();
        exp.apply(state, Command::ConfirmRating(Phase::Chord, rating(4))).unwrap()
    }

    #[test]
    fn test_identity_parse() {
        assert_eq!(Identity::parse("P_01", Some("9999")).unwrap(), Identity::Participant("P_01".into()));
        assert_eq!(Identity::parse(" 9999 ", Some("9999")).unwrap(), Identity::Admin);
        assert_eq!(Identity::parse("9999", None).unwrap(), Identity::Participant("9999".into()));
        assert!(matches!(Identity::parse("p-01", None), Err(SessionError::InvalidIdentifier(_))));
        assert!(Identity::parse("", Some("")).is_err());
        assert!(Identity::parse("名前", None).is_err());
    }

    #[test]
    fn test_begin_rejects_bad_id() {
        let exp = experiment(paired_store(), Arc::new(MemoryTable::new()), Variant::Paired);
        let err = exp.begin("bad id", Some(1)).unwrap_err();
        assert!(matches!(err, SessionError::InvalidIdentifier(_)));
        assert!(err.hint().is_some());
    }

    #[test]
    fn test_begin_reports_empty_catalog() {
        let store = MemoryStore::default().with("single", &["A_x.wav"]).with("chord", &[]);
        let exp = experiment(store, Arc::new(MemoryTable::new()), Variant::Paired);
        let err = exp.begin("P01", None).unwrap_err();
        assert!(matches!(err, SessionError::Catalog(CatalogError::NoPairsFormed { .. })));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_rating_rejected_before_play() {
        let table = Arc::new(MemoryTable::new());
        let exp = experiment(paired_store(), table.clone(), Variant::Paired);
        let mut state = exp.begin("P01", Some(5)).unwrap();

        let err = exp
            .apply(&mut state, Command::ConfirmRating(Phase::Single, rating(5)))
            .unwrap_err();
        assert!(matches!(err, SessionError::Gate(GateError::NotPlayed(Phase::Single))));
        assert!(!state.view().can_rate);
        assert_eq!(table.row_count().unwrap(), 0);
    }

    #[test]
    fn test_play_reads_and_counts() {
        let played = Arc::new(Mutex::new(Vec::new()));
        let sink = RecordingSink { played: played.clone() };
        let exp = experiment(paired_store(), Arc::new(MemoryTable::new()), Variant::Paired)
            .with_sink(Box::new(sink));
        let mut state = exp.begin("P01", Some(5)).unwrap();
        let key = state.view().trial_label.unwrap();

        let out = exp.apply(&mut state, Command::Play(Phase::Single)).unwrap();
        assert_eq!(
            out,
            Outcome::Played {
                phase: Phase::Single,
                play_count: 1,
                stimuli: vec![format!("A_{key}.wav"), format!("B_{key}.wav")],
            }
        );
        exp.apply(&mut state, Command::Play(Phase::Single)).unwrap();
        assert_eq!(state.gate().state().play_count(), 2);
        assert!(state.view().can_rate);
        assert_eq!(played.lock().unwrap().len(), 4);
    }

    #[test]
    fn test_chord_unreachable_before_single() {
        let exp = experiment(paired_store(), Arc::new(MemoryTable::new()), Variant::Paired);
        let mut state = exp.begin("P01", Some(5)).unwrap();
        let err = exp.apply(&mut state, Command::Play(Phase::Chord)).unwrap_err();
        assert!(matches!(err, SessionError::Gate(GateError::PhaseOutOfOrder { .. })));
        assert_eq!(state.gate().state().play_count(), 0);
    }

    #[test]
    fn test_missing_stimulus_bytes() {
        // B files are listed but can't be read
        struct MissingB(MemoryStore);

        impl StimulusStore for MissingB {
            fn list_files(&self, dir: &std::path::Path) -> Result<Vec<String>, CatalogError> {
                self.0.list_files(dir)
            }

            fn read_bytes(&self, path: &std::path::Path) -> Option<Vec<u8>> {
                let name = path.file_name()?.to_str()?;
                if name.starts_with("B_") {
                    return None;
                }
                self.0.read_bytes(path)
            }
        }

        let played = Arc::new(Mutex::new(Vec::new()));
        let table = Arc::new(MemoryTable::new());
        let recorder = ResponseRecorder::new(table.clone(), Variant::Paired);
        let exp = Experiment::new(Arc::new(MissingB(paired_store())), dirs(), OrphanPolicy::Silent, recorder)
            .with_sink(Box::new(RecordingSink { played: played.clone() }));
        let mut state = exp.begin("P01", Some(1)).unwrap();

        let err = exp.apply(&mut state, Command::Play(Phase::Single)).unwrap_err();
        assert!(matches!(err, SessionError::StimulusReadFailure(ref p) if p.starts_with("single")));
        assert!(err.hint().is_some());
        assert!(!state.gate().state().played());
        assert!(played.lock().unwrap().is_empty());
        assert_eq!(table.row_count().unwrap(), 0);
    }

    #[test]
    fn test_full_trial_appends_one_row_and_advances() {
        let table = Arc::new(MemoryTable::new());
        let exp = experiment(paired_store(), table.clone(), Variant::Paired);
        let mut state = exp.begin("P01", Some(9)).unwrap();
        let first = state.view().trial_label.unwrap();

        let out = complete_paired_trial(&exp, &mut state);
        match out {
            Outcome::TrialRecorded { record, position, finished } => {
                assert_eq!(position, 1);
                assert!(!finished);
                // single rating survives the chord phase
                assert_eq!(record.phases[0].rating, rating(2));
                assert_eq!(record.phases[1].rating, rating(4));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(table.row_count().unwrap(), 1);
        assert_eq!(state.sequencer().position(), 1);

        let rows = parse_csv(&table.export_csv().unwrap());
        assert_eq!(rows[1][2], first);
        assert_eq!(&rows[1][6..10], &["2", "2", "2", "1"]);

        // next trial starts from a clean gate
        assert_eq!(state.gate().active(), Some(Phase::Single));
        assert!(!state.gate().state().played());
    }

    #[test]
    fn test_retry_after_append_failure() {
        let table = Arc::new(FlakyTable::new(false));
        let exp = experiment(paired_store(), table.clone(), Variant::Paired);
        let mut state = exp.begin("P01", Some(9)).unwrap();

        exp.apply(&mut state, Command::Play(Phase::Single)).unwrap();
        exp.apply(&mut state, Command::ConfirmRating(Phase::Single, rating(2))).unwrap();
        exp.apply(&mut state, Command::Play(Phase::Chord)).unwrap();

        table.set_failing(true);
        let err = exp
            .apply(&mut state, Command::ConfirmRating(Phase::Chord, rating(4)))
            .unwrap_err();
        assert!(matches!(err, SessionError::AppendFailure(_)));
        assert!(err.hint().is_some());
        assert_eq!(state.sequencer().position(), 0);
        assert_eq!(state.gate().confirmed().len(), 1);
        assert!(state.gate().can_rate(Phase::Chord));

        table.set_failing(false);
        let out = exp
            .apply(&mut state, Command::ConfirmRating(Phase::Chord, rating(4)))
            .unwrap();
        assert!(matches!(out, Outcome::TrialRecorded { position: 1, .. }));
        assert_eq!(table.row_count().unwrap(), 1);
        assert_eq!(state.sequencer().position(), 1);
    }

    #[test]
    fn test_advance_rejected_without_recording() {
        let exp = experiment(paired_store(), Arc::new(MemoryTable::new()), Variant::Paired);
        let mut state = exp.begin("P01", Some(9)).unwrap();
        let err = exp.apply(&mut state, Command::Advance).unwrap_err();
        assert!(matches!(err, SessionError::Sequence(SequenceError::TrialNotRecorded(0))));

        complete_paired_trial(&exp, &mut state);
        // the confirm already advanced; a second advance is refused
        assert!(exp.apply(&mut state, Command::Advance).is_err());
        assert_eq!(state.sequencer().position(), 1);
    }

    #[test]
    fn test_run_terminates() {
        let table = Arc::new(MemoryTable::new());
        let exp = experiment(paired_store(), table.clone(), Variant::Paired);
        let mut state = exp.begin("P01", None).unwrap();

        complete_paired_trial(&exp, &mut state);
        let last = complete_paired_trial(&exp, &mut state);
        assert!(matches!(last, Outcome::TrialRecorded { position: 2, finished: true, .. }));
        assert!(state.is_finished());
        assert!(state.view().finished);
        assert_eq!(state.view().trial_label, None);

        let err = exp.apply(&mut state, Command::Play(Phase::Single)).unwrap_err();
        assert!(matches!(err, SessionError::Sequence(SequenceError::RunComplete)));
        let err = exp
            .apply(&mut state, Command::ConfirmRating(Phase::Chord, rating(1)))
            .unwrap_err();
        assert!(matches!(err, SessionError::Sequence(SequenceError::RunComplete)));
        assert_eq!(table.row_count().unwrap(), 2);
    }

    #[test]
    fn test_single_variant_run() {
        let store = MemoryStore::default().with("single", &["tone1.wav", "tone2.wav", "tone3.wav"]);
        let table = Arc::new(MemoryTable::new());
        let exp = experiment(store, table.clone(), Variant::Single);
        let mut state = exp.begin("P02", Some(3)).unwrap();

        for _ in 0..3 {
            exp.apply(&mut state, Command::Play(Phase::Single)).unwrap();
            let out = exp
                .apply(&mut state, Command::ConfirmRating(Phase::Single, rating(3)))
                .unwrap();
            assert!(matches!(out, Outcome::TrialRecorded { .. }));
        }
        assert!(state.is_finished());

        let rows = parse_csv(&table.export_csv().unwrap());
        assert_eq!(rows[0], crate::recorder::SINGLE_COLUMNS);
        let mut files: Vec<_> = rows[1..].iter().map(|r| r[2].clone()).collect();
        files.sort();
        assert_eq!(files, vec!["tone1.wav", "tone2.wav", "tone3.wav"]);
    }

    #[test]
    fn test_sessions_are_isolated() {
        let table = Arc::new(MemoryTable::new());
        let exp = experiment(paired_store(), table.clone(), Variant::Paired);
        let mut a = exp.begin("P01", Some(1)).unwrap();
        let b = exp.begin("P02", Some(1)).unwrap();

        exp.apply(&mut a, Command::Play(Phase::Single)).unwrap();
        assert_eq!(a.gate().state().play_count(), 1);
        assert_eq!(b.gate().state().play_count(), 0);
    }

    #[test]
    fn test_reset_produces_fresh_state() {
        let exp = experiment(paired_store(), Arc::new(MemoryTable::new()), Variant::Paired);
        let mut state = exp.begin("P01", Some(1)).unwrap();
        complete_paired_trial(&exp, &mut state);

        let fresh = exp.reset(&state, Some(2)).unwrap();
        assert_eq!(fresh.participant_id(), "P01");
        assert_eq!(fresh.sequencer().position(), 0);
        assert_eq!(fresh.sequencer().seed(), Some(2));
        assert!(fresh.gate().confirmed().is_empty());
    }
}
