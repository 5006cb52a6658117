use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::catalog::{Trial, Variant};
use crate::gate::{ConfirmedPhase, Phase};
use crate::table::{AppendOnlyTable, TableError};

/// Column schema of the paired (A/B then AB) variant.
pub const PAIRED_COLUMNS: &[&str] = &[
    "Participant_ID",
    "Timestamp_UTC",
    "Pair_ID",
    "A_File",
    "B_File",
    "AB_File",
    "Single_Valence",
    "Single_Arousal",
    "Single_Diff",
    "Single_PlayCount",
    "Chord_Valence",
    "Chord_Arousal",
    "Chord_Diff",
    "Chord_PlayCount",
];

/// Column schema of the single-tone variant.
pub const SINGLE_COLUMNS: &[&str] = &[
    "Participant_ID",
    "Timestamp",
    "Tone_File",
    "Tone_Index",
    "Valence",
    "Arousal",
    "Diff",
    "Play_Count",
];

/// Timestamp format written to the table (always UTC).
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub fn columns(variant: Variant) -> &'static [&'static str] {
    match variant {
        Variant::Single => SINGLE_COLUMNS,
        Variant::Paired => PAIRED_COLUMNS,
    }
}

#[derive(Error, Debug)]
pub enum RecordError {
    #[error("Trial {trial} has no confirmed {phase} rating")]
    MissingPhase { trial: String, phase: Phase },
    #[error("The {0} phase was confirmed without being played")]
    NotPlayed(Phase),
    #[error("Trial {trial} does not belong to the {variant:?} experiment")]
    WrongVariant { trial: String, variant: Variant },
    #[error("Failed to write result row: {0}")]
    Append(#[source] TableError),
}

/// Source of confirmation timestamps.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// One immutable result row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultRecord {
    pub participant_id: String,
    pub timestamp: DateTime<Utc>,
    pub trial: Trial,
    pub phases: Vec<ConfirmedPhase>,
}

impl ResultRecord {
    /// Row fields in schema order.
    pub fn fields(&self) -> Vec<String> {
        let mut fields = vec![
            self.participant_id.clone(),
            self.timestamp.format(TIMESTAMP_FORMAT).to_string(),
        ];
        match &self.trial {
            Trial::Single { id, file } => {
                fields.push(file.name.clone());
                fields.push(id.to_string());
            }
            Trial::Paired { pair_id, a, b, ab } => {
                fields.push(pair_id.clone());
                fields.push(a.name.clone());
                fields.push(b.name.clone());
                fields.push(ab.name.clone());
            }
        }
        for p in &self.phases {
            fields.push(p.rating.valence().to_string());
            fields.push(p.rating.arousal().to_string());
            fields.push(p.rating.diff().to_string());
            fields.push(p.play_count.to_string());
        }
        fields
    }
}

/// Builds result rows and appends them to the shared results table.
pub struct ResponseRecorder {
    table: Arc<dyn AppendOnlyTable>,
    variant: Variant,
    header_ready: AtomicBool,
}

impl ResponseRecorder {
    pub fn new(table: Arc<dyn AppendOnlyTable>, variant: Variant) -> Self {
        Self {
            table,
            variant,
            header_ready: AtomicBool::new(false),
        }
    }

    pub fn variant(&self) -> Variant {
        self.variant
    }

    pub fn columns(&self) -> &'static [&'static str] {
        columns(self.variant)
    }

    /// Create the header on first use. Safe to call from several sessions:
    /// the table itself refuses to overwrite an existing header.
    fn ensure_header(&self) -> Result<(), TableError> {
        if self.header_ready.load(Ordering::Acquire) {
            return Ok(());
        }
        self.table.init_header(self.columns())?;
        self.header_ready.store(true, Ordering::Release);
        Ok(())
    }

    /// Build the row for a fully rated trial and append it.
    ///
    /// `phases` must hold one confirmed, played entry per phase of `trial`,
    /// in phase order. Nothing is written if validation or the append fails.
    pub fn record_trial(
        &self,
        participant_id: &str,
        trial: &Trial,
        phases: &[ConfirmedPhase],
        clock: &dyn Clock,
    ) -> Result<ResultRecord, RecordError> {
        let matches_variant = matches!(
            (trial, self.variant),
            (Trial::Single { .. }, Variant::Single) | (Trial::Paired { .. }, Variant::Paired)
        );
        if !matches_variant {
            return Err(RecordError::WrongVariant {
                trial: trial.label(),
                variant: self.variant,
            });
        }

        for (i, &phase) in trial.phases().iter().enumerate() {
            match phases.get(i) {
                Some(c) if c.phase == phase => {
                    if c.play_count == 0 {
                        return Err(RecordError::NotPlayed(phase));
                    }
                }
                _ => {
                    return Err(RecordError::MissingPhase {
                        trial: trial.label(),
                        phase,
                    });
                }
            }
        }

        let record = ResultRecord {
            participant_id: participant_id.to_string(),
            timestamp: clock.now(),
            trial: trial.clone(),
            phases: phases[..trial.phases().len()].to_vec(),
        };

        self.ensure_header().map_err(RecordError::Append)?;
        if let Err(e) = self.table.append_row(&record.fields()) {
            if matches!(e, TableError::Missing(_)) {
                // Table removed behind our back; recreate the header on retry.
                self.header_ready.store(false, Ordering::Release);
            }
            return Err(RecordError::Append(e));
        }

        log::info!(
            "Recorded trial {} for participant {}",
            record.trial.label(),
            record.participant_id
        );
        Ok(record)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::catalog::StimulusFile;
    use crate::gate::Rating;
    use crate::table::memory::MemoryTable;
    use crate::table::parse_csv;
    use chrono::TimeZone;
    use std::sync::Mutex;

    pub(crate) struct FixedClock(pub DateTime<Utc>);

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.0
        }
    }

    pub(crate) fn fixed_clock() -> FixedClock {
        FixedClock(Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 5).unwrap())
    }

    /// Table wrapper whose appends fail while `failing` is set.
    pub(crate) struct FlakyTable {
        pub inner: MemoryTable,
        pub failing: Mutex<bool>,
    }

    impl FlakyTable {
        pub fn new(failing: bool) -> Self {
            Self {
                inner: MemoryTable::new(),
                failing: Mutex::new(failing),
            }
        }

        pub fn set_failing(&self, failing: bool) {
            *self.failing.lock().unwrap() = failing;
        }
    }

    impl AppendOnlyTable for FlakyTable {
        fn init_header(&self, columns: &[&str]) -> crate::table::Result<bool> {
            self.inner.init_header(columns)
        }

        fn append_row(&self, fields: &[String]) -> crate::table::Result<()> {
            if *self.failing.lock().unwrap() {
                return Err(TableError::Io(std::io::Error::new(
                    std::io::ErrorKind::PermissionDenied,
                    "read-only filesystem",
                )));
            }
            self.inner.append_row(fields)
        }

        fn row_count(&self) -> crate::table::Result<usize> {
            self.inner.row_count()
        }

        fn export_csv(&self) -> crate::table::Result<String> {
            self.inner.export_csv()
        }

        fn truncate(&self, columns: &[&str]) -> crate::table::Result<()> {
            self.inner.truncate(columns)
        }
    }

    fn paired_trial() -> Trial {
        Trial::Paired {
            pair_id: "x".into(),
            a: StimulusFile::new("single", "A_x.wav"),
            b: StimulusFile::new("single", "B_x.wav"),
            ab: StimulusFile::new("chord", "AB_x.wav"),
        }
    }

    fn confirmed(phase: Phase, v: u8, a: u8, d: u8, plays: u32) -> ConfirmedPhase {
        ConfirmedPhase {
            phase,
            rating: Rating::new(v, a, d).unwrap(),
            play_count: plays,
        }
    }

    #[test]
    fn test_paired_row_layout() {
        let table = Arc::new(MemoryTable::new());
        let recorder = ResponseRecorder::new(table.clone(), Variant::Paired);
        let phases = [
            confirmed(Phase::Single, 3, 4, 2, 2),
            confirmed(Phase::Chord, 5, 1, 3, 1),
        ];
        recorder
            .record_trial("P01", &paired_trial(), &phases, &fixed_clock())
            .unwrap();

        let records = parse_csv(&table.export_csv().unwrap());
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], PAIRED_COLUMNS);
        assert_eq!(
            records[1],
            vec![
                "P01", "2024-03-01 12:30:05", "x", "A_x.wav", "B_x.wav", "AB_x.wav",
                "3", "4", "2", "2", "5", "1", "3", "1",
            ]
        );
    }

    #[test]
    fn test_single_row_layout() {
        let table = Arc::new(MemoryTable::new());
        let recorder = ResponseRecorder::new(table.clone(), Variant::Single);
        let trial = Trial::Single {
            id: 4,
            file: StimulusFile::new("tones", "tone4.wav"),
        };
        let record = recorder
            .record_trial("P_7", &trial, &[confirmed(Phase::Single, 1, 2, 3, 3)], &fixed_clock())
            .unwrap();

        assert_eq!(
            record.fields(),
            vec!["P_7", "2024-03-01 12:30:05", "tone4.wav", "4", "1", "2", "3", "3"]
        );
        assert_eq!(record.fields().len(), SINGLE_COLUMNS.len());
        assert_eq!(table.row_count().unwrap(), 1);
    }

    #[test]
    fn test_missing_phase_writes_nothing() {
        let table = Arc::new(MemoryTable::new());
        let recorder = ResponseRecorder::new(table.clone(), Variant::Paired);
        let err = recorder
            .record_trial("P01", &paired_trial(), &[confirmed(Phase::Single, 3, 3, 3, 1)], &fixed_clock())
            .unwrap_err();
        assert!(matches!(err, RecordError::MissingPhase { phase: Phase::Chord, .. }));
        assert_eq!(table.row_count().unwrap(), 0);
    }

    #[test]
    fn test_unplayed_phase_rejected() {
        let table = Arc::new(MemoryTable::new());
        let recorder = ResponseRecorder::new(table.clone(), Variant::Paired);
        let phases = [
            confirmed(Phase::Single, 3, 3, 3, 1),
            confirmed(Phase::Chord, 3, 3, 3, 0),
        ];
        let err = recorder
            .record_trial("P01", &paired_trial(), &phases, &fixed_clock())
            .unwrap_err();
        assert!(matches!(err, RecordError::NotPlayed(Phase::Chord)));
    }

    #[test]
    fn test_wrong_variant() {
        let recorder = ResponseRecorder::new(Arc::new(MemoryTable::new()), Variant::Single);
        let err = recorder
            .record_trial("P01", &paired_trial(), &[], &fixed_clock())
            .unwrap_err();
        assert!(matches!(err, RecordError::WrongVariant { .. }));
    }

    #[test]
    fn test_append_failure_then_retry() {
        let table = Arc::new(FlakyTable::new(true));
        let recorder = ResponseRecorder::new(table.clone(), Variant::Paired);
        let phases = [
            confirmed(Phase::Single, 3, 3, 3, 1),
            confirmed(Phase::Chord, 3, 3, 3, 1),
        ];

        let err = recorder
            .record_trial("P01", &paired_trial(), &phases, &fixed_clock())
            .unwrap_err();
        assert!(matches!(err, RecordError::Append(_)));
        assert_eq!(table.row_count().unwrap(), 0);

        table.set_failing(false);
        recorder
            .record_trial("P01", &paired_trial(), &phases, &fixed_clock())
            .unwrap();
        assert_eq!(table.row_count().unwrap(), 1);
    }

    #[test]
    fn test_variant_switch_rejected_by_existing_csv() {
        let tmp = tempfile::TempDir::new().unwrap();
        let table = Arc::new(crate::table::csv::CsvTable::new(&tmp.path().join("results.csv")));
        let paired = ResponseRecorder::new(table.clone(), Variant::Paired);
        let phases = [
            confirmed(Phase::Single, 2, 2, 2, 1),
            confirmed(Phase::Chord, 4, 4, 4, 1),
        ];
        paired.record_trial("P01", &paired_trial(), &phases, &fixed_clock()).unwrap();

        let single = ResponseRecorder::new(table.clone(), Variant::Single);
        let trial = Trial::Single {
            id: 0,
            file: StimulusFile::new("tones", "t.wav"),
        };
        let err = single
            .record_trial("P02", &trial, &[confirmed(Phase::Single, 1, 1, 1, 1)], &fixed_clock())
            .unwrap_err();
        assert!(matches!(
            err,
            RecordError::Append(TableError::Width { expected: 14, got: 8 })
        ));
        assert_eq!(table.row_count().unwrap(), 1);
    }

    #[test]
    fn test_header_recreated_after_table_removed() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("results.csv");
        let table = Arc::new(crate::table::csv::CsvTable::new(&path));
        let recorder = ResponseRecorder::new(table.clone(), Variant::Paired);
        let phases = [
            confirmed(Phase::Single, 2, 2, 2, 1),
            confirmed(Phase::Chord, 4, 4, 4, 1),
        ];
        recorder.record_trial("P01", &paired_trial(), &phases, &fixed_clock()).unwrap();

        std::fs::remove_file(&path).unwrap();
        let err = recorder
            .record_trial("P01", &paired_trial(), &phases, &fixed_clock())
            .unwrap_err();
        assert!(matches!(err, RecordError::Append(TableError::Missing(_))));

        recorder.record_trial("P01", &paired_trial(), &phases, &fixed_clock()).unwrap();
        let records = parse_csv(&table.export_csv().unwrap());
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], PAIRED_COLUMNS);
    }
}
