//! Candle ingestion across restarts: duplicate and ordering rejection,
//! sqlite checkpoint recovery, and CSV replay through the validator.

use std::io::Write;

use thetagate::data::load_bars;
use thetagate::ingest::{CandleValidator, RejectKind, ValidatorConfig};
use thetagate::storage::{CheckpointStore, SqliteCheckpoint};
use thetagate::types::RawBar;

const T0: i64 = 1_767_225_600_000;
const MIN: i64 = 60_000;
/// Wall-clock used for the corruption guard.
const NOW: i64 = T0 + 60 * MIN;

fn raw(time: i64, close: f64) -> RawBar {
    RawBar { time: Some(time), open: Some(close), high: Some(close + 1.0), low: Some(close - 1.0), close: Some(close) }
}

fn sqlite_validator(path: &str) -> CandleValidator {
    let store = SqliteCheckpoint::open(path).unwrap();
    CandleValidator::new("NQ1!", ValidatorConfig::default(), Box::new(store))
}

#[test]
fn test_duplicate_timestamp_rejected() {
    let mut v = CandleValidator::in_memory("NQ1!");
    assert!(v.validate_at(&raw(T0, 100.0), NOW).is_accept());
    let verdict = v.validate_at(&raw(T0, 101.0), NOW);
    let rejection = verdict.rejection().unwrap();
    assert_eq!(rejection.primary, RejectKind::Dup);
    // a repeated timestamp is also not newer than the last one
    assert!(rejection.reasons.contains(&RejectKind::Order));
}

#[test]
fn test_earlier_timestamp_rejected_as_order() {
    let mut v = CandleValidator::in_memory("NQ1!");
    assert!(v.validate_at(&raw(T0 + 2 * MIN, 100.0), NOW).is_accept());
    let verdict = v.validate_at(&raw(T0 + MIN, 100.0), NOW);
    assert_eq!(verdict.rejection().unwrap().primary, RejectKind::Order);
    assert!(v.validate_at(&raw(T0 + 3 * MIN, 100.0), NOW).is_accept());
}

#[test]
fn test_schema_and_order_reported_together() {
    let mut v = CandleValidator::in_memory("NQ1!");
    assert!(v.validate_at(&raw(T0 + MIN, 100.0), NOW).is_accept());
    let mut bad = raw(T0, 100.0);
    bad.high = Some(90.0);
    let verdict = v.validate_at(&bad, NOW);
    let rejection = verdict.rejection().unwrap();
    assert_eq!(rejection.primary, RejectKind::Schema);
    assert_eq!(rejection.reasons, vec![RejectKind::Schema, RejectKind::Order]);
}

#[test]
fn test_restart_resumes_from_sqlite_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("checkpoint.sqlite");
    let path = path.to_str().unwrap();

    {
        let mut v = sqlite_validator(path);
        for i in 0..5 {
            assert!(v.validate_at(&raw(T0 + i * MIN, 100.0), NOW).is_accept());
        }
    }

    let mut v = sqlite_validator(path);
    assert_eq!(v.last_ts(), Some(T0 + 4 * MIN));
    assert!(v.status().checkpoint_present);
    let replayed = v.validate_at(&raw(T0 + 2 * MIN, 100.0), NOW);
    assert_eq!(replayed.rejection().unwrap().primary, RejectKind::Order);
    assert!(v.validate_at(&raw(T0 + 5 * MIN, 100.0), NOW).is_accept());
    // checkpoint writes land once the validator shuts down
    drop(v);

    let mut store = SqliteCheckpoint::open(path).unwrap();
    assert_eq!(store.load("NQ1!").unwrap(), Some(T0 + 5 * MIN));
    assert_eq!(store.load("ES1!").unwrap(), None);
}

#[test]
fn test_corrupted_future_checkpoint_is_reset() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("checkpoint.sqlite");
    let path = path.to_str().unwrap();
    {
        let mut store = SqliteCheckpoint::open(path).unwrap();
        store.save("NQ1!", T0 + 24 * 60 * MIN).unwrap();
    }
    let mut v = sqlite_validator(path);
    // stored checkpoint sits a day ahead of wall-clock
    let verdict = v.validate_at(&raw(T0, 100.0), NOW);
    assert!(verdict.is_accept());
    assert_eq!(v.status().corruption_resets, 1);
    assert_eq!(v.last_ts(), Some(T0));
}

#[test]
fn test_csv_replay_through_validator() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "# nq 1m").unwrap();
    writeln!(file, "time,open,high,low,close").unwrap();
    writeln!(file, "{},100,101,99,100.5", T0).unwrap();
    writeln!(file, "{},100.5,102,100,101", T0 + MIN).unwrap();
    writeln!(file, "{},100.5,102,100,101", T0 + MIN).unwrap();
    writeln!(file, "{},101,103,100,102", T0).unwrap();
    writeln!(file, "{},101,,100,102", T0 + 2 * MIN).unwrap();
    writeln!(file, "{},102,104,101,103", T0 + 3 * MIN).unwrap();
    file.flush().unwrap();

    let (bars, manifest) = load_bars(file.path()).unwrap();
    assert_eq!(manifest.row_count, 6);
    assert_eq!(manifest.bad_rows, 1);

    let mut v = CandleValidator::in_memory("NQ1!");
    let primaries: Vec<Option<RejectKind>> = bars
        .iter()
        .map(|b| v.validate_at(b, NOW).rejection().map(|r| r.primary))
        .collect();
    assert_eq!(
        primaries,
        vec![None, None, Some(RejectKind::Dup), Some(RejectKind::Dup), Some(RejectKind::Schema), None]
    );
    let status = v.status();
    assert_eq!(status.accepted, 3);
    assert_eq!(status.rejected, 3);
}
