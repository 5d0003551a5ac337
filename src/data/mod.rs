//! CSV bar files: `time,open,high,low,close`, `#` comments and blank lines
//! skipped. Every data row becomes a [`RawBar`]; malformed fields are left
//! empty so the candle validator rejects them with a schema reason.

use chrono::DateTime;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use crate::types::RawBar;

pub const EXPECTED_COLUMNS: [&str; 5] = ["time", "open", "high", "low", "close"];

/// Epoch values below this are taken as seconds.
const SECONDS_CUTOFF: i64 = 100_000_000_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetManifest {
    pub path: String,
    pub hash_sha256: String,
    pub row_count: u64,
    pub bad_rows: u64,
    pub ts_min: Option<i64>,
    pub ts_max: Option<i64>,
    pub columns: Vec<String>,
    pub warnings: Vec<String>,
}

/// Epoch seconds, epoch milliseconds or RFC 3339, normalized to milliseconds.
pub fn parse_time(field: &str) -> Option<i64> {
    let field = field.trim();
    if let Ok(n) = field.parse::<i64>() {
        return Some(if n.abs() < SECONDS_CUTOFF { n * 1000 } else { n });
    }
    DateTime::parse_from_rfc3339(field).ok().map(|dt| dt.timestamp_millis())
}

fn parse_price(field: Option<&str>) -> Option<f64> {
    field.and_then(|f| f.trim().parse::<f64>().ok())
}

/// One CSV data row. Returns the raw bar and whether every field parsed.
pub fn parse_row(line: &str) -> (RawBar, bool) {
    let parts: Vec<&str> = line.split(',').collect();
    let raw = RawBar {
        time: parts.first().and_then(|f| parse_time(f)),
        open: parse_price(parts.get(1).copied()),
        high: parse_price(parts.get(2).copied()),
        low: parse_price(parts.get(3).copied()),
        close: parse_price(parts.get(4).copied()),
    };
    let complete = parts.len() >= EXPECTED_COLUMNS.len()
        && raw.time.is_some()
        && raw.open.is_some()
        && raw.high.is_some()
        && raw.low.is_some()
        && raw.close.is_some();
    (raw, complete)
}

fn is_header(line: &str) -> bool {
    let lower = line.to_lowercase();
    lower.starts_with("time,") || lower.starts_with("ts,")
}

/// `ts` is accepted in place of `time`; extra trailing columns are ignored.
fn header_matches(header: &[String]) -> bool {
    header.len() >= EXPECTED_COLUMNS.len()
        && header.iter().zip(EXPECTED_COLUMNS.iter()).enumerate().all(|(i, (got, want))| {
            got == want || (i == 0 && got == "ts")
        })
}

pub fn load_bars(path: &Path) -> Result<(Vec<RawBar>, DatasetManifest), String> {
    let hash = file_sha256(path)?;
    let file = File::open(path).map_err(|e| e.to_string())?;
    let reader = BufReader::new(file);

    let mut bars = Vec::new();
    let mut header: Vec<String> = Vec::new();
    let mut warnings = Vec::new();
    let mut bad_rows = 0u64;
    let mut ts_min: Option<i64> = None;
    let mut ts_max: Option<i64> = None;

    for (lineno, line) in reader.lines().map_while(|l| l.ok()).enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if header.is_empty() && bars.is_empty() && is_header(trimmed) {
            header = trimmed.split(',').map(|s| s.trim().to_lowercase()).collect();
            continue;
        }
        let (raw, complete) = parse_row(trimmed);
        if !complete {
            bad_rows += 1;
            warnings.push(format!("bad_row: line {}", lineno + 1));
        }
        if let Some(ts) = raw.time {
            ts_min = Some(ts_min.map_or(ts, |v| v.min(ts)));
            ts_max = Some(ts_max.map_or(ts, |v| v.max(ts)));
        }
        bars.push(raw);
    }

    if header.is_empty() {
        warnings.push("missing_header".to_string());
    } else if !header_matches(&header) {
        warnings.push(format!("unexpected columns: {:?}", header));
    }

    let manifest = DatasetManifest {
        path: path.display().to_string(),
        hash_sha256: hash,
        row_count: bars.len() as u64,
        bad_rows,
        ts_min,
        ts_max,
        columns: header,
        warnings,
    };
    Ok((bars, manifest))
}

pub fn file_sha256(path: &Path) -> Result<String, String> {
    let mut file = File::open(path).map_err(|e| e.to_string())?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf).map_err(|e| e.to_string())?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_time_units() {
        assert_eq!(parse_time("1767225600"), Some(1_767_225_600_000));
        assert_eq!(parse_time("1767225600000"), Some(1_767_225_600_000));
        assert_eq!(parse_time("2026-01-01T00:00:00Z"), Some(1_767_225_600_000));
        assert_eq!(parse_time("yesterday"), None);
    }

    #[test]
    fn test_parse_row_marks_incomplete() {
        let (raw, ok) = parse_row("1767225600000,100,101,99,100.5");
        assert!(ok);
        assert_eq!(raw.close, Some(100.5));
        let (raw, ok) = parse_row("1767225600000,100,abc,99");
        assert!(!ok);
        assert_eq!(raw.high, None);
        assert_eq!(raw.close, None);
    }

    #[test]
    fn test_load_bars_with_comments_and_bad_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bars.csv");
        {
            let mut f = File::create(&path).unwrap();
            writeln!(f, "# replay sample").unwrap();
            writeln!(f, "time,open,high,low,close").unwrap();
            writeln!(f, "1767225600000,100,101,99,100").unwrap();
            writeln!(f).unwrap();
            writeln!(f, "1767225660000,100,102,99,101").unwrap();
            writeln!(f, "1767225720000,100,,99,101").unwrap();
        }
        let (bars, manifest) = load_bars(&path).unwrap();
        assert_eq!(bars.len(), 3);
        assert_eq!(manifest.row_count, 3);
        assert_eq!(manifest.bad_rows, 1);
        assert_eq!(manifest.ts_min, Some(1_767_225_600_000));
        assert_eq!(manifest.ts_max, Some(1_767_225_720_000));
        assert_eq!(manifest.columns, vec!["time", "open", "high", "low", "close"]);
        assert!(manifest.warnings.iter().all(|w| !w.starts_with("unexpected")));
        assert_eq!(manifest.hash_sha256.len(), 64);
    }

    #[test]
    fn test_sha256_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sha.csv");
        std::fs::write(&path, b"abc").unwrap();
        assert_eq!(
            file_sha256(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
