#![forbid(unsafe_code)]

//! Test-side helpers shared by the frankenvmap crates.
//!
//! Every scenario test can emit one `PassTestLog` line describing which
//! graph fixture it ran, under which mode, and how it ended. Fixtures are
//! identified by the SHA-256 of their canonical graph fingerprint so that
//! logs from different runs can be joined on the same input.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

pub const TEST_LOG_SCHEMA_VERSION: &str = "frankenvmap.test-log.v1";

/// Directory that receives `<test id>.jsonl` files when set.
pub const TEST_LOG_DIR_ENV: &str = "FV_TEST_LOG_DIR";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestMode {
    Strict,
    Hardened,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestOutcome {
    Pass,
    /// The pass rejected the fixture, as the test expected.
    ExpectedError,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassTestLog {
    pub schema_version: String,
    pub test_id: String,
    pub fixture_id: String,
    pub seed: Option<u64>,
    pub mode: TestMode,
    pub os: String,
    pub timestamp_unix_ms: u64,
    pub outcome: TestOutcome,
    pub duration_us: u64,
    pub sites_expanded: usize,
    pub details: Option<String>,
}

impl PassTestLog {
    #[must_use]
    pub fn start(
        test_id: impl Into<String>,
        fixture_id: impl Into<String>,
        mode: TestMode,
    ) -> Self {
        Self {
            schema_version: TEST_LOG_SCHEMA_VERSION.to_owned(),
            test_id: test_id.into(),
            fixture_id: fixture_id.into(),
            seed: capture_proptest_seed(),
            mode,
            os: std::env::consts::OS.to_owned(),
            timestamp_unix_ms: now_unix_ms_u64(),
            outcome: TestOutcome::Pass,
            duration_us: 0,
            sites_expanded: 0,
            details: None,
        }
    }

    #[must_use]
    pub fn finish(mut self, outcome: TestOutcome, started: Instant) -> Self {
        self.outcome = outcome;
        self.duration_us = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX);
        self
    }

    #[must_use]
    pub fn with_sites(mut self, sites_expanded: usize) -> Self {
        self.sites_expanded = sites_expanded;
        self
    }

    #[must_use]
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// SHA-256 hex digest of a canonical graph fingerprint.
#[must_use]
pub fn fixture_id_from_fingerprint(fingerprint: &str) -> String {
    hex(&Sha256::digest(fingerprint.as_bytes()))
}

pub fn fixture_id_from_json<T: Serialize>(fixture: &T) -> Result<String, serde_json::Error> {
    let bytes = serde_json::to_vec(fixture)?;
    Ok(hex(&Sha256::digest(&bytes)))
}

/// Append `log` as one JSON line under `dir`, returning the file written.
pub fn write_log(log: &PassTestLog, dir: &Path) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let file_name: String = log
        .test_id
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() { ch } else { '_' })
        .collect();
    let path = dir.join(format!("{file_name}.jsonl"));
    let mut line = serde_json::to_vec(log).map_err(std::io::Error::other)?;
    line.push(b'\n');
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)?;
    file.write_all(&line)?;
    Ok(path)
}

/// Write `log` if `FV_TEST_LOG_DIR` is set; a no-op otherwise.
pub fn emit(log: &PassTestLog) -> std::io::Result<Option<PathBuf>> {
    match std::env::var_os(TEST_LOG_DIR_ENV) {
        Some(dir) => write_log(log, Path::new(&dir)).map(Some),
        None => Ok(None),
    }
}

#[must_use]
pub fn property_test_case_count() -> u32 {
    if let Ok(raw) = std::env::var("FV_PROPTEST_CASES")
        && let Ok(parsed) = raw.parse::<u32>()
        && parsed > 0
    {
        return parsed;
    }

    if std::env::var_os("CI").is_some() {
        1024
    } else {
        256
    }
}

#[must_use]
pub fn capture_proptest_seed() -> Option<u64> {
    ["FV_PROPTEST_SEED", "PROPTEST_RNG_SEED"]
        .iter()
        .find_map(|key| std::env::var(key).ok()?.parse::<u64>().ok())
}

#[must_use]
pub fn test_id(module_path: &str, test_name: &str) -> String {
    format!("{module_path}::{test_name}")
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn now_unix_ms_u64() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .ok()
        .and_then(|duration| u64::try_from(duration.as_millis()).ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::{
        PassTestLog, TEST_LOG_SCHEMA_VERSION, TestMode, TestOutcome, fixture_id_from_fingerprint,
        fixture_id_from_json, property_test_case_count, test_id, write_log,
    };
    use std::time::Instant;

    #[test]
    fn fingerprint_digest_is_stable_and_sensitive() {
        let a = fixture_id_from_fingerprint("f(p0) { a0 = neg(p0); a1 = return(a0); }");
        let b = fixture_id_from_fingerprint("f(p0) { a0 = neg(p0); a1 = return(a0); }");
        let c = fixture_id_from_fingerprint("f(p0) { a0 = abs(p0); a1 = return(a0); }");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn json_fixture_digest_is_deterministic() {
        let fixture = serde_json::json!({ "in_axes": "(0, none)", "shapes": [[8, 4], [4]] });
        let first = fixture_id_from_json(&fixture).expect("digest should build");
        let second = fixture_id_from_json(&fixture).expect("digest should build");
        assert_eq!(first, second);
    }

    #[test]
    fn property_case_count_has_default_floor() {
        assert!(property_test_case_count() >= 256);
    }

    #[test]
    fn log_round_trips_through_jsonl_file() {
        let started = Instant::now();
        let log = PassTestLog::start(
            test_id(module_path!(), "log_round_trips_through_jsonl_file"),
            "fixture",
            TestMode::Hardened,
        )
        .with_sites(2)
        .with_details("two sites")
        .finish(TestOutcome::ExpectedError, started);

        let dir = std::env::temp_dir().join(format!("fv-test-utils-{}", std::process::id()));
        let path = write_log(&log, &dir).expect("log should be written");
        let text = std::fs::read_to_string(&path).expect("log should be readable");
        let decoded: PassTestLog =
            serde_json::from_str(text.lines().last().expect("one line")).expect("valid json");
        assert_eq!(decoded.schema_version, TEST_LOG_SCHEMA_VERSION);
        assert_eq!(decoded.outcome, TestOutcome::ExpectedError);
        assert_eq!(decoded.sites_expanded, 2);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
