//! Persisted run records.
//!
//! One file per run under `runs/`, keyed by run id, plus a `latest` pointer
//! naming the most recent run. Management operations take an explicit run id
//! and fall back to `latest` only at the interface boundary. Each record
//! keeps the legacy two-line layout, appended across the two stages of a
//! single run:
//!
//! ```text
//! Instance ID: i-0abc123
//! Public IP: 3.91.1.2
//! ```

use chrono::Utc;
use std::fs;
use std::io::{Error, Write};
use std::path::{Path, PathBuf};

const INSTANCE_PREFIX: &str = "Instance ID: ";
const PUBLIC_IP_PREFIX: &str = "Public IP: ";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRecord {
    pub run_id: String,
    pub instance_id: String,
    pub public_ip: Option<String>,
}

pub struct RunRecordStore {
    root: PathBuf,
}

impl RunRecordStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `$FLEETFORGE_STATE_DIR`, or `~/.fleetforge`.
    pub fn open_default() -> Result<Self, Error> {
        let root = match std::env::var("FLEETFORGE_STATE_DIR") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => {
                let home = std::env::var("HOME")
                    .map_err(|_| Error::other("neither FLEETFORGE_STATE_DIR nor HOME is set"))?;
                Path::new(&home).join(".fleetforge")
            }
        };
        Ok(Self::new(root))
    }

    pub fn new_run_id(&self) -> String {
        Utc::now().format("%Y%m%d-%H%M%S").to_string()
    }

    fn runs_dir(&self) -> PathBuf {
        self.root.join("runs")
    }

    fn run_path(&self, run_id: &str) -> PathBuf {
        self.runs_dir().join(run_id)
    }

    fn latest_path(&self) -> PathBuf {
        self.root.join("latest")
    }

    /// Stage one: the launch request returned an instance id.
    pub fn record_instance(&self, run_id: &str, instance_id: &str) -> Result<(), Error> {
        fs::create_dir_all(self.runs_dir())?;
        fs::write(
            self.run_path(run_id),
            format!("{INSTANCE_PREFIX}{instance_id}\n"),
        )?;
        // Rewritten wholesale; the pointer always names a complete record.
        fs::write(self.latest_path(), format!("{run_id}\n"))?;
        Ok(())
    }

    /// Stage two: a public address is attached; appended, not rewritten.
    pub fn record_public_ip(&self, run_id: &str, public_ip: &str) -> Result<(), Error> {
        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(self.run_path(run_id))
            .map_err(|e| Error::other(format!("no record for run {run_id}: {e}")))?;
        writeln!(file, "{PUBLIC_IP_PREFIX}{public_ip}")?;
        Ok(())
    }

    pub fn latest_run_id(&self) -> Result<Option<String>, Error> {
        match fs::read_to_string(self.latest_path()) {
            Ok(content) => Ok(Some(content.trim().to_string()).filter(|s| !s.is_empty())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn load(&self, run_id: &str) -> Result<RunRecord, Error> {
        let path = self.run_path(run_id);
        let content = fs::read_to_string(&path)
            .map_err(|e| Error::other(format!("no record for run {run_id}: {e}")))?;

        let mut instance_id = None;
        let mut public_ip = None;
        for line in content.lines() {
            if let Some(id) = line.strip_prefix(INSTANCE_PREFIX) {
                instance_id = Some(id.trim().to_string());
            } else if let Some(ip) = line.strip_prefix(PUBLIC_IP_PREFIX) {
                public_ip = Some(ip.trim().to_string());
            }
        }

        Ok(RunRecord {
            run_id: run_id.to_string(),
            instance_id: instance_id
                .ok_or_else(|| Error::other(format!("record {} has no instance id", path.display())))?,
            public_ip,
        })
    }

    /// Explicit run id, or the most recent run.
    pub fn resolve(&self, run_id: Option<&str>) -> Result<RunRecord, Error> {
        match run_id {
            Some(id) => self.load(id),
            None => {
                let latest = self.latest_run_id()?.ok_or_else(|| {
                    Error::other("no runs recorded yet; launch an instance first")
                })?;
                self.load(&latest)
            }
        }
    }

    pub fn list_runs(&self) -> Result<Vec<String>, Error> {
        let mut runs = Vec::new();
        let dir = match fs::read_dir(self.runs_dir()) {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(runs),
            Err(e) => return Err(e),
        };
        for entry in dir {
            runs.push(entry?.file_name().to_string_lossy().into_owned());
        }
        runs.sort();
        Ok(runs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, RunRecordStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = RunRecordStore::new(dir.path());
        (dir, store)
    }

    #[test]
    fn test_two_stage_record_round_trip() {
        let (_dir, store) = store();
        store.record_instance("20260828-120000", "i-0abc").unwrap();

        // Stage one only: instance id present, address absent.
        let record = store.resolve(None).unwrap();
        assert_eq!(record.instance_id, "i-0abc");
        assert_eq!(record.public_ip, None);

        store.record_public_ip("20260828-120000", "3.91.1.2").unwrap();
        let record = store.resolve(None).unwrap();
        assert_eq!(record.instance_id, "i-0abc");
        assert_eq!(record.public_ip.as_deref(), Some("3.91.1.2"));
    }

    #[test]
    fn test_legacy_two_line_layout() {
        let (dir, store) = store();
        store.record_instance("run-a", "i-0abc").unwrap();
        store.record_public_ip("run-a", "3.91.1.2").unwrap();

        let content = fs::read_to_string(dir.path().join("runs/run-a")).unwrap();
        assert_eq!(content, "Instance ID: i-0abc\nPublic IP: 3.91.1.2\n");
    }

    #[test]
    fn test_second_run_never_interleaves_with_first() {
        let (_dir, store) = store();
        store.record_instance("run-a", "i-0aaa").unwrap();
        store.record_public_ip("run-a", "1.1.1.1").unwrap();

        store.record_instance("run-b", "i-0bbb").unwrap();
        store.record_public_ip("run-b", "2.2.2.2").unwrap();

        // Latest resolves to the second run with both of its lines.
        let record = store.resolve(None).unwrap();
        assert_eq!(record.instance_id, "i-0bbb");
        assert_eq!(record.public_ip.as_deref(), Some("2.2.2.2"));

        // The first run is still addressable by id.
        let record = store.resolve(Some("run-a")).unwrap();
        assert_eq!(record.instance_id, "i-0aaa");
        assert_eq!(record.public_ip.as_deref(), Some("1.1.1.1"));
    }

    #[test]
    fn test_rerecording_a_run_overwrites_wholesale() {
        let (_dir, store) = store();
        store.record_instance("run-a", "i-0old").unwrap();
        store.record_public_ip("run-a", "1.1.1.1").unwrap();

        // A fresh stage-one write for the same id discards both old lines.
        store.record_instance("run-a", "i-0new").unwrap();
        let record = store.load("run-a").unwrap();
        assert_eq!(record.instance_id, "i-0new");
        assert_eq!(record.public_ip, None);
    }

    #[test]
    fn test_resolve_without_runs_is_an_error() {
        let (_dir, store) = store();
        let err = store.resolve(None).unwrap_err();
        assert!(err.to_string().contains("no runs recorded"));
    }

    #[test]
    fn test_list_runs_sorted() {
        let (_dir, store) = store();
        store.record_instance("20260828-2", "i-b").unwrap();
        store.record_instance("20260828-1", "i-a").unwrap();
        assert_eq!(store.list_runs().unwrap(), vec!["20260828-1", "20260828-2"]);
    }
}
