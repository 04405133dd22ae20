//! Durable VPC descriptor storage
//!
//! One JSON file per VPC under the state directory. Writes go to a temporary
//! file in the same directory which then replaces the record, so a reader
//! sees either the old or the new descriptor and never a partial one.
//!
//! The directory also holds the host lock and the operation journal.

use crate::control::JournalEntry;
use crate::error::{Error, Result};
use crate::network::naming::validate_name;
use crate::vpc::VpcDescriptor;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use tempfile::NamedTempFile;

const LOCK_FILE: &str = ".lock";
const JOURNAL_FILE: &str = "journal.jsonl";
const RECORD_EXT: &str = "json";

/// Exclusive host-wide lock, released on drop
pub struct HostLock {
    _flock: Flock<File>,
}

pub struct ConfigStore {
    dir: PathBuf,
    journal_limit: usize,
}

impl ConfigStore {
    /// Open the store, creating the state directory if needed
    pub fn open(dir: impl Into<PathBuf>, journal_limit: usize) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir, journal_limit })
    }

    fn record_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", name, RECORD_EXT))
    }

    /// Take the host-wide lock, blocking until it is free
    ///
    /// NAT and forwarding are host-scoped, so one lock covers every VPC.
    pub fn lock(&self) -> Result<HostLock> {
        let path = self.dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| Error::Lock {
                path: path.clone(),
                message: e.to_string(),
            })?;

        let flock = Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, errno)| Error::Lock {
            path: path.clone(),
            message: errno.desc().to_string(),
        })?;

        tracing::debug!(path = %path.display(), "host lock acquired");
        Ok(HostLock { _flock: flock })
    }

    pub fn exists(&self, name: &str) -> bool {
        self.record_path(name).exists()
    }

    /// Load one descriptor
    pub fn load(&self, name: &str) -> Result<VpcDescriptor> {
        self.try_load(name)?
            .ok_or_else(|| Error::not_found("VPC", name))
    }

    /// Load one descriptor, `None` if there is no record
    pub fn try_load(&self, name: &str) -> Result<Option<VpcDescriptor>> {
        validate_name(name)?;
        let path = self.record_path(name);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let vpc = serde_json::from_str(&content).map_err(|e| Error::StateParse {
            path: path.clone(),
            source: e,
        })?;
        Ok(Some(vpc))
    }

    /// Names of every stored descriptor, sorted
    pub fn names(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXT) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str())
                && !stem.starts_with('.')
            {
                names.push(stem.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Every descriptor, ordered by name
    ///
    /// Records that fail to parse are returned beside the readable ones so a
    /// single corrupt file does not hide the rest.
    pub fn load_all(&self) -> Result<(Vec<VpcDescriptor>, Vec<(String, Error)>)> {
        let mut vpcs = Vec::new();
        let mut unreadable = Vec::new();
        for name in self.names()? {
            match self.try_load(&name) {
                Ok(Some(vpc)) => vpcs.push(vpc),
                Ok(None) => {}
                Err(e @ (Error::StateParse { .. } | Error::InvalidName { .. })) => {
                    unreadable.push((name, e))
                }
                Err(e) => return Err(e),
            }
        }
        Ok((vpcs, unreadable))
    }

    /// Atomically write a descriptor
    pub fn save(&self, vpc: &VpcDescriptor) -> Result<()> {
        let content = serde_json::to_string_pretty(vpc)?;

        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(content.as_bytes())?;
        tmp.write_all(b"\n")?;
        tmp.as_file().sync_all()?;
        tmp.persist(self.record_path(&vpc.name))
            .map_err(|e| Error::Io(e.error))?;

        tracing::debug!(vpc = %vpc.name, "descriptor saved");
        Ok(())
    }

    /// Remove a descriptor; absence is not an error
    pub fn delete(&self, name: &str) -> Result<()> {
        validate_name(name)?;
        match fs::remove_file(self.record_path(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Append entries to the journal, keeping only the newest `journal_limit`
    pub fn append_journal(&self, entries: &[JournalEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut all = self.read_journal()?;
        all.extend(entries.iter().cloned());
        let skip = all.len().saturating_sub(self.journal_limit);

        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        for entry in &all[skip..] {
            serde_json::to_writer(&mut tmp, entry)?;
            tmp.write_all(b"\n")?;
        }
        tmp.persist(self.dir.join(JOURNAL_FILE))
            .map_err(|e| Error::Io(e.error))?;
        Ok(())
    }

    /// Read the journal, oldest first
    ///
    /// Lines that do not parse are skipped.
    pub fn read_journal(&self) -> Result<Vec<JournalEntry>> {
        let file = match File::open(self.dir.join(JOURNAL_FILE)) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(entry) => entries.push(entry),
                Err(e) => tracing::warn!(error = %e, "skipping unreadable journal line"),
            }
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{Journal, Outcome};
    use crate::vpc::{NatState, VpcState};
    use chrono::Utc;
    use std::net::Ipv4Addr;
    use tempfile::tempdir;

    fn vpc(name: &str) -> VpcDescriptor {
        VpcDescriptor {
            name: name.to_string(),
            cidr: "10.0.0.0/16".parse().unwrap(),
            gateway: Ipv4Addr::new(10, 0, 0, 1),
            switch: format!("vpc-{}", name),
            state: VpcState::Created,
            nat: NatState::default(),
            subnets: Vec::new(),
            peerings: Vec::new(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_load_missing_is_not_found() {
        let dir = tempdir().unwrap();
        let store = ConfigStore::open(dir.path(), 10).unwrap();
        assert!(matches!(store.load("nope"), Err(Error::NotFound { .. })));
        assert!(store.try_load("nope").unwrap().is_none());
        assert!(matches!(
            store.try_load("../etc/passwd"),
            Err(Error::InvalidName { .. })
        ));
    }

    #[test]
    fn test_save_load_delete() {
        let dir = tempdir().unwrap();
        let store = ConfigStore::open(dir.path(), 10).unwrap();

        store.save(&vpc("prod")).unwrap();
        assert!(store.exists("prod"));
        assert_eq!(store.load("prod").unwrap().name, "prod");

        store.delete("prod").unwrap();
        assert!(!store.exists("prod"));
        // Idempotent
        store.delete("prod").unwrap();
    }

    #[test]
    fn test_save_replaces_and_leaves_no_temp_files() {
        let dir = tempdir().unwrap();
        let store = ConfigStore::open(dir.path(), 10).unwrap();

        let mut record = vpc("prod");
        store.save(&record).unwrap();
        record.state = VpcState::Ready;
        store.save(&record).unwrap();

        assert_eq!(store.load("prod").unwrap().state, VpcState::Ready);
        let files: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn test_names_sorted() {
        let dir = tempdir().unwrap();
        let store = ConfigStore::open(dir.path(), 10).unwrap();
        for name in ["zeta", "alpha", "mid"] {
            store.save(&vpc(name)).unwrap();
        }
        store.lock().unwrap();
        store.append_journal(&[]).unwrap();

        assert_eq!(store.names().unwrap(), vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn test_load_all_keeps_going_past_corrupt_record() {
        let dir = tempdir().unwrap();
        let store = ConfigStore::open(dir.path(), 10).unwrap();
        store.save(&vpc("beta")).unwrap();
        store.save(&vpc("alpha")).unwrap();
        fs::write(dir.path().join("broken.json"), "{").unwrap();

        let (vpcs, unreadable) = store.load_all().unwrap();
        let names: Vec<_> = vpcs.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "beta"]);
        assert_eq!(unreadable.len(), 1);
        assert_eq!(unreadable[0].0, "broken");
        assert!(matches!(unreadable[0].1, Error::StateParse { .. }));
    }

    #[test]
    fn test_corrupt_record_reports_path() {
        let dir = tempdir().unwrap();
        let store = ConfigStore::open(dir.path(), 10).unwrap();
        fs::write(dir.path().join("bad.json"), "{ not json").unwrap();

        let err = store.load("bad").unwrap_err();
        assert!(matches!(err, Error::StateParse { .. }));
        assert!(err.to_string().contains("bad.json"));
    }

    #[test]
    fn test_journal_trimmed_to_limit() {
        let dir = tempdir().unwrap();
        let store = ConfigStore::open(dir.path(), 3).unwrap();

        let mut journal = Journal::new();
        for i in 0..5 {
            journal.record("prod", &format!("step {}", i), &Outcome::ok(""));
        }
        store.append_journal(journal.entries()).unwrap();

        let entries = store.read_journal().unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].step, "step 2");
        assert_eq!(entries[2].step, "step 4");
    }

    #[test]
    fn test_lock_reacquired_after_drop() {
        let dir = tempdir().unwrap();
        let store = ConfigStore::open(dir.path(), 10).unwrap();
        let guard = store.lock().unwrap();
        drop(guard);
        assert!(store.lock().is_ok());
    }

    #[test]
    fn test_lock_excludes_second_holder() {
        let dir = tempdir().unwrap();
        let store = ConfigStore::open(dir.path(), 10).unwrap();
        let guard = store.lock().unwrap();

        let open = || {
            OpenOptions::new()
                .write(true)
                .open(dir.path().join(LOCK_FILE))
                .unwrap()
        };
        match Flock::lock(open(), FlockArg::LockExclusiveNonblock) {
            Ok(_) => panic!("second holder got the host lock"),
            Err((_, errno)) => assert_eq!(errno, nix::errno::Errno::EWOULDBLOCK),
        }

        drop(guard);
        assert!(Flock::lock(open(), FlockArg::LockExclusiveNonblock).is_ok());
    }
}
