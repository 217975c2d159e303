//! Chain store shared by the in-memory and JSONL repositories.
//!
//! Each run's chain sits behind its own mutex, and appends to one run are
//! serialized by a per-run append claim held from `begin` until the
//! transaction commits or drops. The run map is locked only for lookups.
//! The JSONL flavor writes each commit to disk before the in-memory chain
//! is updated, and picks up runs and events that other processes wrote to
//! the same store whenever it is read.

use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock};

use anyhow::{Context, anyhow};
use tracing::{debug, instrument, warn};

use crate::core::event::Event;
use crate::core::types::WorkflowRun;
use crate::events::repository::{
    EventRepository, EventTransaction, NewEvent, RepoError, validate_run_id,
};
use crate::io::config::write_atomic;

fn poisoned<E>(_: E) -> RepoError {
    RepoError::Storage(anyhow!("event store lock poisoned"))
}

/// Where committed runs and events go besides memory.
pub trait ChainPersistence: Send + Sync {
    fn persist_run(&self, run: &WorkflowRun) -> Result<(), RepoError>;

    /// Write `events` after the first `offset` bytes of the run's log and
    /// return the new length. Bytes past `offset` are discarded first.
    fn persist_events(&self, run_id: &str, offset: u64, events: &[Event])
    -> Result<u64, RepoError>;

    /// Complete events recorded past `offset`, and the offset after them.
    fn load_events(&self, run_id: &str, offset: u64) -> Result<(Vec<Event>, u64), RepoError>;

    /// Recorded runs whose ids are not in `known`.
    fn load_runs(&self, known: &HashSet<String>) -> Result<Vec<WorkflowRun>, RepoError>;
}

/// Keeps nothing beyond the process lifetime.
#[derive(Debug, Default)]
pub struct Volatile;

impl ChainPersistence for Volatile {
    fn persist_run(&self, _run: &WorkflowRun) -> Result<(), RepoError> {
        Ok(())
    }

    fn persist_events(
        &self,
        _run_id: &str,
        offset: u64,
        _events: &[Event],
    ) -> Result<u64, RepoError> {
        Ok(offset)
    }

    fn load_events(&self, _run_id: &str, offset: u64) -> Result<(Vec<Event>, u64), RepoError> {
        Ok((Vec::new(), offset))
    }

    fn load_runs(&self, _known: &HashSet<String>) -> Result<Vec<WorkflowRun>, RepoError> {
        Ok(Vec::new())
    }
}

/// `<data_dir>/runs/<run-id>/{run.json,events.jsonl}`.
#[derive(Debug)]
pub struct JsonlFiles {
    runs_dir: PathBuf,
}

const RUN_FILE: &str = "run.json";
const EVENTS_FILE: &str = "events.jsonl";

impl JsonlFiles {
    fn run_dir(&self, run_id: &str) -> PathBuf {
        self.runs_dir.join(run_id)
    }
}

impl ChainPersistence for JsonlFiles {
    fn persist_run(&self, run: &WorkflowRun) -> Result<(), RepoError> {
        let dir = self.run_dir(&run.id);
        let path = dir.join(RUN_FILE);
        if path.exists() {
            return Err(RepoError::RunExists(run.id.clone()));
        }
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create run directory {}", dir.display()))?;
        let json = serde_json::to_string_pretty(run).context("failed to serialize run")?;
        write_atomic(&path, &json)?;
        Ok(())
    }

    fn persist_events(
        &self,
        run_id: &str,
        offset: u64,
        events: &[Event],
    ) -> Result<u64, RepoError> {
        let path = self.run_dir(run_id).join(EVENTS_FILE);
        let mut buf = String::new();
        for event in events {
            let line = serde_json::to_string(event)
                .with_context(|| format!("failed to serialize event {}", event.id))?;
            buf.push_str(&line);
            buf.push('\n');
        }
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        let len = file
            .metadata()
            .with_context(|| format!("failed to stat {}", path.display()))?
            .len();
        if len < offset {
            return Err(anyhow!(
                "{} shrank to {len} bytes below {offset} already committed",
                path.display()
            )
            .into());
        }
        if len > offset {
            // An interrupted append left a torn line behind the last event.
            warn!(path = %path.display(), offset, len, "discarding torn trailing bytes");
            file.set_len(offset)
                .with_context(|| format!("failed to truncate {}", path.display()))?;
        }
        file.seek(SeekFrom::Start(offset))
            .with_context(|| format!("failed to seek {}", path.display()))?;
        if let Err(err) = file.write_all(buf.as_bytes()).and_then(|()| file.flush()) {
            // Never leave a partial line for the next commit to land on.
            if let Err(rollback) = file.set_len(offset) {
                warn!(path = %path.display(), err = %rollback, "failed to roll back partial append");
            }
            return Err(anyhow::Error::new(err)
                .context(format!("failed to append to {}", path.display()))
                .into());
        }
        Ok(offset + buf.len() as u64)
    }

    fn load_events(&self, run_id: &str, offset: u64) -> Result<(Vec<Event>, u64), RepoError> {
        let path = self.run_dir(run_id).join(EVENTS_FILE);
        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok((Vec::new(), offset)),
            Err(err) => {
                return Err(anyhow::Error::new(err)
                    .context(format!("failed to open {}", path.display()))
                    .into());
            }
        };
        let len = file
            .metadata()
            .with_context(|| format!("failed to stat {}", path.display()))?
            .len();
        if len <= offset {
            return Ok((Vec::new(), offset));
        }
        file.seek(SeekFrom::Start(offset))
            .with_context(|| format!("failed to seek {}", path.display()))?;
        let mut raw = Vec::new();
        file.read_to_end(&mut raw)
            .with_context(|| format!("failed to read {}", path.display()))?;

        // An event counts once its newline is on disk; a torn tail waits.
        let Some(end) = raw.iter().rposition(|byte| *byte == b'\n') else {
            return Ok((Vec::new(), offset));
        };
        let complete = std::str::from_utf8(&raw[..=end])
            .with_context(|| format!("{} is not valid UTF-8", path.display()))?;
        let mut events = Vec::new();
        for line in complete.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let event: Event = serde_json::from_str(line).with_context(|| {
                format!(
                    "failed to parse {} after byte {offset}: {line}",
                    path.display()
                )
            })?;
            events.push(event);
        }
        Ok((events, offset + end as u64 + 1))
    }

    fn load_runs(&self, known: &HashSet<String>) -> Result<Vec<WorkflowRun>, RepoError> {
        let entries = fs::read_dir(&self.runs_dir)
            .with_context(|| format!("failed to list {}", self.runs_dir.display()))?;
        let mut runs = Vec::new();
        for entry in entries {
            let entry =
                entry.with_context(|| format!("failed to list {}", self.runs_dir.display()))?;
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let path = entry.path().join(RUN_FILE);
            if known.contains(&name) || !path.is_file() {
                continue;
            }
            let raw = fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let run: WorkflowRun = serde_json::from_str(&raw)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            runs.push(run);
        }
        Ok(runs)
    }
}

struct RunChain {
    run: WorkflowRun,
    events: Vec<Event>,
    ids: HashSet<String>,
    last_lifecycle: Option<usize>,
    /// Bytes of the persisted log already reflected in `events`.
    persisted: u64,
}

impl RunChain {
    fn new(run: WorkflowRun) -> Self {
        Self {
            run,
            events: Vec::new(),
            ids: HashSet::new(),
            last_lifecycle: None,
            persisted: 0,
        }
    }

    fn push(&mut self, event: Event) {
        if event.is_lifecycle() {
            self.last_lifecycle = Some(self.events.len());
        }
        self.ids.insert(event.id.clone());
        self.events.push(event);
    }

    /// Append events read back from storage. Nothing lands unless all of
    /// them continue the chain.
    fn extend(&mut self, events: Vec<Event>) -> Result<(), RepoError> {
        for (idx, event) in events.iter().enumerate() {
            let expected = (self.events.len() + idx) as u64;
            if event.seq != expected || event.run_id != self.run.id {
                return Err(anyhow!(
                    "corrupt chain for run {}: event {} has seq {} (expected {expected})",
                    self.run.id,
                    event.id,
                    event.seq
                )
                .into());
            }
        }
        for event in events {
            self.push(event);
        }
        Ok(())
    }

    fn last_lifecycle(&self) -> Option<&Event> {
        self.last_lifecycle.and_then(|idx| self.events.get(idx))
    }
}

/// One run's chain plus the claim that serializes appends to it.
struct RunSlot {
    chain: Mutex<RunChain>,
    appending: Mutex<bool>,
    idle: Condvar,
}

impl RunSlot {
    fn new(chain: RunChain) -> Arc<Self> {
        Arc::new(Self {
            chain: Mutex::new(chain),
            appending: Mutex::new(false),
            idle: Condvar::new(),
        })
    }

    fn chain(&self) -> Result<MutexGuard<'_, RunChain>, RepoError> {
        self.chain.lock().map_err(poisoned)
    }

    /// Wait until no other transaction is appending to this run.
    fn claim(self: &Arc<Self>) -> Result<AppendClaim, RepoError> {
        let mut appending = self.appending.lock().map_err(poisoned)?;
        while *appending {
            appending = self.idle.wait(appending).map_err(poisoned)?;
        }
        *appending = true;
        Ok(AppendClaim(Arc::clone(self)))
    }
}

/// Exclusive right to append to one run, released on drop.
struct AppendClaim(Arc<RunSlot>);

impl Drop for AppendClaim {
    fn drop(&mut self) {
        let mut appending = self
            .0
            .appending
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *appending = false;
        self.0.idle.notify_one();
    }
}

/// Event repository over in-memory chains plus a persistence flavor.
pub struct ChainRepository<P> {
    runs: RwLock<HashMap<String, Arc<RunSlot>>>,
    persistence: P,
}

pub type InMemoryEventRepository = ChainRepository<Volatile>;
pub type JsonlEventRepository = ChainRepository<JsonlFiles>;

impl ChainRepository<Volatile> {
    pub fn new() -> Self {
        Self::with_persistence(Volatile)
    }
}

impl Default for ChainRepository<Volatile> {
    fn default() -> Self {
        Self::new()
    }
}

impl ChainRepository<JsonlFiles> {
    /// Open (or create) a store under `data_dir`. Chains load on first use.
    #[instrument(skip_all, fields(data_dir = %data_dir.display()))]
    pub fn open(data_dir: &Path) -> anyhow::Result<Self> {
        let runs_dir = data_dir.join("runs");
        fs::create_dir_all(&runs_dir)
            .with_context(|| format!("failed to create {}", runs_dir.display()))?;
        let repo = Self::with_persistence(JsonlFiles { runs_dir });
        repo.discover()?;
        debug!(runs = repo.run_count()?, "opened event store");
        Ok(repo)
    }

    pub fn runs_dir(&self) -> &Path {
        &self.persistence.runs_dir
    }
}

impl<P: ChainPersistence> ChainRepository<P> {
    fn with_persistence(persistence: P) -> Self {
        Self {
            runs: RwLock::new(HashMap::new()),
            persistence,
        }
    }

    fn run_count(&self) -> Result<usize, RepoError> {
        Ok(self.runs.read().map_err(poisoned)?.len())
    }

    /// Register runs that were recorded elsewhere since we last looked.
    fn discover(&self) -> Result<(), RepoError> {
        let known: HashSet<String> = self.runs.read().map_err(poisoned)?.keys().cloned().collect();
        let found = self.persistence.load_runs(&known)?;
        if found.is_empty() {
            return Ok(());
        }
        let mut runs = self.runs.write().map_err(poisoned)?;
        for run in found {
            debug!(run_id = %run.id, "discovered run");
            runs.entry(run.id.clone())
                .or_insert_with(|| RunSlot::new(RunChain::new(run)));
        }
        Ok(())
    }

    fn slot(&self, run_id: &str) -> Result<Arc<RunSlot>, RepoError> {
        if let Some(slot) = self.runs.read().map_err(poisoned)?.get(run_id) {
            return Ok(Arc::clone(slot));
        }
        self.discover()?;
        self.runs
            .read()
            .map_err(poisoned)?
            .get(run_id)
            .cloned()
            .ok_or_else(|| RepoError::UnknownRun(run_id.to_string()))
    }

    /// Pull in events appended to storage since this chain last looked.
    fn sync(&self, chain: &mut RunChain) -> Result<(), RepoError> {
        let (events, offset) = self.persistence.load_events(&chain.run.id, chain.persisted)?;
        chain.extend(events)?;
        chain.persisted = offset;
        Ok(())
    }

    fn read_chain<T>(
        &self,
        run_id: &str,
        read: impl FnOnce(&RunChain) -> T,
    ) -> Result<T, RepoError> {
        let slot = self.slot(run_id)?;
        let mut chain = slot.chain()?;
        self.sync(&mut chain)?;
        Ok(read(&chain))
    }
}

impl<P: ChainPersistence> EventRepository for ChainRepository<P> {
    #[instrument(skip_all, fields(run_id = %run.id))]
    fn create_run(&self, run: &WorkflowRun) -> Result<(), RepoError> {
        validate_run_id(&run.id)?;
        let mut runs = self.runs.write().map_err(poisoned)?;
        if runs.contains_key(&run.id) {
            return Err(RepoError::RunExists(run.id.clone()));
        }
        self.persistence.persist_run(run)?;
        runs.insert(run.id.clone(), RunSlot::new(RunChain::new(run.clone())));
        Ok(())
    }

    fn get_run(&self, run_id: &str) -> Result<Option<WorkflowRun>, RepoError> {
        match self.slot(run_id) {
            Ok(slot) => Ok(Some(slot.chain()?.run.clone())),
            Err(RepoError::UnknownRun(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn list_runs(&self) -> Result<Vec<WorkflowRun>, RepoError> {
        self.discover()?;
        let slots: Vec<Arc<RunSlot>> = self.runs.read().map_err(poisoned)?.values().cloned().collect();
        let mut runs = Vec::with_capacity(slots.len());
        for slot in slots {
            runs.push(slot.chain()?.run.clone());
        }
        runs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(runs)
    }

    fn begin<'a>(&'a self, run_id: &str) -> Result<Box<dyn EventTransaction + 'a>, RepoError> {
        let slot = self.slot(run_id)?;
        let claim = slot.claim()?;
        let (base_len, base_tail, base_lifecycle) = {
            let mut chain = slot.chain()?;
            self.sync(&mut chain)?;
            (
                chain.events.len(),
                chain.events.last().cloned(),
                chain.last_lifecycle().cloned(),
            )
        };
        Ok(Box::new(ChainTransaction {
            claim,
            persistence: &self.persistence,
            run_id: run_id.to_string(),
            base_len,
            base_tail,
            base_lifecycle,
            staged: Vec::new(),
            appended: Vec::new(),
        }))
    }

    fn get_chain(&self, run_id: &str) -> Result<Vec<Event>, RepoError> {
        self.read_chain(run_id, |chain| chain.events.clone())
    }

    fn get_latest_lifecycle_event(&self, run_id: &str) -> Result<Option<Event>, RepoError> {
        self.read_chain(run_id, |chain| chain.last_lifecycle().cloned())
    }

    fn latest_lifecycle_events(
        &self,
        run_ids: &[String],
    ) -> Result<HashMap<String, Event>, RepoError> {
        let mut out = HashMap::new();
        for run_id in run_ids {
            match self.get_latest_lifecycle_event(run_id) {
                Ok(Some(event)) => {
                    out.insert(run_id.clone(), event);
                }
                Ok(None) | Err(RepoError::UnknownRun(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(out)
    }
}

struct ChainTransaction<'a> {
    claim: AppendClaim,
    persistence: &'a dyn ChainPersistence,
    run_id: String,
    /// Chain length, tail and last lifecycle event when the claim was taken.
    base_len: usize,
    base_tail: Option<Event>,
    base_lifecycle: Option<Event>,
    staged: Vec<NewEvent>,
    appended: Vec<Event>,
}

impl ChainTransaction<'_> {
    fn slot(&self) -> &RunSlot {
        &self.claim.0
    }
}

impl EventTransaction for ChainTransaction<'_> {
    fn run_id(&self) -> &str {
        &self.run_id
    }

    fn tail(&self) -> Option<&Event> {
        self.appended.last().or(self.base_tail.as_ref())
    }

    fn last_lifecycle(&self) -> Option<&Event> {
        self.appended
            .iter()
            .rev()
            .find(|event| event.is_lifecycle())
            .or(self.base_lifecycle.as_ref())
    }

    fn contains(&self, event_id: &str) -> bool {
        self.appended.iter().any(|event| event.id == event_id)
            || self
                .slot()
                .chain
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .ids
                .contains(event_id)
    }

    fn create_event(&mut self, event: NewEvent) -> Result<(), RepoError> {
        if self.contains(&event.id) || self.staged.iter().any(|staged| staged.id == event.id) {
            return Err(RepoError::DuplicateEvent(event.id));
        }
        self.staged.push(event);
        Ok(())
    }

    fn append_to_chain_end(
        &mut self,
        event_id: &str,
        parent_id: Option<&str>,
    ) -> Result<Event, RepoError> {
        let idx = self
            .staged
            .iter()
            .position(|staged| staged.id == event_id)
            .ok_or_else(|| RepoError::NotStaged(event_id.to_string()))?;

        if let Some(parent) = parent_id {
            if !self.contains(parent) {
                return Err(RepoError::UnknownEvent {
                    run_id: self.run_id.clone(),
                    event_id: parent.to_string(),
                });
            }
        }

        let (seq, tail_id) = match self.tail() {
            Some(tail) => {
                let created_at = self.staged[idx].created_at;
                if created_at < tail.created_at {
                    return Err(RepoError::OutOfOrder {
                        tail: tail.created_at,
                        new: created_at,
                    });
                }
                (tail.seq + 1, Some(tail.id.clone()))
            }
            None => (0, None),
        };

        let staged = self.staged.remove(idx);
        let event = Event {
            id: staged.id,
            run_id: self.run_id.clone(),
            seq,
            parent_id: parent_id.map(str::to_string).or(tail_id),
            created_at: staged.created_at,
            payload: staged.payload,
        };
        self.appended.push(event.clone());
        Ok(event)
    }

    fn commit_with(
        mut self: Box<Self>,
        observer: &mut dyn FnMut(&Event),
    ) -> Result<Vec<Event>, RepoError> {
        if self.appended.is_empty() {
            return Ok(Vec::new());
        }
        let appended = std::mem::take(&mut self.appended);
        {
            let mut chain = self.slot().chain()?;
            if chain.events.len() != self.base_len {
                return Err(anyhow!(
                    "run {} was appended to by another writer during this transaction",
                    self.run_id
                )
                .into());
            }
            let offset = chain.persisted;
            chain.persisted = self
                .persistence
                .persist_events(&self.run_id, offset, &appended)?;
            for event in &appended {
                chain.push(event.clone());
            }
        }
        // Still under the append claim, so observers see commit order.
        for event in &appended {
            observer(event);
        }
        Ok(appended)
    }
}
