mod availability;
mod booking;
mod directory;
mod error;
mod ledger;
mod store;

pub use availability::{AvailabilityPatch, AvailabilityRequest};
pub use booking::{Booking, BookingRequest, Restore, plan_restore, split_around};
pub use directory::Directory;
pub use error::{EngineError, ErrorKind};
pub use store::Txn;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{Mutex, OwnedRwLockReadGuard, RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::model::*;
use crate::wal::{Record, Wal};

pub type SharedCalendar = Arc<RwLock<Calendar>>;

/// Durable sink for committed transactions. The engine applies a record to memory
/// only after `append` has returned `Ok`.
#[async_trait]
pub trait CommitLog: Send + Sync {
    async fn append(&self, record: Record) -> io::Result<()>;
    /// Replace the log's contents with `snapshot`.
    async fn compact(&self, snapshot: Vec<Record>) -> io::Result<()>;
    async fn appends_since_compact(&self) -> u64;
}

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
    Append {
        record: Record,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        records: Vec<Record>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders with the shared result.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { record, response } => {
                let mut batch = vec![(record, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { record, response }) => batch.push((record, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break, // drained, flush the batch
                    }
                }

                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                    .record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                if let Err(e) = &result {
                    tracing::error!("WAL flush failed for {} records: {e}", batch.len());
                }
                respond_batch(batch, &result);

                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Record, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let result = batch
        .iter()
        .try_for_each(|(record, _)| wal.append_buffered(record))
        .and_then(|()| wal.flush_sync());
    // Every commit in the batch is refused, so none of it may survive on disk.
    if result.is_err()
        && let Err(e) = wal.discard_unsynced()
    {
        tracing::error!("WAL rollback failed, refusing appends: {e}");
    }
    result
}

fn respond_batch(batch: Vec<(Record, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { records, response } => {
            let result = Wal::write_compact_file(wal.path(), &records)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

/// `CommitLog` backed by an on-disk WAL and its group-commit writer task.
pub struct WalLog {
    tx: mpsc::Sender<WalCommand>,
}

impl WalLog {
    /// Must be called from within a tokio runtime.
    pub fn spawn(wal: Wal) -> Self {
        let (tx, rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, rx));
        Self { tx }
    }

    async fn request<T>(&self, cmd: WalCommand, rx: oneshot::Receiver<T>) -> io::Result<T> {
        self.tx
            .send(cmd)
            .await
            .map_err(|_| io::Error::other("WAL writer shut down"))?;
        rx.await
            .map_err(|_| io::Error::other("WAL writer dropped response"))
    }
}

#[async_trait]
impl CommitLog for WalLog {
    async fn append(&self, record: Record) -> io::Result<()> {
        let (response, rx) = oneshot::channel();
        self.request(WalCommand::Append { record, response }, rx).await?
    }

    async fn compact(&self, snapshot: Vec<Record>) -> io::Result<()> {
        let (response, rx) = oneshot::channel();
        self.request(WalCommand::Compact { records: snapshot, response }, rx)
            .await?
    }

    async fn appends_since_compact(&self) -> u64 {
        let (response, rx) = oneshot::channel();
        self.request(WalCommand::AppendsSinceCompact { response }, rx)
            .await
            .unwrap_or(0)
    }
}

// ── Engine ───────────────────────────────────────────────

/// Drop after commit, so the id is visible in its owner index before release.
pub(super) struct IdClaim<'e> {
    engine: &'e Engine,
    id: Ulid,
}

impl Drop for IdClaim<'_> {
    fn drop(&mut self) {
        self.engine.pending_ids.remove(&self.id);
    }
}

pub struct Engine {
    calendars: DashMap<Ulid, SharedCalendar>,
    users: DashMap<Ulid, UserRecord>,
    professionals: DashMap<Ulid, ProfessionalRecord>,
    professional_by_user: DashMap<Ulid, Ulid>,
    /// Reverse lookups: entity id → owning professional.
    interval_owner: DashMap<Ulid, Ulid>,
    appointment_owner: DashMap<Ulid, Ulid>,
    user_appointments: DashMap<Ulid, Vec<Ulid>>,
    /// Caller-supplied ids held by transactions that have not committed yet.
    pending_ids: DashMap<Ulid, ()>,
    /// Serializes directory writes and compaction snapshots.
    directory_lock: Mutex<()>,
    log: Arc<dyn CommitLog>,
    lock_timeout: Duration,
}

impl Engine {
    /// Replay the WAL at `wal_path` and start its writer task.
    pub fn new(wal_path: PathBuf, lock_timeout: Duration) -> io::Result<Self> {
        let history = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let log = Arc::new(WalLog::spawn(wal));
        Ok(Self::with_log(log, history, lock_timeout))
    }

    /// Build an engine over an arbitrary commit log, replaying `history` first.
    pub fn with_log(log: Arc<dyn CommitLog>, history: Vec<Record>, lock_timeout: Duration) -> Self {
        let engine = Self {
            calendars: DashMap::new(),
            users: DashMap::new(),
            professionals: DashMap::new(),
            professional_by_user: DashMap::new(),
            interval_owner: DashMap::new(),
            appointment_owner: DashMap::new(),
            user_appointments: DashMap::new(),
            pending_ids: DashMap::new(),
            directory_lock: Mutex::new(()),
            log,
            lock_timeout,
        };

        // We're the sole owner of these Arcs, so try_write always succeeds
        // instantly. Never block here: this may run inside an async context.
        for record in &history {
            for event in record {
                match event {
                    Event::UserRegistered { .. } | Event::ProfessionalRegistered { .. } => {
                        engine.apply_directory(event);
                    }
                    other => {
                        if let Some(pid) = other.professional_id()
                            && let Some(cal) = engine.get_calendar(&pid)
                        {
                            let mut guard = cal.try_write().expect("replay: uncontended write");
                            engine.apply_to_calendar(&mut guard, other);
                        }
                    }
                }
            }
        }

        engine
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    pub fn get_calendar(&self, professional_id: &Ulid) -> Option<SharedCalendar> {
        self.calendars.get(professional_id).map(|e| e.value().clone())
    }

    pub fn professional_count(&self) -> usize {
        self.professionals.len()
    }

    /// Open a transaction on one professional's calendar. Waits at most the
    /// configured lock timeout, then fails with `Conflict`.
    pub async fn begin(&self, professional_id: Ulid) -> Result<Txn<'_>, EngineError> {
        let cal = self
            .get_calendar(&professional_id)
            .ok_or(EngineError::NotFound(professional_id))?;
        match tokio::time::timeout(self.lock_timeout, cal.write_owned()).await {
            Ok(guard) => Ok(Txn::new(self, guard)),
            Err(_) => {
                metrics::counter!(crate::observability::LOCK_TIMEOUTS_TOTAL).increment(1);
                tracing::warn!("lock timeout on calendar {professional_id}");
                Err(EngineError::Conflict)
            }
        }
    }

    /// Reserve a caller-supplied interval or appointment id until the returned
    /// claim drops. Fails if the id is committed in `taken` or claimed elsewhere,
    /// whichever calendar holds it.
    pub(super) fn claim_id(
        &self,
        id: Ulid,
        taken: &DashMap<Ulid, Ulid>,
    ) -> Result<IdClaim<'_>, EngineError> {
        match self.pending_ids.entry(id) {
            Entry::Occupied(_) => Err(EngineError::AlreadyExists(id)),
            Entry::Vacant(slot) => {
                if taken.contains_key(&id) {
                    return Err(EngineError::AlreadyExists(id));
                }
                slot.insert(());
                Ok(IdClaim { engine: self, id })
            }
        }
    }

    /// Shared read of a calendar, bounded by the same timeout as `begin`.
    pub(super) async fn read_calendar(
        &self,
        professional_id: Ulid,
    ) -> Result<OwnedRwLockReadGuard<Calendar>, EngineError> {
        let cal = self
            .get_calendar(&professional_id)
            .ok_or(EngineError::NotFound(professional_id))?;
        tokio::time::timeout(self.lock_timeout, cal.read_owned())
            .await
            .map_err(|_| {
                metrics::counter!(crate::observability::LOCK_TIMEOUTS_TOTAL).increment(1);
                EngineError::Conflict
            })
    }

    /// Log the record, then apply it. Nothing is applied if the log append fails.
    pub(super) async fn persist_and_apply(
        &self,
        cal: &mut Calendar,
        record: Record,
    ) -> Result<(), EngineError> {
        self.log
            .append(record.clone())
            .await
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        for event in &record {
            self.apply_to_calendar(cal, event);
        }
        Ok(())
    }

    /// Apply a calendar event (caller holds the write guard).
    fn apply_to_calendar(&self, cal: &mut Calendar, event: &Event) {
        match event {
            Event::IntervalCreated(interval) => {
                self.interval_owner.insert(interval.id, interval.professional_id);
                cal.insert_interval(interval.clone());
            }
            Event::IntervalUpdated(interval) => {
                cal.remove_interval(interval.id);
                self.interval_owner.insert(interval.id, interval.professional_id);
                cal.insert_interval(interval.clone());
            }
            Event::IntervalRemoved { id, .. } => {
                cal.remove_interval(*id);
                self.interval_owner.remove(id);
            }
            Event::AppointmentBooked(appt) => {
                self.appointment_owner.insert(appt.id, appt.professional_id);
                let mut mine = self.user_appointments.entry(appt.user_id).or_default();
                if !mine.contains(&appt.id) {
                    mine.push(appt.id);
                }
                cal.appointments.insert(appt.id, appt.clone());
            }
            Event::AppointmentStatusChanged { id, status, .. } => {
                if let Some(appt) = cal.appointments.get_mut(id) {
                    appt.status = *status;
                }
            }
            // Directory events are handled at the DashMap level, not here
            Event::UserRegistered { .. } | Event::ProfessionalRegistered { .. } => {}
        }
    }

    fn apply_directory(&self, event: &Event) {
        match event {
            Event::UserRegistered { id, role } => {
                self.users.insert(*id, UserRecord { id: *id, role: *role });
            }
            Event::ProfessionalRegistered { id, user_id, name } => {
                self.professionals.insert(
                    *id,
                    ProfessionalRecord { id: *id, user_id: *user_id, name: name.clone() },
                );
                self.professional_by_user.insert(*user_id, *id);
                self.calendars
                    .entry(*id)
                    .or_insert_with(|| Arc::new(RwLock::new(Calendar::new(*id))));
            }
            _ => {}
        }
    }

    /// Rewrite the log with only the records needed to recreate the current state.
    ///
    /// Holds the directory lock and a read guard on every calendar while the
    /// snapshot is written, so no commit can land between snapshot and swap.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _directory = self.directory_lock.lock().await;

        let mut snapshot: Vec<Record> = Vec::new();
        let mut directory: Record = self
            .users
            .iter()
            .map(|u| Event::UserRegistered { id: u.id, role: u.role })
            .collect();
        directory.extend(self.professionals.iter().map(|p| Event::ProfessionalRegistered {
            id: p.id,
            user_id: p.user_id,
            name: p.name.clone(),
        }));
        if !directory.is_empty() {
            snapshot.push(directory);
        }

        let mut ids: Vec<Ulid> = self.calendars.iter().map(|e| *e.key()).collect();
        ids.sort();
        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(cal) = self.get_calendar(&id) {
                guards.push(cal.read_owned().await);
            }
        }
        for guard in &guards {
            let mut record: Record = guard
                .intervals()
                .map(|i| Event::IntervalCreated(i.clone()))
                .collect();
            let mut appts: Vec<&Appointment> = guard.appointments.values().collect();
            appts.sort_by_key(|a| a.id);
            record.extend(appts.into_iter().map(|a| Event::AppointmentBooked(a.clone())));
            if !record.is_empty() {
                snapshot.push(record);
            }
        }

        let result = self
            .log
            .compact(snapshot)
            .await
            .map_err(|e| EngineError::WalError(e.to_string()));
        drop(guards);
        result
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        self.log.appends_since_compact().await
    }
}
