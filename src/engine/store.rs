use chrono::{NaiveDate, NaiveTime};
use tokio::sync::OwnedRwLockWriteGuard;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::time::TimeRange;
use crate::wal::Record;

use super::{Engine, EngineError};

/// A transaction over one professional's calendar.
///
/// Holds the calendar's write lock for its whole lifetime. Reads observe the
/// calendar as it was at `begin`; writes are staged and become visible only when
/// `commit` has durably logged them as a single record. Dropping a `Txn` without
/// committing discards every staged write.
pub struct Txn<'e> {
    engine: &'e Engine,
    calendar: OwnedRwLockWriteGuard<Calendar>,
    staged: Record,
}

impl<'e> Txn<'e> {
    pub(super) fn new(engine: &'e Engine, calendar: OwnedRwLockWriteGuard<Calendar>) -> Self {
        Self {
            engine,
            calendar,
            staged: Vec::new(),
        }
    }

    pub fn professional_id(&self) -> Ulid {
        self.calendar.professional_id
    }

    pub fn calendar(&self) -> &Calendar {
        &self.calendar
    }

    pub fn intervals_on(&self, date: NaiveDate) -> &[AvailabilityInterval] {
        self.calendar.intervals_on(date)
    }

    pub fn interval(&self, id: Ulid) -> Option<&AvailabilityInterval> {
        self.calendar.interval(id)
    }

    pub fn appointment(&self, id: Ulid) -> Option<&Appointment> {
        self.calendar.appointments.get(&id)
    }

    /// First interval on `date`, by start time, that covers `requested`.
    pub fn find_covering(&self, date: NaiveDate, requested: &TimeRange) -> Option<&AvailabilityInterval> {
        self.calendar
            .intervals_on(date)
            .iter()
            .find(|i| i.range.covers(requested))
    }

    /// First BOOKED appointment on `date` overlapping `range`.
    pub fn booked_overlapping(&self, date: NaiveDate, range: &TimeRange) -> Option<&Appointment> {
        self.calendar
            .booked_on(date)
            .filter(|a| a.range.overlaps(range))
            .min_by_key(|a| (a.range.start, a.id))
    }

    /// Stage a new interval, with a fresh id unless one is given. Does not check
    /// overlap with existing intervals.
    pub fn create(
        &mut self,
        id: Option<Ulid>,
        date: NaiveDate,
        start: NaiveTime,
        end: NaiveTime,
        title: String,
    ) -> Result<AvailabilityInterval, EngineError> {
        let interval = self.build(id.unwrap_or_else(Ulid::new), date, start, end, title)?;
        self.staged.push(Event::IntervalCreated(interval.clone()));
        Ok(interval)
    }

    /// Stage a fresh interval over time handed back by a cancellation. Not subject
    /// to the per-day limit: it replaces capacity a booking took away.
    pub fn reopen(&mut self, date: NaiveDate, range: TimeRange) -> AvailabilityInterval {
        let interval = AvailabilityInterval {
            id: Ulid::new(),
            professional_id: self.calendar.professional_id,
            date,
            range,
            title: DEFAULT_TITLE.to_string(),
        };
        self.staged.push(Event::IntervalCreated(interval.clone()));
        interval
    }

    fn build(
        &self,
        id: Ulid,
        date: NaiveDate,
        start: NaiveTime,
        end: NaiveTime,
        title: String,
    ) -> Result<AvailabilityInterval, EngineError> {
        let range = TimeRange::try_new(start, end).ok_or_else(|| {
            EngineError::InvalidRange(format!("start {start} must be before end {end}"))
        })?;
        if title.len() > MAX_TITLE_LEN {
            return Err(EngineError::LimitExceeded("title too long"));
        }
        if self.calendar.intervals_on(date).len() >= MAX_INTERVALS_PER_DAY {
            return Err(EngineError::LimitExceeded("too many intervals on this day"));
        }
        Ok(AvailabilityInterval {
            id,
            professional_id: self.calendar.professional_id,
            date,
            range,
            title,
        })
    }

    /// Stage the removal of `interval_id` and the insertion of `replacements`.
    ///
    /// Revalidates that the interval still exists and still covers `reserved`
    /// (the span being carved out, if any) before staging anything.
    pub fn replace(
        &mut self,
        interval_id: Ulid,
        reserved: Option<&TimeRange>,
        replacements: Vec<AvailabilityInterval>,
    ) -> Result<(), EngineError> {
        let current = self
            .calendar
            .interval(interval_id)
            .ok_or(EngineError::SlotAlreadyTaken(interval_id))?;
        if let Some(reserved) = reserved
            && !current.range.covers(reserved)
        {
            return Err(EngineError::SlotAlreadyTaken(interval_id));
        }
        for r in &replacements {
            if r.range.start >= r.range.end {
                return Err(EngineError::InvalidRange(format!("empty replacement interval {}", r.range)));
            }
        }
        let professional_id = self.calendar.professional_id;
        self.staged.push(Event::IntervalRemoved { id: interval_id, professional_id });
        self.staged
            .extend(replacements.into_iter().map(Event::IntervalCreated));
        Ok(())
    }

    /// Stage a full replacement of an existing interval (same id).
    pub fn update(&mut self, interval: AvailabilityInterval) -> Result<(), EngineError> {
        let current = self
            .calendar
            .interval(interval.id)
            .ok_or(EngineError::NotFound(interval.id))?;
        if current.date != interval.date
            && self.calendar.intervals_on(interval.date).len() >= MAX_INTERVALS_PER_DAY
        {
            return Err(EngineError::LimitExceeded("too many intervals on this day"));
        }
        if interval.range.start >= interval.range.end {
            return Err(EngineError::InvalidRange(format!("empty interval {}", interval.range)));
        }
        self.staged.push(Event::IntervalUpdated(interval));
        Ok(())
    }

    /// Stage the removal of an interval owned by this calendar's professional.
    pub fn delete(&mut self, interval_id: Ulid) -> Result<(), EngineError> {
        if self.calendar.interval(interval_id).is_none() {
            return Err(match self.engine.interval_owner.get(&interval_id) {
                Some(_) => EngineError::Unauthorized("interval belongs to another professional"),
                None => EngineError::NotFound(interval_id),
            });
        }
        let professional_id = self.calendar.professional_id;
        self.staged.push(Event::IntervalRemoved { id: interval_id, professional_id });
        Ok(())
    }

    pub fn insert_appointment(&mut self, appointment: Appointment) {
        self.staged.push(Event::AppointmentBooked(appointment));
    }

    pub fn set_status(&mut self, appointment_id: Ulid, status: AppointmentStatus) {
        let professional_id = self.calendar.professional_id;
        self.staged.push(Event::AppointmentStatusChanged {
            id: appointment_id,
            professional_id,
            status,
        });
    }

    /// Durably log all staged writes as one record, then apply them.
    pub async fn commit(mut self) -> Result<(), EngineError> {
        if self.staged.is_empty() {
            return Ok(());
        }
        let record = std::mem::take(&mut self.staged);
        self.engine.persist_and_apply(&mut self.calendar, record).await
    }
}
