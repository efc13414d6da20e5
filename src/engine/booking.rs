use ulid::Ulid;

use crate::model::*;
use crate::observability::{BOOKINGS_TOTAL, CANCELLATIONS_TOTAL};
use crate::time::{TimeRange, normalize_date, normalize_time};

use super::{Engine, EngineError, Txn};

/// Raw booking input. Every field but `id` is required; values are normalized here.
#[derive(Debug, Clone, Default)]
pub struct BookingRequest {
    pub id: Option<Ulid>,
    pub professional_id: Option<Ulid>,
    pub date: Option<String>,
    pub start: Option<String>,
    pub end: Option<String>,
}

/// A committed booking and the open intervals left on its day.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Booking {
    pub appointment: Appointment,
    pub remaining: Vec<AvailabilityInterval>,
}

/// The segments of `interval` left once `reserved` is carved out of it: the part
/// before, the part after, either, or neither. Segments get fresh ids and keep the
/// interval's title.
pub fn split_around(interval: &AvailabilityInterval, reserved: TimeRange) -> Vec<AvailabilityInterval> {
    let mut out = Vec::with_capacity(2);
    if reserved.start > interval.range.start {
        out.push(AvailabilityInterval {
            id: Ulid::new(),
            range: TimeRange::new(interval.range.start, reserved.start),
            ..interval.clone()
        });
    }
    if reserved.end < interval.range.end {
        out.push(AvailabilityInterval {
            id: Ulid::new(),
            range: TimeRange::new(reserved.end, interval.range.end),
            ..interval.clone()
        });
    }
    out
}

/// How time freed by a cancellation is folded back into the day's intervals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Restore {
    /// Neighbors on both sides: the left one absorbs the gap and the right one.
    Merge {
        left: AvailabilityInterval,
        right: AvailabilityInterval,
    },
    ExtendLeft {
        left: AvailabilityInterval,
    },
    ExtendRight {
        right: AvailabilityInterval,
    },
    /// No neighbor touches the freed time.
    Insert,
}

impl Restore {
    pub fn label(&self) -> &'static str {
        match self {
            Restore::Merge { .. } => "merge",
            Restore::ExtendLeft { .. } => "extend_left",
            Restore::ExtendRight { .. } => "extend_right",
            Restore::Insert => "insert",
        }
    }
}

/// Classify `freed` against the day's intervals by the neighbors touching its ends.
pub fn plan_restore(day: &[AvailabilityInterval], freed: &TimeRange) -> Restore {
    let left = day.iter().find(|i| i.range.end == freed.start).cloned();
    let right = day.iter().find(|i| i.range.start == freed.end).cloned();
    match (left, right) {
        (Some(left), Some(right)) => Restore::Merge { left, right },
        (Some(left), None) => Restore::ExtendLeft { left },
        (None, Some(right)) => Restore::ExtendRight { right },
        (None, None) => Restore::Insert,
    }
}

fn outcome_label(result: &Result<Booking, EngineError>) -> &'static str {
    match result {
        Ok(_) => "booked",
        Err(EngineError::NoAvailability) => "no_availability",
        Err(EngineError::SlotAlreadyTaken(_)) => "slot_taken",
        Err(EngineError::Conflict) => "conflict",
        Err(_) => "rejected",
    }
}

impl Engine {
    pub async fn book_appointment(
        &self,
        caller: &Caller,
        req: BookingRequest,
    ) -> Result<Booking, EngineError> {
        let result = self.try_book(caller, req).await;
        metrics::counter!(BOOKINGS_TOTAL, "outcome" => outcome_label(&result)).increment(1);
        result
    }

    async fn try_book(&self, caller: &Caller, req: BookingRequest) -> Result<Booking, EngineError> {
        let professional_id = req
            .professional_id
            .ok_or(EngineError::MissingField("professional_id"))?;
        let date = req.date.as_deref().ok_or(EngineError::MissingField("date"))?;
        let start = req.start.as_deref().ok_or(EngineError::MissingField("start_time"))?;
        let end = req.end.as_deref().ok_or(EngineError::MissingField("end_time"))?;

        let date = normalize_date(date)?;
        let start = normalize_time(start)?;
        let end = normalize_time(end)?;
        let requested = TimeRange::try_new(start, end).ok_or_else(|| {
            EngineError::InvalidRange(format!("start {start} must be before end {end}"))
        })?;

        let mut txn = self.begin(professional_id).await?;
        let _claim = req
            .id
            .map(|id| self.claim_id(id, &self.appointment_owner))
            .transpose()?;
        let id = req.id.unwrap_or_else(Ulid::new);

        if let Some(taken) = txn.booked_overlapping(date, &requested) {
            return Err(EngineError::SlotAlreadyTaken(taken.id));
        }
        let covering = txn
            .find_covering(date, &requested)
            .cloned()
            .ok_or(EngineError::NoAvailability)?;
        let pieces = split_around(&covering, requested);
        let mut remaining: Vec<AvailabilityInterval> = txn
            .intervals_on(date)
            .iter()
            .filter(|i| i.id != covering.id)
            .cloned()
            .chain(pieces.iter().cloned())
            .collect();
        remaining.sort_by_key(|i| (i.range.start, i.id));
        txn.replace(covering.id, Some(&requested), pieces)?;

        let appointment = Appointment {
            id,
            user_id: caller.user_id,
            professional_id,
            date,
            range: requested,
            status: AppointmentStatus::Booked,
        };
        txn.insert_appointment(appointment.clone());
        txn.commit().await?;

        tracing::info!(
            "booked {} for user {} with {professional_id} on {date} {requested}",
            appointment.id,
            caller.user_id
        );
        Ok(Booking { appointment, remaining })
    }

    /// Cancel a BOOKED appointment and hand its time back to the calendar.
    /// Cancelling twice returns the cancelled appointment unchanged.
    pub async fn cancel_appointment(
        &self,
        id: Ulid,
        caller: &Caller,
    ) -> Result<Appointment, EngineError> {
        let professional_id = self.owner_of_appointment(id)?;
        let mut txn = self.begin(professional_id).await?;
        let appointment = txn.appointment(id).cloned().ok_or(EngineError::NotFound(id))?;
        if !caller.may_access(&appointment) {
            return Err(EngineError::Unauthorized(
                "only the booking user or the serving professional may cancel",
            ));
        }
        match appointment.status {
            AppointmentStatus::Cancelled => return Ok(appointment),
            AppointmentStatus::Completed => {
                return Err(EngineError::InvalidTransition { id, from: appointment.status });
            }
            AppointmentStatus::Booked => {}
        }

        txn.set_status(id, AppointmentStatus::Cancelled);
        let restore = plan_restore(txn.intervals_on(appointment.date), &appointment.range);
        apply_restore(&mut txn, &appointment, &restore)?;
        txn.commit().await?;

        metrics::counter!(CANCELLATIONS_TOTAL, "restore" => restore.label()).increment(1);
        tracing::info!(
            "cancelled {id} on {} {}, restore: {}",
            appointment.date,
            appointment.range,
            restore.label()
        );
        Ok(Appointment { status: AppointmentStatus::Cancelled, ..appointment })
    }

    /// Mark a BOOKED appointment as served. Only the serving professional may do
    /// this; the time stays consumed.
    pub async fn complete_appointment(
        &self,
        id: Ulid,
        caller: &Caller,
    ) -> Result<Appointment, EngineError> {
        let professional_id = self.owner_of_appointment(id)?;
        let mut txn = self.begin(professional_id).await?;
        let appointment = txn.appointment(id).cloned().ok_or(EngineError::NotFound(id))?;
        if caller.professional_id() != Some(appointment.professional_id) {
            return Err(EngineError::Unauthorized(
                "only the serving professional may complete an appointment",
            ));
        }
        match appointment.status {
            AppointmentStatus::Completed => return Ok(appointment),
            AppointmentStatus::Cancelled => {
                return Err(EngineError::InvalidTransition { id, from: appointment.status });
            }
            AppointmentStatus::Booked => {}
        }
        txn.set_status(id, AppointmentStatus::Completed);
        txn.commit().await?;
        Ok(Appointment { status: AppointmentStatus::Completed, ..appointment })
    }

    pub(super) fn owner_of_appointment(&self, id: Ulid) -> Result<Ulid, EngineError> {
        self.appointment_owner
            .get(&id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(id))
    }
}

fn apply_restore(
    txn: &mut Txn<'_>,
    appointment: &Appointment,
    restore: &Restore,
) -> Result<(), EngineError> {
    let freed = appointment.range;
    match restore {
        Restore::Merge { left, right } => {
            txn.update(AvailabilityInterval {
                range: TimeRange::new(left.range.start, right.range.end),
                ..left.clone()
            })?;
            txn.delete(right.id)
        }
        Restore::ExtendLeft { left } => txn.update(AvailabilityInterval {
            range: TimeRange::new(left.range.start, freed.end),
            ..left.clone()
        }),
        Restore::ExtendRight { right } => txn.update(AvailabilityInterval {
            range: TimeRange::new(freed.start, right.range.end),
            ..right.clone()
        }),
        Restore::Insert => {
            txn.reopen(appointment.date, freed);
            Ok(())
        }
    }
}
