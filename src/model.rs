use std::collections::{BTreeMap, HashMap};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::time::TimeRange;

/// Title given to intervals that are recreated from nothing on cancellation.
pub const DEFAULT_TITLE: &str = "Available";

/// Open time declared by a professional on one calendar day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityInterval {
    pub id: Ulid,
    pub professional_id: Ulid,
    pub date: NaiveDate,
    pub range: TimeRange,
    pub title: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AppointmentStatus {
    Booked,
    Cancelled,
    Completed,
}

impl AppointmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppointmentStatus::Booked => "BOOKED",
            AppointmentStatus::Cancelled => "CANCELLED",
            AppointmentStatus::Completed => "COMPLETED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "BOOKED" => Some(AppointmentStatus::Booked),
            "CANCELLED" | "CANCELED" => Some(AppointmentStatus::Cancelled),
            "COMPLETED" => Some(AppointmentStatus::Completed),
            _ => None,
        }
    }
}

impl std::fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Ulid,
    pub user_id: Ulid,
    pub professional_id: Ulid,
    pub date: NaiveDate,
    pub range: TimeRange,
    pub status: AppointmentStatus,
}

impl Appointment {
    pub fn is_booked(&self) -> bool {
        self.status == AppointmentStatus::Booked
    }
}

// ── Directory ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UserRole {
    User,
    Professional,
}

impl UserRole {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "USER" => Some(UserRole::User),
            "PROFESSIONAL" => Some(UserRole::Professional),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub id: Ulid,
    pub role: UserRole,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfessionalRecord {
    pub id: Ulid,
    pub user_id: Ulid,
    pub name: Option<String>,
}

/// How the engine sees the caller of an operation. Resolved once, at the
/// authorization boundary, from the verified user id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Professional(Ulid),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    pub user_id: Ulid,
    pub role: Role,
}

impl Caller {
    pub fn client(user_id: Ulid) -> Self {
        Self { user_id, role: Role::Client }
    }

    pub fn professional_id(&self) -> Option<Ulid> {
        match self.role {
            Role::Professional(id) => Some(id),
            Role::Client => None,
        }
    }

    /// True if the caller booked `appointment` or is the professional serving it.
    pub fn may_access(&self, appointment: &Appointment) -> bool {
        appointment.user_id == self.user_id
            || self.professional_id() == Some(appointment.professional_id)
    }
}

// ── Calendar state ────────────────────────────────────────────────

/// Everything owned by one professional: open intervals per day and the appointments
/// carved out of them. Guarded as a unit, so a lock on the calendar covers every
/// interval and appointment a booking or cancellation touches.
#[derive(Debug, Clone)]
pub struct Calendar {
    pub professional_id: Ulid,
    /// Open intervals per day, sorted by `(range.start, id)`.
    pub days: BTreeMap<NaiveDate, Vec<AvailabilityInterval>>,
    pub appointments: HashMap<Ulid, Appointment>,
}

impl Calendar {
    pub fn new(professional_id: Ulid) -> Self {
        Self {
            professional_id,
            days: BTreeMap::new(),
            appointments: HashMap::new(),
        }
    }

    /// Insert interval maintaining sort order by `(start, id)`.
    pub fn insert_interval(&mut self, interval: AvailabilityInterval) {
        let day = self.days.entry(interval.date).or_default();
        let key = (interval.range.start, interval.id);
        let pos = day
            .binary_search_by_key(&key, |i| (i.range.start, i.id))
            .unwrap_or_else(|e| e);
        day.insert(pos, interval);
    }

    /// Remove interval by id, dropping the day entry once it is empty.
    pub fn remove_interval(&mut self, id: Ulid) -> Option<AvailabilityInterval> {
        let (date, pos) = self.days.iter().find_map(|(date, day)| {
            day.iter().position(|i| i.id == id).map(|pos| (*date, pos))
        })?;
        let day = self.days.get_mut(&date)?;
        let removed = day.remove(pos);
        if day.is_empty() {
            self.days.remove(&date);
        }
        Some(removed)
    }

    pub fn interval(&self, id: Ulid) -> Option<&AvailabilityInterval> {
        self.days.values().flatten().find(|i| i.id == id)
    }

    pub fn intervals_on(&self, date: NaiveDate) -> &[AvailabilityInterval] {
        self.days.get(&date).map(Vec::as_slice).unwrap_or(&[])
    }

    /// All intervals, ordered by date then start.
    pub fn intervals(&self) -> impl Iterator<Item = &AvailabilityInterval> {
        self.days.values().flatten()
    }

    pub fn booked_on(&self, date: NaiveDate) -> impl Iterator<Item = &Appointment> {
        self.appointments
            .values()
            .filter(move |a| a.date == date && a.is_booked())
    }
}

/// The event types, flat with no nesting. A committed transaction is one WAL record
/// holding one or more of these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    UserRegistered {
        id: Ulid,
        role: UserRole,
    },
    ProfessionalRegistered {
        id: Ulid,
        user_id: Ulid,
        name: Option<String>,
    },
    IntervalCreated(AvailabilityInterval),
    /// Full replacement; the date may change.
    IntervalUpdated(AvailabilityInterval),
    IntervalRemoved {
        id: Ulid,
        professional_id: Ulid,
    },
    AppointmentBooked(Appointment),
    AppointmentStatusChanged {
        id: Ulid,
        professional_id: Ulid,
        status: AppointmentStatus,
    },
}

impl Event {
    /// The calendar this event mutates, if any.
    pub fn professional_id(&self) -> Option<Ulid> {
        match self {
            Event::IntervalCreated(i) | Event::IntervalUpdated(i) => Some(i.professional_id),
            Event::IntervalRemoved { professional_id, .. }
            | Event::AppointmentStatusChanged { professional_id, .. } => Some(*professional_id),
            Event::AppointmentBooked(a) => Some(a.professional_id),
            Event::ProfessionalRegistered { id, .. } => Some(*id),
            Event::UserRegistered { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;

    fn t(h: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, 0, 0).unwrap()
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 12, 18).unwrap()
    }

    fn interval(pid: Ulid, date: NaiveDate, start: u32, end: u32) -> AvailabilityInterval {
        AvailabilityInterval {
            id: Ulid::new(),
            professional_id: pid,
            date,
            range: TimeRange::new(t(start), t(end)),
            title: DEFAULT_TITLE.into(),
        }
    }

    #[test]
    fn intervals_stay_sorted_by_start() {
        let pid = Ulid::new();
        let mut cal = Calendar::new(pid);
        cal.insert_interval(interval(pid, day(), 13, 17));
        cal.insert_interval(interval(pid, day(), 9, 12));
        cal.insert_interval(interval(pid, day(), 12, 13));
        let starts: Vec<_> = cal.intervals_on(day()).iter().map(|i| i.range.start).collect();
        assert_eq!(starts, vec![t(9), t(12), t(13)]);
    }

    #[test]
    fn remove_drops_empty_day() {
        let pid = Ulid::new();
        let mut cal = Calendar::new(pid);
        let i = interval(pid, day(), 9, 17);
        let id = i.id;
        cal.insert_interval(i);
        assert!(cal.interval(id).is_some());
        assert_eq!(cal.remove_interval(id).map(|i| i.id), Some(id));
        assert!(cal.days.is_empty());
        assert!(cal.remove_interval(id).is_none());
    }

    #[test]
    fn intervals_ordered_across_days() {
        let pid = Ulid::new();
        let later = day().succ_opt().unwrap();
        let mut cal = Calendar::new(pid);
        cal.insert_interval(interval(pid, later, 9, 10));
        cal.insert_interval(interval(pid, day(), 14, 15));
        cal.insert_interval(interval(pid, day(), 8, 9));
        let order: Vec<_> = cal.intervals().map(|i| (i.date, i.range.start)).collect();
        assert_eq!(order, vec![(day(), t(8)), (day(), t(14)), (later, t(9))]);
    }

    #[test]
    fn caller_access() {
        let pid = Ulid::new();
        let appt = Appointment {
            id: Ulid::new(),
            user_id: Ulid::new(),
            professional_id: pid,
            date: day(),
            range: TimeRange::new(t(10), t(11)),
            status: AppointmentStatus::Booked,
        };
        assert!(Caller::client(appt.user_id).may_access(&appt));
        let pro = Caller { user_id: Ulid::new(), role: Role::Professional(pid) };
        assert!(pro.may_access(&appt));
        let stranger = Caller { user_id: Ulid::new(), role: Role::Professional(Ulid::new()) };
        assert!(!stranger.may_access(&appt));
    }

    #[test]
    fn status_parsing() {
        assert_eq!(AppointmentStatus::parse("cancelled"), Some(AppointmentStatus::Cancelled));
        assert_eq!(AppointmentStatus::parse("COMPLETED"), Some(AppointmentStatus::Completed));
        assert_eq!(AppointmentStatus::parse("gone"), None);
        assert_eq!(UserRole::parse("professional"), Some(UserRole::Professional));
    }
}
