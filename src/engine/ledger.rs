use std::cmp::Reverse;
use std::collections::BTreeMap;

use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

impl Engine {
    /// A professional sees every appointment on their calendar; anyone else sees
    /// the appointments they booked. Newest day first, then by start time.
    pub async fn get_my_appointments(&self, caller: &Caller) -> Result<Vec<Appointment>, EngineError> {
        let mut out: Vec<Appointment> = match caller.role {
            Role::Professional(professional_id) => {
                let guard = self.read_calendar(professional_id).await?;
                guard.appointments.values().cloned().collect()
            }
            Role::Client => {
                let ids = self
                    .user_appointments
                    .get(&caller.user_id)
                    .map(|e| e.value().clone())
                    .unwrap_or_default();
                let mut by_owner: BTreeMap<Ulid, Vec<Ulid>> = BTreeMap::new();
                for id in ids {
                    if let Some(owner) = self.appointment_owner.get(&id).map(|e| *e.value()) {
                        by_owner.entry(owner).or_default().push(id);
                    }
                }
                let mut out = Vec::new();
                for (owner, ids) in by_owner {
                    let guard = self.read_calendar(owner).await?;
                    out.extend(ids.iter().filter_map(|id| guard.appointments.get(id).cloned()));
                }
                out
            }
        };
        out.sort_by_key(|a| (Reverse(a.date), a.range.start, a.id));
        Ok(out)
    }

    pub async fn get_appointment_by_id(
        &self,
        id: Ulid,
        caller: &Caller,
    ) -> Result<Appointment, EngineError> {
        let owner = self.owner_of_appointment(id)?;
        let guard = self.read_calendar(owner).await?;
        let appointment = guard
            .appointments
            .get(&id)
            .cloned()
            .ok_or(EngineError::NotFound(id))?;
        if !caller.may_access(&appointment) {
            return Err(EngineError::Unauthorized(
                "only the booking user or the serving professional may view this appointment",
            ));
        }
        Ok(appointment)
    }
}
