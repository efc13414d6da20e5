use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::MAX_TITLE_LEN;
use crate::model::*;
use crate::time::{TimeRange, normalize_date, normalize_time};

use super::{Engine, EngineError, Txn};

#[derive(Debug, Clone, Default)]
pub struct AvailabilityRequest {
    pub id: Option<Ulid>,
    pub date: Option<String>,
    pub start: Option<String>,
    pub end: Option<String>,
    pub title: Option<String>,
}

/// Fields left as `None` keep their current value.
#[derive(Debug, Clone, Default)]
pub struct AvailabilityPatch {
    pub date: Option<String>,
    pub start: Option<String>,
    pub end: Option<String>,
    pub title: Option<String>,
}

fn require_professional(caller: &Caller) -> Result<Ulid, EngineError> {
    caller
        .professional_id()
        .ok_or(EngineError::Unauthorized("only professionals manage availability"))
}

fn range_of(start: chrono::NaiveTime, end: chrono::NaiveTime) -> Result<TimeRange, EngineError> {
    TimeRange::try_new(start, end)
        .ok_or_else(|| EngineError::InvalidRange(format!("start {start} must be before end {end}")))
}

/// Reject `range` on `date` if it overlaps another open interval (other than
/// `except`) or a booked appointment. Touching is fine.
fn check_free(
    txn: &Txn<'_>,
    date: NaiveDate,
    range: &TimeRange,
    except: Option<Ulid>,
) -> Result<(), EngineError> {
    if let Some(other) = txn
        .intervals_on(date)
        .iter()
        .find(|i| Some(i.id) != except && i.range.overlaps(range))
    {
        return Err(EngineError::InvalidRange(format!(
            "{range} overlaps interval {} {}",
            other.id, other.range
        )));
    }
    if let Some(appt) = txn.booked_overlapping(date, range) {
        return Err(EngineError::InvalidRange(format!(
            "{range} overlaps booked appointment {}",
            appt.id
        )));
    }
    Ok(())
}

impl Engine {
    pub async fn create_availability(
        &self,
        caller: &Caller,
        req: AvailabilityRequest,
    ) -> Result<AvailabilityInterval, EngineError> {
        let professional_id = require_professional(caller)?;
        let date = normalize_date(req.date.as_deref().ok_or(EngineError::MissingField("date"))?)?;
        let start =
            normalize_time(req.start.as_deref().ok_or(EngineError::MissingField("start_time"))?)?;
        let end = normalize_time(req.end.as_deref().ok_or(EngineError::MissingField("end_time"))?)?;
        let range = range_of(start, end)?;
        let title = req.title.unwrap_or_else(|| DEFAULT_TITLE.to_string());

        let mut txn = self.begin(professional_id).await?;
        let _claim = req
            .id
            .map(|id| self.claim_id(id, &self.interval_owner))
            .transpose()?;
        check_free(&txn, date, &range, None)?;
        let interval = txn.create(req.id, date, start, end, title)?;
        txn.commit().await?;
        tracing::debug!("created interval {} on {date} {range}", interval.id);
        Ok(interval)
    }

    pub async fn edit_availability(
        &self,
        caller: &Caller,
        id: Ulid,
        patch: AvailabilityPatch,
    ) -> Result<AvailabilityInterval, EngineError> {
        let professional_id = require_professional(caller)?;
        let owner = self
            .interval_owner
            .get(&id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(id))?;
        if owner != professional_id {
            return Err(EngineError::Unauthorized("interval belongs to another professional"));
        }

        let date = patch.date.as_deref().map(normalize_date).transpose()?;
        let start = patch.start.as_deref().map(normalize_time).transpose()?;
        let end = patch.end.as_deref().map(normalize_time).transpose()?;
        if let Some(title) = &patch.title
            && title.len() > MAX_TITLE_LEN
        {
            return Err(EngineError::LimitExceeded("title too long"));
        }

        let mut txn = self.begin(professional_id).await?;
        let current = txn.interval(id).cloned().ok_or(EngineError::NotFound(id))?;
        let date = date.unwrap_or(current.date);
        let range = range_of(
            start.unwrap_or(current.range.start),
            end.unwrap_or(current.range.end),
        )?;
        check_free(&txn, date, &range, Some(id))?;

        let updated = AvailabilityInterval {
            id,
            professional_id,
            date,
            range,
            title: patch.title.unwrap_or(current.title),
        };
        txn.update(updated.clone())?;
        txn.commit().await?;
        Ok(updated)
    }

    pub async fn delete_availability(&self, caller: &Caller, id: Ulid) -> Result<(), EngineError> {
        let professional_id = require_professional(caller)?;
        let mut txn = self.begin(professional_id).await?;
        txn.delete(id)?;
        txn.commit().await
    }

    /// Open intervals of a professional, by date then start time.
    pub async fn list_availability(
        &self,
        professional_id: Ulid,
        date: Option<NaiveDate>,
    ) -> Result<Vec<AvailabilityInterval>, EngineError> {
        let guard = self.read_calendar(professional_id).await?;
        Ok(match date {
            Some(date) => guard.intervals_on(date).to_vec(),
            None => guard.intervals().cloned().collect(),
        })
    }

    pub async fn list_my_availability(
        &self,
        caller: &Caller,
        date: Option<NaiveDate>,
    ) -> Result<Vec<AvailabilityInterval>, EngineError> {
        let professional_id = require_professional(caller)?;
        self.list_availability(professional_id, date).await
    }
}
