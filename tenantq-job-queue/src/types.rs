//! Core types for the job queue system.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::QueueError;

/// Identifier of a job record. Assigned by the store, strictly increasing.
pub type JobId = i64;

/// Opaque identifier of a tenant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    #[inline]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TenantId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for TenantId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<u64> for TenantId {
    fn from(value: u64) -> Self {
        Self(value.to_string())
    }
}

impl From<i64> for TenantId {
    fn from(value: i64) -> Self {
        Self(value.to_string())
    }
}

/// A durable unit of deferred work as held by a [`JobStore`](crate::JobStore).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub queue: String,
    /// Serialized [`TaskDescriptor`]. Stores never look inside.
    pub payload: Vec<u8>,
    pub tenant_id: Option<TenantId>,
    pub attempts: u32,
    pub available_at: DateTime<Utc>,
    pub reserved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl JobRecord {
    /// Returns true if the record holds a lease that has not yet expired at `now`.
    pub fn is_leased(&self, now: DateTime<Utc>, lease: Duration) -> bool {
        match self.reserved_at {
            Some(reserved_at) => !lease_expired(reserved_at, now, lease),
            None => false,
        }
    }

    /// Returns true if the record may be reserved at `now` under the given lease duration.
    pub fn is_reservable(&self, now: DateTime<Utc>, lease: Duration) -> bool {
        self.available_at <= now && !self.is_leased(now, lease)
    }
}

/// A job that exhausted its attempts (or could never run), kept for inspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedJobRecord {
    pub id: JobId,
    pub queue: String,
    pub payload: Vec<u8>,
    pub tenant_id: Option<TenantId>,
    pub attempts: u32,
    pub available_at: DateTime<Utc>,
    pub reserved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub failed_at: DateTime<Utc>,
    pub last_error: String,
}

impl FailedJobRecord {
    /// Build the dead-letter record for `job`. `job.attempts` must already include the final attempt.
    pub fn from_job(job: JobRecord, failed_at: DateTime<Utc>, last_error: impl Into<String>) -> Self {
        Self {
            id: job.id,
            queue: job.queue,
            payload: job.payload,
            tenant_id: job.tenant_id,
            attempts: job.attempts,
            available_at: job.available_at,
            reserved_at: job.reserved_at,
            created_at: job.created_at,
            failed_at,
            last_error: last_error.into(),
        }
    }
}

/// What a job should do, as serialized into [`JobRecord::payload`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub job_type: String,
    #[serde(default)]
    pub args: Value,
    /// Overrides the worker's attempt budget for this job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    /// Overrides the worker's execution timeout for this job. Zero counts as unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl TaskDescriptor {
    #[inline]
    pub fn new(job_type: impl Into<String>, args: Value) -> Self {
        Self {
            job_type: job_type.into(),
            args,
            max_attempts: None,
            timeout_secs: None,
        }
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = Some(timeout.as_secs().max(1));
        self
    }

    pub fn to_payload(&self) -> Result<Vec<u8>, QueueError> {
        serde_json::to_vec(self).map_err(QueueError::from)
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self, QueueError> {
        serde_json::from_slice(payload).map_err(QueueError::from)
    }
}

/// `reserved_at + lease < now`, computed without overflowing.
pub(crate) fn lease_expired(reserved_at: DateTime<Utc>, now: DateTime<Utc>, lease: Duration) -> bool {
    now.signed_duration_since(reserved_at) > to_delta(lease)
}

/// `now + delay`, saturating at the maximum representable instant.
pub(crate) fn add_delay(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    now.checked_add_signed(to_delta(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn to_delta(duration: Duration) -> chrono::Duration {
    let millis = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
    chrono::Duration::try_milliseconds(millis).unwrap_or(chrono::Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn record(reserved_at: Option<DateTime<Utc>>) -> JobRecord {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        JobRecord {
            id: 1,
            queue: "emails".into(),
            payload: Vec::new(),
            tenant_id: None,
            attempts: 0,
            available_at: t0,
            reserved_at,
            created_at: t0,
        }
    }

    #[test]
    fn lease_is_valid_until_strictly_past_its_duration() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let job = record(Some(t0));
        let lease = Duration::from_secs(30);

        assert!(job.is_leased(t0 + chrono::Duration::seconds(30), lease));
        assert!(!job.is_reservable(t0 + chrono::Duration::seconds(30), lease));
        assert!(job.is_reservable(t0 + chrono::Duration::seconds(31), lease));
    }

    #[test]
    fn add_delay_saturates() {
        let now = Utc::now();
        assert_eq!(add_delay(now, Duration::MAX), DateTime::<Utc>::MAX_UTC);
    }

    #[test]
    fn descriptor_omits_unset_overrides() {
        let task = TaskDescriptor::new("mail.send", json!({"to": "a@example.com"}));
        let payload = task.to_payload().unwrap();
        let text = String::from_utf8(payload.clone()).unwrap();
        assert!(!text.contains("max_attempts"));
        assert_eq!(TaskDescriptor::from_payload(&payload).unwrap(), task);
    }

    #[test]
    fn numeric_tenant_ids_render_as_decimal() {
        assert_eq!(TenantId::from(42u64).as_str(), "42");
        assert_eq!(TenantId::from(42u64), TenantId::from("42"));
    }
}
