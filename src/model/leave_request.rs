use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

use crate::error::{PortalError, PortalResult};

#[derive(Debug, Copy, Clone, Eq, PartialEq, Default, Serialize, Deserialize, Display, EnumString, AsRefStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum LeaveType {
    #[default]
    Sick,
    Annual,
    Casual,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize, Display, EnumString, AsRefStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum LeaveStatus {
    Pending,
    Approved,
    Rejected,
}

/// Joined from `profiles` when listing leaves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequesterProfile {
    pub full_name: String,
}

/// Row of the `leaves` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Leave {
    pub id: String,
    pub user_id: String,
    pub leave_type: LeaveType,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub reason: String,
    pub status: LeaveStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<RequesterProfile>,
}

impl Leave {
    pub fn is_pending(&self) -> bool {
        self.status == LeaveStatus::Pending
    }

    /// Number of calendar days covered, both ends included.
    pub fn days(&self) -> i64 {
        (self.end_date - self.start_date).num_days() + 1
    }

    pub fn requester_name(&self) -> Option<&str> {
        self.profile.as_ref().map(|p| p.full_name.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewLeave {
    pub leave_type: LeaveType,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub reason: String,
}

impl NewLeave {
    /// Form-level checks. The leave manager does not call this.
    pub fn validate(&self, today: NaiveDate) -> PortalResult<()> {
        if self.start_date < today {
            return Err(PortalError::InvalidInput(
                "start_date cannot be in the past".to_string(),
            ));
        }
        if self.end_date < self.start_date {
            return Err(PortalError::InvalidInput(
                "start_date cannot be after end_date".to_string(),
            ));
        }
        if self.reason.trim().is_empty() {
            return Err(PortalError::InvalidInput("reason is required".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LeaveUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leave_type: Option<LeaveType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_date: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_date: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<LeaveStatus>,
}

impl LeaveUpdate {
    pub fn status(status: LeaveStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }
}
