use serde::Serialize;

use super::leave_request::{Leave, LeaveStatus};
use super::task::{Task, TaskStatus};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TaskStats {
    pub total: usize,
    pub completed: usize,
    pub pending: usize,
}

impl TaskStats {
    pub fn from_tasks(tasks: &[Task]) -> Self {
        let completed = tasks.iter().filter(|t| t.status == TaskStatus::Completed).count();
        let pending = tasks.iter().filter(|t| t.status == TaskStatus::Pending).count();
        Self {
            total: tasks.len(),
            completed,
            pending,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LeaveStats {
    pub total: usize,
    pub approved: usize,
    pub pending: usize,
    pub rejected: usize,
}

impl LeaveStats {
    pub fn from_leaves(leaves: &[Leave]) -> Self {
        let count = |status: LeaveStatus| leaves.iter().filter(|l| l.status == status).count();
        Self {
            total: leaves.len(),
            approved: count(LeaveStatus::Approved),
            pending: count(LeaveStatus::Pending),
            rejected: count(LeaveStatus::Rejected),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DashboardStats {
    pub tasks: TaskStats,
    pub leaves: LeaveStats,
}

/// Share of `part` in `total` on a 0-100 scale; 0 for an empty total.
pub fn percentage(part: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64 * 100.0
    }
}
