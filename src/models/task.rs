//! Task records handed to the worker pool.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Mutex;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Queued,
    InProgress,
    Successful,
    Failed,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            TaskStatus::Queued => "Queued",
            TaskStatus::InProgress => "In progress",
            TaskStatus::Successful => "Successful",
            TaskStatus::Failed => "Failed",
        };
        write!(f, "{s}")
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NetworkingConfig {
    pub connect_public: bool,
    pub connect_private: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AddAvailabilityZoneTaskData {
    pub vpc_id: String,
    pub region: String,
    pub az_name: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct UpdateNetworkingTaskData {
    pub vpc_id: String,
    pub region: String,
    pub networking_config: NetworkingConfig,
}

/// Typed payload of a task.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum TaskConfig {
    AddAvailabilityZone(AddAvailabilityZoneTaskData),
    UpdateNetworking(UpdateNetworkingTaskData),
}

impl TaskConfig {
    pub fn vpc_id(&self) -> &str {
        match self {
            TaskConfig::AddAvailabilityZone(d) => &d.vpc_id,
            TaskConfig::UpdateNetworking(d) => &d.vpc_id,
        }
    }

    pub fn region(&self) -> &str {
        match self {
            TaskConfig::AddAvailabilityZone(d) => &d.region,
            TaskConfig::UpdateNetworking(d) => &d.region,
        }
    }

    pub fn description(&self) -> String {
        match self {
            TaskConfig::AddAvailabilityZone(d) => {
                format!("Add availability zone {} to {}", d.az_name, d.vpc_id)
            }
            TaskConfig::UpdateNetworking(d) => format!(
                "Update networking for {} (public={}, private={})",
                d.vpc_id, d.networking_config.connect_public, d.networking_config.connect_private
            ),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TaskLogEntry {
    pub time: DateTime<Utc>,
    pub message: String,
}

/// A unit of work. Status and log are only mutated by the worker running it.
#[derive(Debug)]
pub struct Task {
    pub id: u64,
    pub config: TaskConfig,
    status: Mutex<TaskStatus>,
    log: Mutex<Vec<TaskLogEntry>>,
}

impl Task {
    pub fn new(id: u64, config: TaskConfig) -> Self {
        Task {
            id,
            config,
            status: Mutex::new(TaskStatus::Queued),
            log: Mutex::new(Vec::new()),
        }
    }

    pub fn status(&self) -> TaskStatus {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_status(&self, status: TaskStatus) {
        log::debug!("Task {} -> {status}", self.id);
        *self.status.lock().unwrap_or_else(|e| e.into_inner()) = status;
    }

    /// Record a message against the task and mirror it to the process log.
    pub fn log(&self, message: impl Into<String>) {
        let message = message.into();
        log::info!("[task {}] {message}", self.id);
        self.log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(TaskLogEntry {
                time: Utc::now(),
                message,
            });
    }

    pub fn messages(&self) -> Vec<String> {
        self.log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|e| e.message.clone())
            .collect()
    }
}
