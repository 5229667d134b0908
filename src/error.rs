//! Contains the errors returned by Rota.

use thiserror::Error;

use crate::data::GroupId;

/// An error returned by the scheduler core and the driver.
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum ScheduleError {
    #[error("invalid configuration: {0}")]
    Config(anyhow::Error),

    #[error("invalid data for group with ID {0}: {1}")]
    Data(GroupId, String),

    #[error("failed to access the timetable store: {0}")]
    Store(anyhow::Error),

    #[error("the scheduling run was cancelled")]
    Cancelled,
}
