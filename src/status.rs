//! Lifecycle states shared by every backend.
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// The lifecycle state of a service at one observation instant.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    AsRefStr,
    EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum Status {
    Initializing,
    Starting,
    Running,
    Stopping,
    Dead,
    /// Some members running, some dead.
    Warning,
}

impl Status {
    /// A state that will change on its own once an operation completes.
    pub fn is_transitional(self) -> bool {
        matches!(self, Status::Initializing | Status::Starting | Status::Stopping)
    }

    /// Folds member statuses into the status of their group.
    ///
    /// Any transitional member wins (the first one seen), then uniform
    /// groups keep their shared state, mixed groups become `Warning`. An
    /// empty group is `Dead`.
    pub fn aggregate<I>(members: I) -> Status
    where
        I: IntoIterator<Item = Status>,
    {
        let mut any_running = false;
        let mut any_dead = false;
        let mut any_warning = false;

        for status in members {
            match status {
                s if s.is_transitional() => return s,
                Status::Running => any_running = true,
                Status::Dead => any_dead = true,
                _ => any_warning = true,
            }
        }

        match (any_running, any_dead, any_warning) {
            (_, _, true) | (true, true, _) => Status::Warning,
            (true, false, false) => Status::Running,
            _ => Status::Dead,
        }
    }
}
