//! Up/down status of long-lived components.

use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Up,
    Down,
}

/// Status flag owned by one component and read by the admin API.
///
/// Starts out `Down`.
#[derive(Debug, Default)]
pub struct ComponentStatus {
    up: AtomicBool,
}

impl ComponentStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> Status {
        if self.up.load(Ordering::Acquire) {
            Status::Up
        } else {
            Status::Down
        }
    }

    pub fn set_up(&self) {
        self.up.store(true, Ordering::Release);
    }

    pub fn set_down(&self) {
        self.up.store(false, Ordering::Release);
    }

    pub fn is_up(&self) -> bool {
        self.status() == Status::Up
    }
}
