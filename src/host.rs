//! Host process control.
//!
//! Some steps (a platform switch) only take effect after the host restarts.
//! Steps ask for that through [`HostControl`]; the production host exits
//! with [`RESTART_EXIT_CODE`] so `stagehand supervise` relaunches it, and the
//! relaunched process resumes from the cursor.

use std::sync::Mutex;

use crate::logging::LOG_TAG;

/// Exit status meaning "relaunch me and resume". Matches `EX_TEMPFAIL`.
pub const RESTART_EXIT_CODE: i32 = 75;

pub trait HostControl: Send + Sync {
    /// Request a host restart. The production host does not return.
    fn request_restart(&self, reason: &str);
}

/// Exits the current process.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessHost;

impl HostControl for ProcessHost {
    fn request_restart(&self, reason: &str) {
        tracing::info!("{} Restarting host: {}", LOG_TAG, reason);
        eprintln!("{} Restarting host: {}", LOG_TAG, reason);
        std::process::exit(RESTART_EXIT_CODE);
    }
}

/// Records restart requests instead of acting on them.
#[derive(Debug, Default)]
pub struct RecordingHost {
    requests: Mutex<Vec<String>>,
}

impl RecordingHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

impl HostControl for RecordingHost {
    fn request_restart(&self, reason: &str) {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(reason.to_string());
        }
    }
}
