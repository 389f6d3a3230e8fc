use std::path::PathBuf;

use directories::ProjectDirs;
use tokio::time::Instant;

pub fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("org", "watchpost", "watchpost")
}

/// `<data dir>/recordings` for the current user
pub fn default_recordings_dir() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.data_dir().join("recordings"))
}

/// Millisecond clock shared by every task, measured from service start.
///
/// Built on the tokio clock so tests with a paused runtime control it.
#[derive(Debug, Clone, Copy)]
pub struct ServiceClock {
    start: Instant,
}

impl ServiceClock {
    pub fn new() -> Self {
        ServiceClock {
            start: Instant::now(),
        }
    }

    pub fn now_ms(&self) -> u64 {
        u64::try_from(self.start.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

impl Default for ServiceClock {
    fn default() -> Self {
        Self::new()
    }
}
