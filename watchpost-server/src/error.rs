use thiserror::Error;

use crate::camera::CameraError;
use crate::storage::StorageError;

/// Error returned by a subsystem
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Camera(#[from] CameraError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Cannot determine a data directory, pass --recordings-dir")]
    NoDataDir,

    #[error("Simulated motion is disabled while a motion pin is configured")]
    MotionPinConfigured,
}
