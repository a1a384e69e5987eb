/// Errors that can occur in the notification inbox.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    /// A database operation failed.
    #[error("notification database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// No connection could be taken from the pool.
    #[error("notification pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// The recipient has no notification with this id.
    #[error("notification not found: {0}")]
    NotFound(String),

    /// The blocking persistence task panicked or was cancelled.
    #[error("notification task failed: {0}")]
    Task(String),
}
