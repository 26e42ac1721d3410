use thiserror::Error;

/// Run-level and per-item failures raised by the sync pipeline.
///
/// `MissingDefaultWarehouse` / `MissingDefaultRack` are fatal preconditions:
/// a batch raising one of them processes zero items. `CategoryResolution`
/// is recoverable and attributed to the failing item only.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("no default warehouse configured")]
    MissingDefaultWarehouse,
    #[error("no default rack configured for warehouse {0}")]
    MissingDefaultRack(i64),
    #[error("cannot resolve category: {0}")]
    CategoryResolution(String),
    #[error("authentication with marketplace failed: {0}")]
    Auth(String),
}
