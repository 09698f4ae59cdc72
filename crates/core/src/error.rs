/// Errors that abort an operation outright rather than being logged and
/// absorbed locally. Most wire-level problems (decode failure, backpressure,
/// rate limiting, TTL expiry) are not represented here: they are recovered
/// from in place and only surfaced through logging.
#[derive(Debug, thiserror::Error)]
pub enum NetSyncError {
    #[error("field {field} exceeds maximum encoded length of {max} bytes (got {actual})")]
    OversizeField {
        field: &'static str,
        max: usize,
        actual: usize,
    },
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, NetSyncError>;
