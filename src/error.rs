use thiserror::Error;

/// Errors surfaced by queue construction and by misuse of the API.
///
/// Steady-state outcomes are deliberately not errors: a full queue makes
/// `produce` return `Ok(false)` and an empty queue makes `consume` return
/// `Ok(false)`. Only construction failures and programming errors (bad
/// consumer id, oversized payload, undersized buffer) reach this type.
#[derive(Debug, Error)]
pub enum Error {
    /// Contradictory construction flags, zero-valued sizes, undersized
    /// output buffers, malformed segment names, or an out-of-range consumer
    /// id passed to an introspection call.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// `consumer_id` out of range in `pop`/`consume`.
    #[error("consumer id {consumer_id} out of range (num_consumers = {num_consumers})")]
    OutOfRange {
        consumer_id: u32,
        num_consumers: u32,
    },

    /// `produce` payload exceeds the queue's `max_payload`.
    #[error("payload of {len} bytes exceeds max_payload of {max} bytes")]
    PayloadTooLarge { len: u32, max: u32 },

    /// Attach with `open_existing_only` found no segment under this name.
    #[error("shared segment '{0}' not found")]
    NotFound(String),

    /// An existing segment's header does not match the requested parameters.
    #[error("incompatible segment: {0}")]
    Incompatible(String),

    /// An underlying OS call failed; `op` names the originating operation.
    #[error("{op} failed: {source}")]
    Io {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    pub(crate) fn io(op: &'static str) -> Self {
        Error::Io {
            op,
            source: std::io::Error::last_os_error(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
