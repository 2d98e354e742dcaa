//! Message id generation.

use ulid::Ulid;
use uuid::Uuid;

/// Generates ids for messages the broker stores itself.
///
/// Backends that issue their own ids (the cloud queue service) only use the
/// generator for correlating entries inside one batch request.
#[derive(Debug, Clone, Default)]
pub struct IdGenerator {
    _private: (),
}

impl IdGenerator {
    /// Create a new ID generator.
    #[must_use]
    pub const fn new() -> Self {
        Self { _private: () }
    }

    /// Generate a new message id.
    ///
    /// ULIDs sort by creation time, which keeps ids of one queue roughly in
    /// enqueue order when listed.
    #[must_use]
    pub fn message_id(&self) -> String {
        Ulid::new().to_string().to_lowercase()
    }

    /// Generate an id for one entry of a batch request.
    #[must_use]
    pub fn batch_entry_id(&self) -> String {
        Uuid::new_v4().simple().to_string()
    }
}
