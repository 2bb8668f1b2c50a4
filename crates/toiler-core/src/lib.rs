mod envelope;
mod error;
mod listener;
mod message;
mod outcome;

pub use envelope::Envelope;
pub use error::{CoreError, Result};
pub use listener::{Listener, NullListener};
pub use message::Message;
pub use outcome::{Outcome, WorkError};

/// Maximum size of a job's contents in bytes, checked at send time.
pub const MAX_CONTENTS_SIZE: usize = 1024 * 1024; // 1MB
