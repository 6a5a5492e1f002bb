//! Completion of asynchronous (202 Accepted) operations.

mod poller;

pub use poller::{AsyncOperation, AsyncOperationPoller, PollOutcome, STATUS_REFERENCE_HEADERS};
