//! Job lifecycle: store, enqueue gate, leases, janitor and dead-letter
//! handling.

pub mod clock;
pub mod dead_letter;
pub mod enqueue;
pub mod janitor;
pub mod lease;
pub mod store;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use dead_letter::{DeadLetterHandler, RecoverTarget};
pub use enqueue::{EnqueueGate, EnqueueOutcome};
pub use janitor::{Janitor, SweepReport};
pub use lease::{LeaseGrant, LeaseManager, ReleaseOutcome, ReleaseResult};
pub use store::JobStore;
pub use types::{truncate_error, Job, JobStatus, Lease, NewJob, StatusCounts};
