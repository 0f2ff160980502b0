//! Best-effort mutual exclusion over stage transitions.
//!
//! There is no release: a record is durable for the life of the stage
//! instance, and clearing it is an operator action.

mod lock;

pub use lock::{Acquisition, ReservationLock, ReservationRecord, DEFAULT_MAX_JITTER};
