//! Stage completion detection.
//!
//! A stage is complete when every partition of its fixed scheme has a valid
//! artifact and marker and the scheduler reports no sibling task as pending,
//! running or unknown.

mod detector;

pub use detector::{CompletionDetector, CompletionReport, SiblingCensus};
