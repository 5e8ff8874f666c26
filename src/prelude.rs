//! Prelude module for convenient imports
//!
//! This module re-exports commonly used types and traits for easy access.

// Time sources for age-bounded replay
pub use crate::clock::{Clock, ManualClock, SystemClock};
// Building blocks
pub use crate::collector::BufferedResumableCollector;
pub use crate::error::{CollectError, SubjectError};
pub use crate::queue::SpscArrayQueue;
pub use crate::resumable::Resumable;
// Operators
pub use crate::ops::{ReplayExt, Replayed};
// Subjects
pub use crate::subject::*;
