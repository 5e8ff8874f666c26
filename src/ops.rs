//! Stream operators built on the subjects.

mod replay;

pub use replay::{ReplayExt, Replayed};
