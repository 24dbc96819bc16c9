//! Remote-shell backend implementations

pub mod ssh;

#[cfg(feature = "test-utils")]
pub mod scripted;
