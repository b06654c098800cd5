//! Behavior tests for the batch delivery engine.
//!
//! - `harness.rs`     - Engine fixture, settle helper and specialised sinks
//! - `buffering.rs`   - Size threshold, insertion order, snapshot flushing
//! - `periodic.rs`    - Interval-triggered flushes
//! - `retry.rs`       - Backoff timing, bounded retry, dead-lettering
//! - `concurrency.rs` - Serialized flush episodes
//! - `timeout.rs`     - Send timeout on stalled sink calls
//! - `shutdown.rs`    - Lifecycle, stop and drain

pub(crate) mod harness;
