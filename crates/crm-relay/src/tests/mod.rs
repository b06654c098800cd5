//! Tests for the Redis side of the relay, run against an in-memory stream.
//!
//! - `harness.rs`  - MockRedis (consumer group, pending list, XAUTOCLAIM)
//!                   and relay config helpers
//! - `backlog.rs`  - Startup re-read of this consumer's pending entries
//! - `claim.rs`    - XAUTOCLAIM sweeps of idle pending messages
//! - `ack.rs`      - XACK on confirm, dead-letter then XACK on reject
//! - `run_loop.rs` - Consume loop: delivery, reconnect, shutdown, recovery

mod claim;
