//! Built-in modules.
//!
//! Business modules live with the embedding service and implement
//! [`Module`](crate::lifecycle::Module) themselves; this crate ships only the
//! heartbeat used by the `lifecycled` binary.

pub mod heartbeat;

pub use heartbeat::HeartbeatModule;
