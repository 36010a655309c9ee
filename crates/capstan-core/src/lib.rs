//! The scaling and lifecycle controller: scale-up dispatch, the
//! two-phase scale-down reaper, pool top-up, job retry, and the queue
//! intake wrappers.
//!
//! All durable state lives in instance tags and the parameter store;
//! each control loop is one single-tasked invocation that discards its
//! in-memory maps (scope → client, owner → runner list) on return.

pub mod error;
pub mod intake;
pub mod pool;
pub mod provision;
pub mod retry;
pub mod scale_down;
pub mod scale_up;

#[cfg(test)]
pub(crate) mod testing;

pub use error::*;
pub use intake::*;
pub use pool::*;
pub use provision::*;
pub use retry::*;
pub use scale_down::*;
pub use scale_up::*;
