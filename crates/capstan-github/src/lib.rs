//! GitHub adapter: App authentication plus the handful of Actions
//! endpoints the control loops consume.
//!
//! Clients are scoped to one owning scope (org or repo) and authenticate
//! with a short-lived installation token. They are created per
//! invocation and never cached across invocations, because installations
//! and tokens rotate.

mod auth;
mod client;

pub use auth::*;
pub use client::*;
