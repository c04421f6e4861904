//! `courier-auth`: identity context for outbound messages.
//!
//! Token acquisition and verification happen elsewhere; this crate only
//! carries the already-authenticated actor alongside the task that acts on
//! its behalf, so publishers can stamp it onto change messages.

pub mod actor;

pub use actor::{ActorId, UNKNOWN_ACTOR, current_actor, resolve_actor, with_actor};
