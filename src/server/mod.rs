//! HTTP control plane.
//!
//! - [`api`]: Route handlers, caller extraction and error mapping
//! - [`events`]: SSE stream of topology events

pub mod api;
pub mod events;
