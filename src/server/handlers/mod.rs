//! HTTP route handlers grouped by resource.

pub mod channels;
pub mod health;
pub mod messages;
pub mod notes;
