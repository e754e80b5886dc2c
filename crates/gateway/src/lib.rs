//! The faceplate gateway: cache layer, per-stream recognition workflows,
//! event emission, maintenance tasks and the admin HTTP surface for the two
//! recognition services (FRS and LPRS).

pub mod api;
pub mod bootstrap;
pub mod cache;
pub mod fetch;
pub mod frs;
pub mod lprs;
pub mod state;
pub mod workflow;
