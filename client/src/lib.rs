//! Backhaul agent: keeps outbound tunnel connections to a relay and replays
//! the requests it receives against a local service.

pub mod agent;
pub mod bridge;
pub mod config;
pub mod dispatcher;
pub mod liveness;
pub mod multi;
