//! HTTP request handlers for the Signal Coordinator.

pub mod status;

pub use status::{
    accounts_refresh, banner, channels, connections, ice_status, metrics_handler, usage,
};
