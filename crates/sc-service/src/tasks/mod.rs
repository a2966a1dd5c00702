//! Background tasks.

pub mod media_stats;

pub use media_stats::start_media_stats_poll;
