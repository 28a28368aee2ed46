//! Live log fan-out from running jobs to observing clients.

pub mod broker;

pub use broker::{ChannelId, LogBroker, LogChannel};
