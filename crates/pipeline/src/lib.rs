//! Ordin pipeline: the producer (watch → queue → publish) and consumer
//! (subscribe → queue → apply) roles, wired from the lower crates.

#![forbid(unsafe_code)]

mod config;
mod consumer;
mod producer;
mod sequencer;

pub use config::PipelineConfig;
pub use consumer::{Consumer, ConsumerHandle};
pub use producer::{ChangeEnqueuer, Producer};
pub use sequencer::Sequencer;
