//! Command-line interface for ebbflow.

pub mod config;
pub mod error;
pub mod output;
pub mod plan;
pub mod run;
pub mod sources;
pub mod state;
