//! CLI command implementations.

pub mod consume;
pub mod demo;
pub mod publish;
pub mod topology;
