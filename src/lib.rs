//! Timeout and retry behaviour of Unix domain sockets.
//!
//! Unix sockets connect (or fail) immediately, with none of the network-level
//! delay TCP has. This crate drives a small client and server through three
//! phases (nothing bound, bound but not accepting, fully answering) and
//! records how connects, reads and writes behave under explicit deadlines.

pub mod address;
pub mod client;
pub mod config;
pub mod error;
pub mod experiment;
pub mod protocol;
pub mod server;
pub mod signal;
pub mod usock;

pub use error::{Error, Result};
pub use experiment::{Experiment, ExperimentReport, Phase, PhaseReport};
