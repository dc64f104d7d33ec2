//! flexwave-core: shared error, type, and token definitions for flexwave.
//!
//! This crate holds the pieces every other flexwave crate depends on: the
//! [`Error`]/[`Result`] pair, the waveform-facing enumerations, and the
//! shell-style token parsing used by both the control codec and the
//! discovery listener.

pub mod args;
pub mod error;
pub mod types;

pub use args::{find_kwarg, find_kwarg_as_int, split_args};
pub use error::{Error, Result};
pub use types::{DataTarget, MeterUnit, WaveformState};
