//! Harcap - Browser network capture into HTTP Archive (HAR 1.2) files
//!
//! Correlates out-of-order network lifecycle events into archive entries,
//! with body scoping, URL filtering and redaction applied on the way.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::cargo)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::field_reassign_with_default,
    clippy::multiple_crate_versions
)]

pub mod capture;
pub mod config;
pub mod error;
pub mod har;
pub mod source;

pub use error::{HarError, Result};
