//! Utility functions and helpers for gencache.
//!
//! # Submodules
//!
//! - `logging`: Tracing subscriber initialization.
//!
//! Author: kelexine (<https://github.com/kelexine>)

pub mod logging;
