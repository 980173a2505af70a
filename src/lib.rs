// gencache - persistent memoization for LLM generation calls
// Author: kelexine (https://github.com/kelexine)

pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod metrics;
pub mod utils;

pub use cache::{GenerationRequest, Memoized, MemoizingGenerator};
pub use error::{CacheError, Result};
