//! portkey_pipe: a manifold pipe that forwards chat completions to the
//! Portkey AI gateway.
//!
//! This library crate re-exports modules so integration tests
//! (under `tests/`) can access them.

pub mod cli;
pub mod config;
pub mod error;
pub mod models;
pub mod pipe;
pub mod smoke;
pub mod utils;

pub use config::Config;
pub use error::PipeError;
pub use models::{clean_model_id, ModelEntry};
pub use pipe::{ChatRequest, Pipe, PipeOutput, StreamFormat, UserField, UserInfo};
