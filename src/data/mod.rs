//! Result persistence.

pub mod storage;

pub use storage::{format_value, SpectrumWriter};
