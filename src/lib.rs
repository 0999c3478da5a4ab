// lib.rs - Resumable pipeline engine for the reels ingestion batch
pub mod config;
pub mod discovery;
pub mod error;
pub mod pipeline;

// Re-export commonly used types for convenience
pub use config::{PipelineConfig, ProcessorConfig, StageConfig};
pub use error::{ErrorKind, PipelineError, Result, StageError};
pub use pipeline::*;
