pub mod client;
pub mod config;
pub mod delay_manager;
pub mod dispatcher;
pub mod error;
pub mod input_loader;
pub mod logger;
pub mod parser;
pub mod progress;
pub mod record;
pub mod resume_manager;
pub mod sink;

// Exporting types for convenience
pub use client::{HttpTransport, RateLimitedClient, RawResponse, Transport};
pub use config::{Cli, Mode, PipelineConfig};
pub use delay_manager::DelayPolicy;
pub use dispatcher::{CompletionTracker, Dispatcher, Outcome, RunSummary};
pub use error::{FetchError, PipelineError};
pub use parser::RecordParser;
pub use record::{FieldValue, Job, ListEncoding, Record, RecordSchema};
pub use resume_manager::CheckpointStore;
pub use sink::ResultSink;
