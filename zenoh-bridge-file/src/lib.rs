//! Zenoh bridge for files dropped into a directory.
//!
//! This crate watches a directory, publishes every stable file to a queue
//! and consumes that queue into a sink.
//!
//! # Flow
//!
//! ```text
//! <dir>/<file> --watcher--> {prefix}/{destination} --consumer--> transform --> sink
//! ```
//!
//! A file is *stable* once its size and modification time did not change
//! between two polls. Each stable `(path, size, mtime)` is published once.
//!
//! # Configuration
//!
//! ```json5
//! {
//!   file: { dir: "target/input", poll_interval_ms: 1000 },
//!   queue: { destination: "output" },
//!   transform: "uppercase",
//!   sink: { type: "log" },
//! }
//! ```

pub mod config;
pub mod pipeline;
pub mod sink;
pub mod transform;
pub mod watcher;

pub use config::{FileBridgeConfig, QueueConfig};
pub use pipeline::{
    BridgePipeline, BridgePipelineBuilder, PipelineError, PipelineOptions, PipelineState,
    build_pipeline, build_pipeline_with_sink,
};
pub use sink::{ExpectationError, LogSink, MockSink, PublishingSink, Sink, SinkHandler, SinkKind};
pub use transform::{Passthrough, Transform, TransformKind, Uppercase};
pub use watcher::{
    DirectoryWatcher, Disposition, FileHandler, PostAction, WatchConfig, WatchError,
};
