//! Stream-json protocol adapter for coding-agent subprocesses.
//!
//! Output of an agent CLI flows through these stages, each usable on its own:
//!
//! - [`ChunkDecoder`]: pipe bytes to UTF-8 text
//! - [`ObjectExtractor`]: text to complete top-level JSON objects
//! - [`classify`]: objects to [`ProtocolEvent`]s, retrying once without ANSI codes
//! - [`Reconciler`]: events to [`TranscriptEntry`](tether_api::TranscriptEntry) emissions
//!
//! [`Pipeline`] chains the last three for one conversation.
//!
//! ```rust,ignore
//! use tether_stream::{EchoPolicy, Output, Pipeline};
//!
//! let mut pipeline = Pipeline::new(EchoPolicy::Suppress);
//! for output in pipeline.feed(chunk) {
//!     match output {
//!         Output::Emission(emission) => { /* replace-by-id in the UI */ }
//!         Output::Diagnostic(diagnostic) => eprintln!("{diagnostic}"),
//!     }
//! }
//! ```

pub mod ansi;
pub mod classify;
pub mod decode;
pub mod error;
pub mod extractor;
pub mod pipeline;
pub mod protocol;
pub mod reconcile;

pub use ansi::strip_ansi;
pub use classify::{classify, display_content};
pub use decode::ChunkDecoder;
pub use error::ParseFailure;
pub use extractor::{DEFAULT_CEILING, ObjectExtractor};
pub use pipeline::{Output, Pipeline};
pub use protocol::{BlockKind, Delta, ProtocolEvent, SnapshotBlock, TurnStatus};
pub use reconcile::{EchoPolicy, Emission, Reconciler, TOOL_RESULT_DISPLAY_LIMIT, truncate_for_display};
