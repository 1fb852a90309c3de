//! Extractor, classifier and reconciler wired into one sequential pass.

use tether_api::Diagnostic;
use tracing::warn;

use crate::classify::classify;
use crate::extractor::ObjectExtractor;
use crate::reconcile::{EchoPolicy, Emission, Reconciler};

#[derive(Debug, Clone, PartialEq)]
pub enum Output {
    Emission(Emission),
    Diagnostic(Diagnostic),
}

/// The whole text-to-transcript path for one conversation. One worker owns a
/// pipeline and feeds it chunks in arrival order.
#[derive(Debug)]
pub struct Pipeline {
    extractor: ObjectExtractor,
    reconciler: Reconciler,
}

impl Pipeline {
    pub fn new(echo: EchoPolicy) -> Self {
        Self {
            extractor: ObjectExtractor::new(),
            reconciler: Reconciler::new(echo),
        }
    }

    pub fn with_ceiling(echo: EchoPolicy, ceiling: usize) -> Self {
        Self {
            extractor: ObjectExtractor::with_ceiling(ceiling),
            reconciler: Reconciler::new(echo),
        }
    }

    /// Process one chunk of decoded output.
    pub fn feed(&mut self, chunk: &str) -> Vec<Output> {
        let objects = self.extractor.feed(chunk);
        let mut out = Vec::new();

        if let Some(discarded_bytes) = self.extractor.take_overflow() {
            warn!(discarded_bytes, "Discarding non-protocol output");
            out.push(Output::Diagnostic(Diagnostic::BufferOverflow { discarded_bytes }));
        }

        for object in objects {
            match classify(&object) {
                Ok(events) => {
                    for event in events {
                        out.extend(self.reconciler.apply(event).into_iter().map(Output::Emission));
                    }
                }
                Err(failure) => {
                    warn!(raw = %failure.raw, error = %failure.error, retry_error = %failure.retry_error, "Skipping unparseable event");
                    out.push(Output::Diagnostic(Diagnostic::ParseFailure {
                        raw: failure.raw,
                        error: failure.error,
                    }));
                }
            }
        }
        out
    }

    /// Emit buffered partial content; called when the process exits on its own.
    pub fn flush(&mut self) -> Vec<Output> {
        self.reconciler
            .flush()
            .into_iter()
            .map(Output::Emission)
            .collect()
    }

    /// Drop all buffered input and per-process state.
    pub fn reset(&mut self) {
        self.extractor.clear();
        self.reconciler.reset();
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }
}
