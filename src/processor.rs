//! Request processors.
//!
//! A processor turns one request line into one response line. The server
//! holds one active processor and hands each admitted connection the
//! processor that was active when it was dispatched.

use serde::Deserialize;
use std::sync::Arc;

/// Maps a single request line to a single response line.
///
/// Implementations must not touch shared server state; they may log.
pub trait RequestProcessor: Send + Sync {
    fn process(&self, request: &str) -> String;
}

/// Echoes the request back with an `(Echo) ` prefix.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoProcessor;

impl RequestProcessor for EchoProcessor {
    fn process(&self, request: &str) -> String {
        format!("(Echo) {request}")
    }
}

/// Answers greetings, echoes everything else.
#[derive(Debug, Default, Clone, Copy)]
pub struct GreetingProcessor;

const GREETINGS: [&str; 3] = ["hello", "hi", "hey"];

impl RequestProcessor for GreetingProcessor {
    fn process(&self, request: &str) -> String {
        let lowered = request.to_lowercase();
        if GREETINGS.iter().any(|greeting| lowered.contains(greeting)) {
            "Well hello there!".to_string()
        } else {
            EchoProcessor.process(request)
        }
    }
}

/// Processor selectable from configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ProcessorKind {
    #[default]
    Echo,
    Greeting,
}

impl ProcessorKind {
    pub fn build(self) -> Arc<dyn RequestProcessor> {
        match self {
            ProcessorKind::Echo => Arc::new(EchoProcessor),
            ProcessorKind::Greeting => Arc::new(GreetingProcessor),
        }
    }
}
