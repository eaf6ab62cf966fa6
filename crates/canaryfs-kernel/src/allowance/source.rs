//! Decision sources: whoever answers "allow this?".

use std::collections::VecDeque;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::answer::{Answer, DecisionError};
use crate::request::RequestDescriptor;

/// A pluggable source of allow/deny answers.
///
/// Implementations:
/// - The terminal prompt in the `canaryfs` binary
/// - [`ScriptedSource`] for tests and unattended runs
///
/// The engine calls at most one `request` at a time. End of input must be
/// reported as [`Answer::DenyOnce`], not as an error.
#[async_trait]
pub trait DecisionSource: Send + Sync {
    /// Ask about one pending request.
    async fn request(&self, request: &RequestDescriptor) -> Result<Answer, DecisionError>;
}

/// Answers from a fixed script, in order. Deny-once once the script runs out.
///
/// Every request it is asked about is recorded, so tests can assert exactly
/// when prompts happened.
#[derive(Debug, Default)]
pub struct ScriptedSource {
    script: Mutex<VecDeque<Result<Answer, DecisionError>>>,
    asked: Mutex<Vec<RequestDescriptor>>,
}

impl ScriptedSource {
    /// Create a source with an empty script.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a source that replays raw answer lines.
    pub fn from_lines<'a>(lines: impl IntoIterator<Item = &'a str>) -> Self {
        let source = Self::new();
        for line in lines {
            source.push(Answer::parse(line));
        }
        source
    }

    /// Queue an answer.
    pub fn push(&self, answer: Answer) {
        self.script.lock().push_back(Ok(answer));
    }

    /// Queue a failure.
    pub fn push_error(&self, error: DecisionError) {
        self.script.lock().push_back(Err(error));
    }

    /// How many prompts have been issued.
    pub fn prompts(&self) -> usize {
        self.asked.lock().len()
    }

    /// Requests seen so far.
    pub fn asked(&self) -> Vec<RequestDescriptor> {
        self.asked.lock().clone()
    }
}

#[async_trait]
impl DecisionSource for ScriptedSource {
    async fn request(&self, request: &RequestDescriptor) -> Result<Answer, DecisionError> {
        self.asked.lock().push(request.clone());
        self.script
            .lock()
            .pop_front()
            .unwrap_or(Ok(Answer::DenyOnce))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{OpKind, RequestSequencer};
    use std::path::Path;

    #[tokio::test]
    async fn test_scripted_source_replays_then_denies() {
        let source = ScriptedSource::from_lines(["y", "10"]);
        let seq = RequestSequencer::new();
        let req = seq.describe(OpKind::Read, Path::new("/x"));

        assert_eq!(source.request(&req).await, Ok(Answer::AllowOnce));
        assert_eq!(source.request(&req).await, Ok(Answer::AllowForCount(10)));
        assert_eq!(source.request(&req).await, Ok(Answer::DenyOnce));
        assert_eq!(source.prompts(), 3);
    }
}
