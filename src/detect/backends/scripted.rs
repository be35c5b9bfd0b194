use std::collections::VecDeque;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::Candidate;
use crate::error::InferenceError;

/// One scripted response.
#[derive(Clone, Debug)]
pub enum ScriptStep {
    Detect(Vec<Candidate>),
    Fail(String),
    /// Panic inside `detect`, to exercise the capture loop's panic boundary.
    Panic,
}

/// Backend that replays a fixed list of responses, one per call.
///
/// Once the script is exhausted every call returns no candidates. Used by tests and by
/// replays of recorded detections.
#[derive(Debug, Default)]
pub struct ScriptedBackend {
    steps: VecDeque<ScriptStep>,
    calls: u64,
}

impl ScriptedBackend {
    pub fn new(script: Vec<Vec<Candidate>>) -> Self {
        Self::from_steps(script.into_iter().map(ScriptStep::Detect).collect())
    }

    pub fn from_steps(steps: Vec<ScriptStep>) -> Self {
        Self {
            steps: steps.into(),
            calls: 0,
        }
    }

    pub fn calls(&self) -> u64 {
        self.calls
    }
}

impl DetectorBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn detect(
        &mut self,
        _pixels: &[u8],
        _width: u32,
        _height: u32,
    ) -> Result<Vec<Candidate>, InferenceError> {
        self.calls += 1;
        match self.steps.pop_front() {
            Some(ScriptStep::Detect(candidates)) => Ok(candidates),
            Some(ScriptStep::Fail(reason)) => Err(InferenceError::Model(reason)),
            Some(ScriptStep::Panic) => panic!("scripted backend panic on call {}", self.calls),
            None => Ok(Vec::new()),
        }
    }
}
