//! Stage graph for a single turn.
//!
//! Start -> Rewrite -> Classify -> Retrieve -> Grade -> Generate -> Record -> End
//!
//! with detours into Fallback from Classify (off-topic), Grade (no relevant
//! evidence) and from any collaborator stage on failure. The graph is acyclic:
//! a stage is never visited twice in one turn.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A node of the turn graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Start,
    Rewrite,
    Classify,
    Retrieve,
    Grade,
    Generate,
    Fallback,
    Record,
    End,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Start => "START",
            Stage::Rewrite => "REWRITE",
            Stage::Classify => "CLASSIFY",
            Stage::Retrieve => "RETRIEVE",
            Stage::Grade => "GRADE",
            Stage::Generate => "GENERATE",
            Stage::Fallback => "FALLBACK",
            Stage::Record => "RECORD",
            Stage::End => "END",
        };
        f.write_str(name)
    }
}

/// Attempted move along an edge the graph does not have.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid stage transition: {from} -> {to}")]
pub struct InvalidTransition {
    pub from: Stage,
    pub to: Stage,
}

/// Validate that a stage transition is an edge of the graph.
///
/// Valid transitions:
/// - Start -> Rewrite
/// - Rewrite -> Classify | Fallback
/// - Classify -> Retrieve | Fallback
/// - Retrieve -> Grade | Fallback
/// - Grade -> Generate | Fallback
/// - Generate -> Record | Fallback
/// - Fallback -> Record
/// - Record -> End
pub fn validate_transition(from: Stage, to: Stage) -> Result<(), InvalidTransition> {
    let valid = matches!(
        (from, to),
        (Stage::Start, Stage::Rewrite)
            | (Stage::Rewrite, Stage::Classify)
            | (Stage::Rewrite, Stage::Fallback)
            | (Stage::Classify, Stage::Retrieve)
            | (Stage::Classify, Stage::Fallback)
            | (Stage::Retrieve, Stage::Grade)
            | (Stage::Retrieve, Stage::Fallback)
            | (Stage::Grade, Stage::Generate)
            | (Stage::Grade, Stage::Fallback)
            | (Stage::Generate, Stage::Record)
            | (Stage::Generate, Stage::Fallback)
            | (Stage::Fallback, Stage::Record)
            | (Stage::Record, Stage::End)
    );

    if valid {
        Ok(())
    } else {
        Err(InvalidTransition { from, to })
    }
}

/// Stages visited by one turn, starting at [`Stage::Start`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagePath {
    stages: Vec<Stage>,
}

impl StagePath {
    pub fn new() -> Self {
        Self {
            stages: vec![Stage::Start],
        }
    }

    pub fn current(&self) -> Stage {
        self.stages.last().copied().unwrap_or(Stage::Start)
    }

    /// Move to `to`, refusing edges outside the graph.
    pub fn advance(&mut self, to: Stage) -> Result<(), InvalidTransition> {
        validate_transition(self.current(), to)?;
        self.stages.push(to);
        Ok(())
    }

    pub fn contains(&self, stage: Stage) -> bool {
        self.stages.contains(&stage)
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn into_stages(self) -> Vec<Stage> {
        self.stages
    }
}

impl Default for StagePath {
    fn default() -> Self {
        Self::new()
    }
}
