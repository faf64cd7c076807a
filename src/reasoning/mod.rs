//! Reasoning trace: a Goal -> Decision -> Option -> Action -> Outcome graph
//! over the hypergraph memory store, plus the git capability it consumes
//! to attach working-tree diffs to completed actions.

mod git;
mod trace;

pub use git::{GitCollaborator, GitState, ProcessGitCollaborator, WorkingDiff};
pub use trace::{
    ActionView, DecisionView, OptionStatus, OptionView, ReasoningTrace, ReasoningTraceBuilder,
};
