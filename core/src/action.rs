//! The closed set of operations the worker executes, and their results.

use crate::composition::InputStatus;
use crate::error::{Error, Result};
use crate::manifest::Manifest;

/// One engine operation, as posted to the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    SetSchemaFiles(Manifest),
    ProcessKey(String),
    SelectCandidate(usize),
    DeleteCandidate(usize),
    FlipPage(bool),
    ClearInput,
    Deploy,
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::SetSchemaFiles(_) => "set_schema_files",
            Action::ProcessKey(_) => "process_key",
            Action::SelectCandidate(_) => "select_candidate",
            Action::DeleteCandidate(_) => "delete_candidate",
            Action::FlipPage(_) => "flip_page",
            Action::ClearInput => "clear_input",
            Action::Deploy => "deploy",
        }
    }
}

/// Successful result of an `Action`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Bool(bool),
    Input(InputStatus),
}

impl Reply {
    pub fn into_bool(self) -> Result<bool> {
        match self {
            Reply::Bool(value) => Ok(value),
            other => Err(Error::Decode(format!("expected a boolean reply, got {:?}", other))),
        }
    }

    pub fn into_input(self) -> Result<InputStatus> {
        match self {
            Reply::Input(status) => Ok(status),
            other => Err(Error::Decode(format!("expected an input status reply, got {:?}", other))),
        }
    }
}
