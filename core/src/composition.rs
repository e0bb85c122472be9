//! Decoding of the engine's composition result.
//!
//! Every key, selection, deletion, page flip and clear returns a JSON string
//! describing the engine's state after the call. The payload is a versionless
//! wire format, so it is validated once here and only the typed
//! `InputStatus` travels further:
//!
//! ```json
//! {"success":true,"committed":"你好","isComposing":false}
//! {"success":true,"isComposing":true,
//!  "inputBuffer":{"before":"","active":"ni","after":""},
//!  "page":0,"isLastPage":false,"highlightedIndex":0,
//!  "candidates":[{"label":"1.","text":"你"}]}
//! ```

use crate::candidate::{Candidate, CandidatePage};
use crate::error::{Error, Result};
use crate::input_buffer::InputBuffer;
use serde::{Deserialize, Serialize};

/// The engine's state after a composition-result operation.
///
/// Transient: every push from the engine supersedes the previous one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputStatus {
    /// Whether the engine handled the call
    pub success: bool,

    /// Text the engine committed during this call, if any
    pub committed: Option<String>,

    /// Present while the engine is composing
    pub composition: Option<Composing>,
}

/// The composing variant: preedit plus the current candidate page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Composing {
    pub input_buffer: InputBuffer,
    pub menu: CandidatePage,
}

impl InputStatus {
    /// A successful, non-composing status with nothing committed.
    pub fn idle() -> Self {
        Self {
            success: true,
            committed: None,
            composition: None,
        }
    }

    pub fn composing(input_buffer: InputBuffer, menu: CandidatePage) -> Self {
        Self {
            success: true,
            committed: None,
            composition: Some(Composing { input_buffer, menu }),
        }
    }

    pub fn with_committed<T: Into<String>>(mut self, text: T) -> Self {
        self.committed = Some(text.into());
        self
    }

    pub fn with_success(mut self, success: bool) -> Self {
        self.success = success;
        self
    }

    pub fn is_composing(&self) -> bool {
        self.composition.is_some()
    }

    pub fn committed(&self) -> Option<&str> {
        self.committed.as_deref()
    }

    /// Decode and validate an engine result string.
    pub fn from_json(json: &str) -> Result<Self> {
        let raw: WireStatus =
            serde_json::from_str(json).map_err(|e| Error::Decode(e.to_string()))?;
        raw.validate()
    }

    /// Encode in the engine's wire format.
    ///
    /// Adapters implemented in Rust use this to produce their result strings.
    pub fn to_json(&self) -> String {
        let wire = WireStatus::from(self);
        // Plain strings, integers and booleans only
        serde_json::to_string(&wire).unwrap_or_else(|_| String::from("{\"isComposing\":false}"))
    }
}

fn default_success() -> bool {
    true
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct WireStatus {
    #[serde(default = "default_success")]
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    committed: Option<String>,
    is_composing: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    input_buffer: Option<InputBuffer>,
    #[serde(skip_serializing_if = "Option::is_none")]
    page: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    is_last_page: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    highlighted_index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    candidates: Option<Vec<Candidate>>,
}

impl WireStatus {
    fn validate(self) -> Result<InputStatus> {
        let composition = if self.is_composing {
            let input_buffer = require(self.input_buffer, "inputBuffer")?;
            let page = require(self.page, "page")?;
            let is_last_page = require(self.is_last_page, "isLastPage")?;
            let highlighted_index = require(self.highlighted_index, "highlightedIndex")?;
            let candidates = require(self.candidates, "candidates")?;
            if !candidates.is_empty() && highlighted_index >= candidates.len() {
                return Err(Error::Decode(format!(
                    "highlightedIndex {} out of range for {} candidates",
                    highlighted_index,
                    candidates.len()
                )));
            }
            Some(Composing {
                input_buffer,
                menu: CandidatePage {
                    candidates,
                    page,
                    is_last_page,
                    highlighted_index,
                },
            })
        } else {
            if self.input_buffer.is_some()
                || self.page.is_some()
                || self.is_last_page.is_some()
                || self.highlighted_index.is_some()
                || self.candidates.is_some()
            {
                return Err(Error::Decode(
                    "composition fields present while not composing".to_string(),
                ));
            }
            None
        };

        Ok(InputStatus {
            success: self.success,
            committed: self.committed,
            composition,
        })
    }
}

fn require<T>(value: Option<T>, field: &str) -> Result<T> {
    value.ok_or_else(|| Error::Decode(format!("missing field `{}` while composing", field)))
}

impl From<&InputStatus> for WireStatus {
    fn from(status: &InputStatus) -> Self {
        match &status.composition {
            Some(c) => WireStatus {
                success: status.success,
                committed: status.committed.clone(),
                is_composing: true,
                input_buffer: Some(c.input_buffer.clone()),
                page: Some(c.menu.page),
                is_last_page: Some(c.menu.is_last_page),
                highlighted_index: Some(c.menu.highlighted_index),
                candidates: Some(c.menu.candidates.clone()),
            },
            None => WireStatus {
                success: status.success,
                committed: status.committed.clone(),
                is_composing: false,
                input_buffer: None,
                page: None,
                is_last_page: None,
                highlighted_index: None,
                candidates: None,
            },
        }
    }
}
