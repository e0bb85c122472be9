//! Preedit text as split by the engine around the active selection.
//!
//! The engine reports the raw preedit together with the byte range of the
//! segment currently being converted. The three parts concatenated give the
//! full preedit; `active` is what a UI would highlight.

use serde::{Deserialize, Serialize};

/// Preedit split into the text before, inside and after the active segment.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InputBuffer {
    pub before: String,
    pub active: String,
    pub after: String,
}

impl InputBuffer {
    pub fn new<B, A, F>(before: B, active: A, after: F) -> Self
    where
        B: Into<String>,
        A: Into<String>,
        F: Into<String>,
    {
        Self {
            before: before.into(),
            active: active.into(),
            after: after.into(),
        }
    }

    /// Split `preedit` at the byte range `sel_start..sel_end`.
    ///
    /// Out-of-range or non-boundary offsets are clamped down to the nearest
    /// character boundary, so this never panics on engine-supplied offsets.
    pub fn from_selection(preedit: &str, sel_start: usize, sel_end: usize) -> Self {
        let start = floor_boundary(preedit, sel_start);
        let end = floor_boundary(preedit, sel_end.max(start));
        Self {
            before: preedit[..start].to_string(),
            active: preedit[start..end].to_string(),
            after: preedit[end..].to_string(),
        }
    }

    /// The full preedit text.
    pub fn text(&self) -> String {
        let mut s = String::with_capacity(self.len());
        s.push_str(&self.before);
        s.push_str(&self.active);
        s.push_str(&self.after);
        s
    }

    /// Byte offset of the active segment within `text()`.
    pub fn cursor(&self) -> usize {
        self.before.len()
    }

    /// Length of the full preedit in bytes.
    pub fn len(&self) -> usize {
        self.before.len() + self.active.len() + self.after.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn floor_boundary(s: &str, mut idx: usize) -> usize {
    if idx >= s.len() {
        return s.len();
    }
    while !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}
