//! Candidate types reported by the engine for the current menu page.

use serde::{Deserialize, Serialize};

/// A single candidate on the engine's current menu page.
///
/// `label` is the selection label shown next to the text (e.g. "1." or a
/// schema-defined select key). The engine always fills it in; `comment` is
/// only present when the schema attaches one (pronunciation hints, emoji names).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Candidate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl Candidate {
    pub fn new<T: Into<String>>(text: T) -> Self {
        Candidate {
            label: None,
            text: text.into(),
            comment: None,
        }
    }

    pub fn with_label<L: Into<String>>(mut self, label: L) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_comment<C: Into<String>>(mut self, comment: C) -> Self {
        self.comment = Some(comment.into());
        self
    }

    /// Label to display, falling back to the 1-based position modulo 10.
    pub fn display_label(&self, index: usize) -> String {
        match &self.label {
            Some(label) if !label.is_empty() => label.clone(),
            _ => format!("{}.", (index + 1) % 10),
        }
    }
}

/// One page of the engine's candidate menu.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CandidatePage {
    /// Candidates on this page, in display order
    pub candidates: Vec<Candidate>,

    /// Page index (0-based)
    pub page: usize,

    /// Whether there are no pages after this one
    pub is_last_page: bool,

    /// Highlighted candidate within this page (0-based)
    pub highlighted_index: usize,
}

impl CandidatePage {
    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// The highlighted candidate, if the page has any.
    pub fn highlighted(&self) -> Option<&Candidate> {
        self.candidates.get(self.highlighted_index)
    }

    /// Whether flipping backward would move to another page.
    pub fn has_prev(&self) -> bool {
        self.page > 0
    }

    /// Whether flipping forward would move to another page.
    pub fn has_next(&self) -> bool {
        !self.is_last_page
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_label_falls_back_to_position() {
        let c = Candidate::new("你");
        assert_eq!(c.display_label(0), "1.");
        assert_eq!(c.display_label(9), "0.");
        assert_eq!(c.clone().with_label("a").display_label(0), "a");
        assert_eq!(c.with_label("").display_label(2), "3.");
    }

    #[test]
    fn page_navigation_flags() {
        let page = CandidatePage {
            candidates: vec![Candidate::new("你"), Candidate::new("尼")],
            page: 0,
            is_last_page: false,
            highlighted_index: 1,
        };
        assert!(!page.has_prev());
        assert!(page.has_next());
        assert_eq!(page.highlighted().map(|c| c.text.as_str()), Some("尼"));
    }

    #[test]
    fn candidate_rejects_unknown_fields() {
        let err = serde_json::from_str::<Candidate>(r#"{"text":"你","score":1}"#);
        assert!(err.is_err());
    }
}
