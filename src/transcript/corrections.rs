//! Known misrecognition table

/// Built-in corrections, applied in order
///
/// Each entry replaces the first occurrence of the misheard phrase.
pub const DEFAULT_CORRECTIONS: &[(&str, &str)] = &[
    ("자무", "자모"),
    ("자모.", "자모"),
    ("참호", "자모"),
    ("잠오", "자모"),
    ("사모", "자모"),
    ("단어.", "단어"),
    ("다워", "단어"),
    ("다오", "단어"),
    ("암호", "단어"),
    ("문장.", "문장"),
    ("학습모드.", "학습"),
    ("학습모드", "학습"),
];

/// Ordered substring replacement table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Corrections {
    entries: Vec<(String, String)>,
}

impl Default for Corrections {
    fn default() -> Self {
        Self::new(
            DEFAULT_CORRECTIONS
                .iter()
                .map(|(wrong, right)| ((*wrong).to_string(), (*right).to_string())),
        )
    }
}

impl Corrections {
    /// Build a table from `(misheard, corrected)` pairs
    ///
    /// Pairs with an empty misheard phrase are ignored.
    #[must_use]
    pub fn new(entries: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            entries: entries
                .into_iter()
                .filter(|(wrong, _)| !wrong.is_empty())
                .collect(),
        }
    }

    /// Empty table
    #[must_use]
    pub const fn none() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Append pairs after the existing ones
    #[must_use]
    pub fn with_extra(mut self, extra: impl IntoIterator<Item = (String, String)>) -> Self {
        self.entries
            .extend(extra.into_iter().filter(|(wrong, _)| !wrong.is_empty()));
        self
    }

    /// Number of entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Trim `text` and apply every correction in order
    #[must_use]
    pub fn apply(&self, text: &str) -> String {
        let mut out = text.trim().to_string();
        for (wrong, right) in &self.entries {
            if out.contains(wrong.as_str()) {
                out = out.replacen(wrong.as_str(), right, 1);
            }
        }
        out
    }
}
