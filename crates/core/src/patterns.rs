use regex::Regex;
use serde::{Serialize, Serializer};
use smallvec::SmallVec;
use tracing::warn;

/// Comma-separated list of namespace regexes taken from an annotation.
///
/// An empty list matches every namespace. A pattern must match the whole namespace,
/// so `qa` does not admit `qa-1` while `qa.*` does. Entries that fail to compile never
/// match, and they still count as declared: a list of only invalid patterns admits nothing.
#[derive(Debug, Clone, Default)]
pub struct PatternList {
    raw: String,
    declared: usize,
    patterns: SmallVec<[Regex; 4]>,
}

impl PatternList {
    pub fn parse(value: &str) -> Self {
        let mut declared = 0usize;
        let mut patterns = SmallVec::new();
        for entry in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            declared += 1;
            match Regex::new(&format!("^(?:{entry})$")) {
                Ok(re) => patterns.push(re),
                Err(e) => warn!(pattern = %entry, error = %e, "ignoring invalid namespace pattern"),
            }
        }
        Self { raw: value.trim().to_string(), declared, patterns }
    }

    pub fn is_empty(&self) -> bool {
        self.declared == 0
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn matches(&self, namespace: &str) -> bool {
        self.is_empty() || self.patterns.iter().any(|re| re.is_match(namespace))
    }
}

impl PartialEq for PatternList {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for PatternList {}

impl Serialize for PatternList {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}
