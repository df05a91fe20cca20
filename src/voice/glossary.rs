//! Do-not-translate glossary.
//!
//! Protected terms are swapped for opaque placeholders before text is sent
//! to the translation provider and swapped back afterwards. Matching is a
//! single leftmost-longest pass, so a longer term always wins over a shorter
//! one sharing its prefix ("New York City" is never split by "New York").

use aho_corasick::{AhoCorasick, MatchKind};
use anyhow::{Context, Result};
use std::path::Path;

/// Placeholder for the term at `index` (longest-first order).
fn placeholder(index: usize) -> String {
    format!("__GLOSSARY_{index}__")
}

fn leftmost_longest<I, P>(patterns: I) -> Result<AhoCorasick>
where
    I: IntoIterator<Item = P>,
    P: AsRef<[u8]>,
{
    AhoCorasick::builder()
        .match_kind(MatchKind::LeftmostLongest)
        .build(patterns)
        .context("Failed to build glossary matcher")
}

struct Matchers {
    protect: AhoCorasick,
    restore: AhoCorasick,
}

/// Immutable set of protected terms.
pub struct Glossary {
    /// Terms sorted longest first, deduplicated.
    terms: Vec<String>,
    placeholders: Vec<String>,
    matchers: Option<Matchers>,
}

impl std::fmt::Debug for Glossary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Glossary").field("terms", &self.terms).finish()
    }
}

impl Default for Glossary {
    fn default() -> Self {
        Self::empty()
    }
}

impl Glossary {
    pub fn empty() -> Self {
        Self {
            terms: Vec::new(),
            placeholders: Vec::new(),
            matchers: None,
        }
    }

    pub fn new<I, S>(terms: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut terms: Vec<String> = terms
            .into_iter()
            .map(Into::into)
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
        // Longest first, ties broken lexically for stable placeholder numbering.
        terms.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        terms.dedup();

        if terms.is_empty() {
            return Ok(Self::empty());
        }

        let placeholders: Vec<String> = (0..terms.len()).map(placeholder).collect();
        let matchers = Matchers {
            protect: leftmost_longest(&terms)?,
            restore: leftmost_longest(&placeholders)?,
        };
        Ok(Self {
            terms,
            placeholders,
            matchers: Some(matchers),
        })
    }

    /// Load a glossary file: one term per line, blank lines ignored. For
    /// tab-separated lines only the first column is the term. A missing
    /// file yields an empty glossary.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "Glossary file not found; no protected terms");
            return Ok(Self::empty());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read glossary {}", path.display()))?;
        let glossary = Self::parse(&raw)?;
        tracing::info!(
            path = %path.display(),
            terms = glossary.len(),
            "Loaded do-not-translate glossary"
        );
        Ok(glossary)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        Self::new(
            raw.lines()
                .filter(|line| !line.trim().is_empty())
                .filter_map(|line| line.split('\t').next()),
        )
    }

    /// Replace every protected term with its placeholder.
    pub fn protect(&self, text: &str) -> String {
        match &self.matchers {
            Some(m) => m.protect.replace_all(text, &self.placeholders),
            None => text.to_string(),
        }
    }

    /// Replace every placeholder with its original term.
    pub fn restore(&self, text: &str) -> String {
        match &self.matchers {
            Some(m) => m.restore.replace_all(text, &self.terms),
            None => text.to_string(),
        }
    }

    /// Terms, longest first. Also used as recognizer phrase hints.
    pub fn terms(&self) -> &[String] {
        &self.terms
    }

    pub fn len(&self) -> usize {
        self.terms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn longer_term_is_not_shadowed_by_prefix() {
        let glossary = Glossary::new(["New York", "New York City"]).unwrap();
        let protected = glossary.protect("I live in New York City.");
        assert!(!protected.contains("New York"));
        assert_eq!(protected, "I live in __GLOSSARY_0__.");
        assert_eq!(glossary.restore(&protected), "I live in New York City.");
    }

    #[test]
    fn shorter_term_still_matches_on_its_own() {
        let glossary = Glossary::new(["New York", "New York City"]).unwrap();
        let protected = glossary.protect("New York and New York City");
        assert_eq!(protected, "__GLOSSARY_1__ and __GLOSSARY_0__");
    }

    #[test]
    fn restore_handles_double_digit_placeholders() {
        let terms: Vec<String> = (0..12).map(|i| format!("term{i:02}")).collect();
        let glossary = Glossary::new(terms.clone()).unwrap();
        let text = terms.join(" ");
        let protected = glossary.protect(&text);
        assert!(protected.contains("__GLOSSARY_11__"));
        assert_eq!(glossary.restore(&protected), text);
    }

    #[test]
    fn protect_is_idempotent() {
        let glossary = Glossary::new(["Azure", "OBS Studio"]).unwrap();
        let once = glossary.protect("Stream from OBS Studio to Azure");
        let twice = glossary.protect(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn empty_glossary_passes_text_through() {
        let glossary = Glossary::empty();
        assert!(glossary.is_empty());
        assert_eq!(glossary.protect("unchanged"), "unchanged");
        assert_eq!(glossary.restore("unchanged"), "unchanged");
    }

    #[test]
    fn parse_takes_first_tsv_column_and_skips_blanks() {
        let glossary = Glossary::parse("Kubernetes\tकुबेरनेटीस\n\n  \nRust\n").unwrap();
        assert_eq!(glossary.terms(), &["Kubernetes".to_string(), "Rust".to_string()]);
    }

    #[test]
    fn duplicate_terms_are_collapsed() {
        let glossary = Glossary::new(["Rust", "Rust", " Rust "]).unwrap();
        assert_eq!(glossary.len(), 1);
    }

    #[test]
    fn load_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let glossary = Glossary::load(&dir.path().join("absent.txt")).unwrap();
        assert!(glossary.is_empty());
    }

    #[test]
    fn load_reads_terms_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "New York City").unwrap();
        writeln!(file, "New York").unwrap();
        let glossary = Glossary::load(file.path()).unwrap();
        assert_eq!(glossary.terms()[0], "New York City");
        assert_eq!(glossary.len(), 2);
    }
}
