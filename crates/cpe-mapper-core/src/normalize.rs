//! Install-metadata name normalization
//!
//! Turns raw installed-software names ("7-Zip 24.09 (x64)") into canonical
//! search strings ("7-Zip") by stripping trademark glyphs, locale tags,
//! architecture qualifiers, trailing versions and edition keywords.

use anyhow::Result;
use regex::Regex;

/// Upper bound on pipeline passes. Each pass can expose at most one more
/// strippable suffix, so real-world names converge in two or three.
const MAX_PASSES: usize = 8;

#[derive(Clone)]
pub struct NameNormalizer {
    trademark: Regex,
    locale: Regex,
    architecture: Regex,
    trailing_version: Regex,
    edition: Regex,
    whitespace: Regex,
}

impl NameNormalizer {
    pub fn new() -> Result<Self> {
        Ok(Self {
            trademark: Regex::new(r"(?i)\((?:r|tm)\)|®|™")?,
            locale: Regex::new(r"(?i)\s*\(?\s*en[-_]us\s*\)?")?,
            architecture: Regex::new(
                r"(?i)\s*\(?\s*\b(?:x64|x86|arm64|amd64|64-bit|32-bit)\b\s*\)?",
            )?,
            trailing_version: Regex::new(r"\s+[0-9]+(?:\.[0-9]+)*\s*$")?,
            edition: Regex::new(
                r"(?i)\s+(?:update|redistributable|runtime|platform|service pack|sp[0-9]+)\s*$",
            )?,
            whitespace: Regex::new(r"\s+")?,
        })
    }

    /// Normalize a raw name. Pure and deterministic; never returns an empty
    /// string for non-empty input (falls back to the collapsed original when
    /// the pipeline strips everything).
    pub fn normalize(&self, raw: &str) -> String {
        let mut current = self.collapse(raw);

        // Stripping one suffix can expose the next ("... 2015 Redistributable"
        // loses the keyword first, then the version), so run to a fixpoint.
        for _ in 0..MAX_PASSES {
            let next = self.pass(&current);
            if next == current {
                break;
            }
            current = next;
        }

        if current.is_empty() {
            self.collapse(raw)
        } else {
            current
        }
    }

    // One ordered application of stages 1-6.
    fn pass(&self, input: &str) -> String {
        let stripped = self.trademark.replace_all(input, " ");
        let stripped = self.locale.replace_all(&stripped, " ");
        let stripped = self.architecture.replace_all(&stripped, " ");
        let stripped = self.trailing_version.replace_all(&stripped, "");
        let stripped = self.edition.replace_all(&stripped, "");
        self.collapse(&stripped)
    }

    fn collapse(&self, input: &str) -> String {
        self.whitespace.replace_all(input, " ").trim().to_string()
    }
}
