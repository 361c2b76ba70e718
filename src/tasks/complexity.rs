//! Keyword-based complexity estimation for task descriptions.
//!
//! Used both to decide whether a task is split before dispatch and to route
//! tasks between fast and powerful models.

use regex::Regex;
use std::sync::LazyLock;

/// Keywords that suggest investigative or cross-cutting work.
const COMPLEX_KEYWORDS: &[&str] = &[
    "architect",
    "debug",
    "security",
    "vulnerability",
    "review",
    "refactor",
    "optimize",
    "investigate",
    "complex",
    "integrate",
    "migrate",
    "authentication",
    "authorization",
    "encryption",
];

/// Keywords that suggest straightforward implementation work.
const SIMPLE_KEYWORDS: &[&str] = &[
    "create", "write", "add", "update", "edit", "rename", "delete", "remove", "css", "style",
    "html", "template", "component", "page", "view", "copy", "move", "format", "install", "run",
    "execute", "build", "test", "lint", "implement", "setup", "configure", "endpoint", "route",
    "api", "model", "schema", "migration", "seed", "fixture", "mock", "button", "form", "input",
    "list", "table", "card", "modal", "navbar", "function", "method", "class", "module", "import",
    "export",
];

/// Annotations that retries and escalations leave in descriptions.
static ANNOTATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\s*(?:\((?:retry|attempt|error|failed|previous error)[^)]*\)|\[(?:retry|attempt|error|failed|previous error)[^\]]*\]|\s--\s*(?:retry|error|failed).*$)",
    )
    .expect("valid regex")
});

static ENUMERATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|\s)\(?(\d+)[.)]\s+").expect("valid regex"));

/// Coarse complexity class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComplexityClass {
    Simple,
    Complex,
}

/// Complexity estimate for one description.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Complexity {
    pub complex_hits: u32,
    pub simple_hits: u32,
    /// Independent clauses found by [`clauses`].
    pub clauses: u32,
    pub long: bool,
}

impl Complexity {
    /// Score compared against the split threshold.
    pub fn score(&self) -> u32 {
        self.complex_hits + 2 * self.clauses.saturating_sub(1) + if self.long { 2 } else { 0 }
    }

    /// Complex iff the complex signal outweighs the simple one and is at
    /// least 2; long descriptions add 2 to the complex signal.
    pub fn class(&self) -> ComplexityClass {
        let complex = self.complex_hits + if self.long { 2 } else { 0 };
        if complex > self.simple_hits && complex >= 2 {
            ComplexityClass::Complex
        } else {
            ComplexityClass::Simple
        }
    }
}

/// Remove retry/error annotations so accumulated failure text does not
/// inflate the estimate.
pub fn strip_annotations(description: &str) -> String {
    ANNOTATION_RE.replace_all(description, "").trim().to_string()
}

fn count_hits(words: &[String], keywords: &[&str]) -> u32 {
    keywords
        .iter()
        .filter(|kw| words.iter().any(|w| w.starts_with(**kw)))
        .count() as u32
}

/// Estimate complexity of a description after stripping annotations.
pub fn estimate(description: &str) -> Complexity {
    let text = strip_annotations(description);
    let words: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect();
    Complexity {
        complex_hits: count_hits(&words, COMPLEX_KEYWORDS),
        simple_hits: count_hits(&words, SIMPLE_KEYWORDS),
        clauses: clauses(&text).len().max(1) as u32,
        long: text.len() > 500 || text.lines().count() > 10,
    }
}

pub fn classify(description: &str) -> ComplexityClass {
    estimate(description).class()
}

fn clean(part: &str) -> Option<String> {
    let part = part.trim().trim_end_matches(['.', ',', ';']).trim();
    (!part.is_empty()).then(|| part.to_string())
}

/// Break a description into independent clauses: numbered items first,
/// then `;`, then `then`, then ` and ` between clauses of at least three
/// words. Returns a single element when nothing splits.
pub fn clauses(description: &str) -> Vec<String> {
    let text = description.trim();

    let starts: Vec<(usize, usize)> = ENUMERATION_RE
        .find_iter(text)
        .map(|m| (m.start(), m.end()))
        .collect();
    if starts.len() >= 2 {
        let lead = clean(&text[..starts[0].0]).map(|l| l.trim_end_matches(':').trim().to_string());
        let mut parts = Vec::new();
        for (i, &(_, body_start)) in starts.iter().enumerate() {
            let end = starts.get(i + 1).map(|s| s.0).unwrap_or(text.len());
            if let Some(part) = clean(&text[body_start..end]) {
                parts.push(match lead {
                    Some(ref lead) if !lead.is_empty() => format!("{lead}: {part}"),
                    _ => part,
                });
            }
        }
        if parts.len() >= 2 {
            return parts;
        }
    }

    for separator in [";", ", then ", " then "] {
        let parts: Vec<String> = text.split(separator).filter_map(clean).collect();
        if parts.len() >= 2 {
            return parts;
        }
    }

    let parts: Vec<String> = text
        .split(", and ")
        .flat_map(|p| p.split(" and "))
        .filter_map(clean)
        .collect();
    if parts.len() >= 2 && parts.iter().all(|p| p.split_whitespace().count() >= 3) {
        return parts;
    }

    clean(text).into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_annotations() {
        assert_eq!(
            strip_annotations("Build the API (retry 2: connection refused)"),
            "Build the API"
        );
        assert_eq!(
            strip_annotations("Build the API [Previous error: security review failed]"),
            "Build the API"
        );
        assert_eq!(
            strip_annotations("Build the API -- error: refactor needed, debug it"),
            "Build the API"
        );
    }

    #[test]
    fn test_annotations_do_not_inflate_estimate() {
        let plain = estimate("Add a login form");
        let noisy = estimate(
            "Add a login form (error: failed to debug; security vulnerability; refactor and migrate)",
        );
        assert_eq!(plain, noisy);
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify("Add a button to the navbar"), ComplexityClass::Simple);
        assert_eq!(
            classify("Investigate and debug the authentication flow"),
            ComplexityClass::Complex
        );
        // A single complex keyword is not enough.
        assert_eq!(classify("Review copy"), ComplexityClass::Simple);
    }

    #[test]
    fn test_long_description_leans_complex() {
        let text = format!("Refactor {}", "the module ".repeat(60));
        assert!(estimate(&text).long);
        assert_eq!(classify(&text), ComplexityClass::Complex);
    }

    #[test]
    fn test_clauses_numbered() {
        let parts = clauses("Set up auth: 1. add login route 2. add logout route 3) hash passwords");
        assert_eq!(
            parts,
            vec![
                "Set up auth: add login route",
                "Set up auth: add logout route",
                "Set up auth: hash passwords",
            ]
        );
    }

    #[test]
    fn test_clauses_semicolon_and_then() {
        assert_eq!(clauses("Create schema; seed data"), vec!["Create schema", "seed data"]);
        assert_eq!(
            clauses("Build the API then write docs"),
            vec!["Build the API", "write docs"]
        );
    }

    #[test]
    fn test_clauses_and_requires_full_clauses() {
        assert_eq!(clauses("Read and write files"), vec!["Read and write files"]);
        assert_eq!(
            clauses("Implement the users table and add the orders endpoint"),
            vec!["Implement the users table", "add the orders endpoint"]
        );
    }

    #[test]
    fn test_score_grows_with_clauses_and_keywords() {
        let small = estimate("Add a login form");
        let big = estimate(
            "Refactor the authentication module; migrate the session store; optimize the queries",
        );
        assert_eq!(small.score(), 0);
        assert!(big.score() > 6, "score was {}", big.score());
    }
}
