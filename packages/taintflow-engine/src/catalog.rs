//! Pattern catalog: declarative source / sink / sanitizer matchers
//!
//! The catalog is loaded once (built-in defaults or a user JSON file) and
//! never mutated afterwards, so unsynchronized concurrent reads are safe.
//! `classify` is a pure function from a call target (plus optional argument
//! position) to a pattern match.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Vulnerability category attached to sinks and sanitizers.
///
/// A sanitizer neutralizes taint only for its own category; an HTML escape
/// does nothing for a SQL sink.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum VulnCategory {
    Sql,
    Command,
    Markup,
    PathTraversal,
    Ldap,
    NoSql,
    Deserialization,
}

impl VulnCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            VulnCategory::Sql => "sql",
            VulnCategory::Command => "command",
            VulnCategory::Markup => "markup",
            VulnCategory::PathTraversal => "path_traversal",
            VulnCategory::Ldap => "ldap",
            VulnCategory::NoSql => "nosql",
            VulnCategory::Deserialization => "deserialization",
        }
    }

    /// Human-readable vulnerability name for reports.
    pub fn vulnerability_name(&self) -> &'static str {
        match self {
            VulnCategory::Sql => "SQL Injection",
            VulnCategory::Command => "Command Injection",
            VulnCategory::Markup => "Cross-Site Scripting (XSS)",
            VulnCategory::PathTraversal => "Path Traversal",
            VulnCategory::Ldap => "LDAP Injection",
            VulnCategory::NoSql => "NoSQL Injection",
            VulnCategory::Deserialization => "Unsafe Deserialization",
        }
    }
}

/// Match granularity for a pattern name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "match", rename_all = "snake_case")]
pub enum MatchKind {
    /// Target must equal the pattern name
    Exact,
    /// Target must end with the pattern name (`cursor.execute` matches `execute`)
    Suffix,
    /// Exact name match, but only when the tainted argument sits at this position
    NameAndArg { position: usize },
}

impl MatchKind {
    fn matches(&self, name: &str, target: &str, arg_position: Option<usize>) -> bool {
        match self {
            MatchKind::Exact => target == name,
            MatchKind::Suffix => target == name || target.ends_with(name),
            MatchKind::NameAndArg { position } => {
                target == name && arg_position == Some(*position)
            }
        }
    }
}

/// Pattern ids are indices into the catalog's vectors; stable for one load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceId(pub u16);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SinkId(pub u16);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SanitizerId(pub u16);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSpec {
    pub name: String,
    #[serde(flatten)]
    pub matcher: MatchKind,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkSpec {
    pub name: String,
    pub category: VulnCategory,
    #[serde(flatten)]
    pub matcher: MatchKind,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SanitizerSpec {
    pub name: String,
    pub category: VulnCategory,
    #[serde(flatten)]
    pub matcher: MatchKind,
    #[serde(default)]
    pub description: String,
}

/// Result of classifying a call target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternMatch {
    Source { id: SourceId },
    Sink { id: SinkId, category: VulnCategory },
    Sanitizer { id: SanitizerId, category: VulnCategory },
}

/// Catalog load error. Malformed catalogs are rejected at load time; the
/// engine never guesses a default for a broken user file.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("{kind} pattern #{index} has an empty name")]
    EmptyPatternName { kind: &'static str, index: usize },

    #[error("{kind} pattern '{name}' is declared twice")]
    DuplicatePattern { kind: &'static str, name: String },

    #[error("catalog parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Immutable registry of source, sink and sanitizer matchers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternCatalog {
    sources: Vec<SourceSpec>,
    sinks: Vec<SinkSpec>,
    sanitizers: Vec<SanitizerSpec>,
}

impl PatternCatalog {
    pub fn new(
        sources: Vec<SourceSpec>,
        sinks: Vec<SinkSpec>,
        sanitizers: Vec<SanitizerSpec>,
    ) -> Result<Self, CatalogError> {
        let catalog = Self {
            sources,
            sinks,
            sanitizers,
        };
        catalog.validate()?;
        Ok(catalog)
    }

    /// Load a user-extensible catalog from JSON.
    pub fn from_json_str(json: &str) -> Result<Self, CatalogError> {
        let catalog: Self = serde_json::from_str(json)?;
        catalog.validate()?;
        Ok(catalog)
    }

    fn validate(&self) -> Result<(), CatalogError> {
        fn check(names: Vec<&str>, kind: &'static str) -> Result<(), CatalogError> {
            let mut seen = std::collections::HashSet::new();
            for (index, name) in names.iter().enumerate() {
                if name.is_empty() {
                    return Err(CatalogError::EmptyPatternName { kind, index });
                }
                if !seen.insert(*name) {
                    return Err(CatalogError::DuplicatePattern {
                        kind,
                        name: name.to_string(),
                    });
                }
            }
            Ok(())
        }
        check(self.sources.iter().map(|s| s.name.as_str()).collect(), "source")?;
        check(self.sinks.iter().map(|s| s.name.as_str()).collect(), "sink")?;
        check(
            self.sanitizers.iter().map(|s| s.name.as_str()).collect(),
            "sanitizer",
        )
    }

    /// Classify a call target. Sources take precedence over sinks, sinks
    /// over sanitizers; within a kind the first declared pattern wins.
    pub fn classify(&self, target: &str, arg_position: Option<usize>) -> Option<PatternMatch> {
        for (i, spec) in self.sources.iter().enumerate() {
            if spec.matcher.matches(&spec.name, target, arg_position) {
                return Some(PatternMatch::Source {
                    id: SourceId(i as u16),
                });
            }
        }
        for (i, spec) in self.sinks.iter().enumerate() {
            if spec.matcher.matches(&spec.name, target, arg_position) {
                return Some(PatternMatch::Sink {
                    id: SinkId(i as u16),
                    category: spec.category,
                });
            }
        }
        for (i, spec) in self.sanitizers.iter().enumerate() {
            if spec.matcher.matches(&spec.name, target, arg_position) {
                return Some(PatternMatch::Sanitizer {
                    id: SanitizerId(i as u16),
                    category: spec.category,
                });
            }
        }
        None
    }

    pub fn source(&self, id: SourceId) -> &SourceSpec {
        &self.sources[id.0 as usize]
    }

    pub fn sink(&self, id: SinkId) -> &SinkSpec {
        &self.sinks[id.0 as usize]
    }

    pub fn sanitizer(&self, id: SanitizerId) -> &SanitizerSpec {
        &self.sanitizers[id.0 as usize]
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }

    pub fn sanitizer_count(&self) -> usize {
        self.sanitizers.len()
    }
}

impl Default for PatternCatalog {
    /// Built-in pattern set covering the common web-facing categories.
    fn default() -> Self {
        fn source(name: &str, matcher: MatchKind, description: &str) -> SourceSpec {
            SourceSpec {
                name: name.to_string(),
                matcher,
                description: description.to_string(),
            }
        }
        fn sink(
            name: &str,
            category: VulnCategory,
            matcher: MatchKind,
            description: &str,
        ) -> SinkSpec {
            SinkSpec {
                name: name.to_string(),
                category,
                matcher,
                description: description.to_string(),
            }
        }
        fn sanitizer(name: &str, category: VulnCategory, matcher: MatchKind) -> SanitizerSpec {
            SanitizerSpec {
                name: name.to_string(),
                category,
                matcher,
                description: String::new(),
            }
        }

        use MatchKind::{Exact, Suffix};
        use VulnCategory::*;

        Self {
            sources: vec![
                source("user_input", Exact, "Generic user input"),
                source("input", Exact, "User input from stdin"),
                source("request.get", Suffix, "HTTP request parameter"),
                source("request.post", Suffix, "HTTP POST data"),
                source("request.args", Suffix, "HTTP query args"),
                source("request.form", Suffix, "HTTP form data"),
                source("request.json", Suffix, "HTTP JSON body"),
                source("sys.argv", Exact, "Command line arguments"),
                source("os.environ", Suffix, "Environment variables"),
                source("getenv", Suffix, "Environment variable getter"),
                source("read_line", Suffix, "Line read from a stream"),
            ],
            sinks: vec![
                sink("execute", Sql, Suffix, "SQL execution"),
                sink("executemany", Sql, Suffix, "SQL batch execution"),
                sink("raw_query", Sql, Suffix, "Raw SQL query"),
                sink("os.system", Command, Exact, "Shell command"),
                sink("subprocess.call", Command, Exact, "Process execution"),
                sink("subprocess.run", Command, Exact, "Process execution"),
                sink("subprocess.Popen", Command, Exact, "Process execution"),
                sink("popen", Command, Suffix, "Process pipe"),
                sink("render_template_string", Markup, Exact, "Template rendering"),
                sink("innerHTML", Markup, Suffix, "DOM markup write"),
                sink("document.write", Markup, Exact, "DOM document write"),
                sink("open", PathTraversal, MatchKind::NameAndArg { position: 0 }, "File open"),
                sink("send_file", PathTraversal, Exact, "File send"),
                sink("ldap.search", Ldap, Suffix, "LDAP search filter"),
                sink("collection.find", NoSql, Suffix, "NoSQL query"),
                sink("pickle.loads", Deserialization, Exact, "Unsafe deserialization"),
                sink("yaml.load", Deserialization, Exact, "Unsafe YAML deserialization"),
            ],
            sanitizers: vec![
                sanitizer("escape_sql", Sql, Suffix),
                sanitizer("parameterize", Sql, Suffix),
                sanitizer("quote_identifier", Sql, Suffix),
                sanitizer("shlex.quote", Command, Exact),
                sanitizer("shell_escape", Command, Suffix),
                sanitizer("html_escape", Markup, Suffix),
                sanitizer("markupsafe.escape", Markup, Exact),
                sanitizer("url_encode", Markup, Suffix),
                sanitizer("secure_filename", PathTraversal, Suffix),
                sanitizer("realpath_check", PathTraversal, Suffix),
                sanitizer("ldap_escape", Ldap, Suffix),
                sanitizer("sanitize_filter", NoSql, Suffix),
            ],
        }
    }
}
