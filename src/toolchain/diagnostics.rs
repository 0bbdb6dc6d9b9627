//! Structured compiler diagnostics.
//!
//! Parses GCC-compatible stderr lines of the shape
//! `file:line:column: severity: message [-Wflag]`. Nothing beyond that prefix
//! contract is assumed; lines that do not match are dropped from the
//! structured view (the raw stderr is preserved by the caller where needed).

use std::path::PathBuf;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

static DIAGNOSTIC_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?P<file>[^:\s][^:]*):(?P<line>\d+):(?:(?P<col>\d+):)?\s*(?P<sev>fatal error|error|warning|note):\s*(?P<msg>.*)$",
    )
    .unwrap()
});

static FLAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[(-W[A-Za-z0-9=_-]+)\]\s*$").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Note,
    Warning,
    Error,
    Fatal,
}

#[derive(Debug, Clone, Serialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub file: PathBuf,
    pub line: u32,
    pub column: Option<u32>,
    /// The warning option that produced this diagnostic, e.g. `-Wunused`.
    pub flag: Option<String>,
    pub message: String,
}

/// Parse compiler stderr into structured diagnostics, ordered by source
/// location (file, then line, then column).
pub fn parse_diagnostics(stderr: &str) -> Vec<Diagnostic> {
    let mut diagnostics: Vec<Diagnostic> = stderr
        .lines()
        .filter_map(|line| {
            let captures = DIAGNOSTIC_RE.captures(line)?;
            let severity = match &captures["sev"] {
                "note" => Severity::Note,
                "warning" => Severity::Warning,
                "error" => Severity::Error,
                "fatal error" => Severity::Fatal,
                _ => unreachable!("regex alternatives are exhaustive"),
            };
            let message = captures["msg"].to_string();
            let flag = FLAG_RE
                .captures(&message)
                .map(|f| f[1].to_string());
            Some(Diagnostic {
                severity,
                file: PathBuf::from(&captures["file"]),
                line: captures["line"].parse().ok()?,
                column: captures.name("col").and_then(|c| c.as_str().parse().ok()),
                flag,
                message,
            })
        })
        .collect();
    diagnostics.sort_by(|a, b| {
        (&a.file, a.line, a.column).cmp(&(&b.file, b.line, b.column))
    });
    diagnostics
}

/// True when any diagnostic is an error or worse.
pub fn has_errors(diagnostics: &[Diagnostic]) -> bool {
    diagnostics.iter().any(|d| d.severity >= Severity::Error)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_error_with_column() {
        let out = "src/main.c:3:5: error: expected ';' before 'return'\n";
        let diags = parse_diagnostics(out);
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].severity, Severity::Error);
        assert_eq!(diags[0].file, PathBuf::from("src/main.c"));
        assert_eq!(diags[0].line, 3);
        assert_eq!(diags[0].column, Some(5));
        assert!(diags[0].message.contains("expected ';'"));
    }

    #[test]
    fn parses_warning_flag() {
        let out = "lib.c:10:9: warning: unused variable 'x' [-Wunused-variable]\n";
        let diags = parse_diagnostics(out);
        assert_eq!(diags[0].severity, Severity::Warning);
        assert_eq!(diags[0].flag.as_deref(), Some("-Wunused-variable"));
    }

    #[test]
    fn fatal_error_recognized() {
        let out = "main.c:1:10: fatal error: missing.h: No such file or directory\n";
        let diags = parse_diagnostics(out);
        assert_eq!(diags[0].severity, Severity::Fatal);
        assert!(has_errors(&diags));
    }

    #[test]
    fn unmatched_lines_dropped() {
        let out = "In file included from main.c:1:\ncompilation terminated.\n";
        assert!(parse_diagnostics(out).is_empty());
    }

    #[test]
    fn sorted_by_location() {
        let out = "\
a.c:10:1: warning: later [-Wfoo]
a.c:2:1: error: earlier
";
        let diags = parse_diagnostics(out);
        assert_eq!(diags[0].line, 2);
        assert_eq!(diags[1].line, 10);
    }

    #[test]
    fn note_severity_is_not_an_error() {
        let out = "a.c:2:1: note: declared here\n";
        let diags = parse_diagnostics(out);
        assert_eq!(diags[0].severity, Severity::Note);
        assert!(!has_errors(&diags));
    }
}
