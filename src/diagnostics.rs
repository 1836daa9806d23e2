//! Turns build tool error and warning strings into file-addressed diagnostics.
//!
//! Build tools report point locations, so every diagnostic covers exactly one
//! column. Strings that match no known dialect yield `None`; they stay visible
//! in the raw log only.

use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

/// Tag stamped on every diagnostic produced here.
pub const SOURCE: &str = "webpack";

/// `[tsl] ERROR in /abs/file.ts(2,1)` followed by the message on later lines.
static LOADER_DIALECT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\[[^\]\n]+\][^\n]*?\sin\s+(\S[^\n]*?)\((\d+),(\d+)\)[ \t]*(?:\r?\n|$)")
        .expect("loader dialect regex is valid")
});

/// `src/index.js 5:8` on the first line, message on the rest.
static GENERIC_DIALECT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\S+)(?:\s(\d+):(\d+))?").expect("generic dialect regex is valid")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

impl Severity {
    pub fn label(self) -> &'static str {
        match self {
            Severity::Error => "error",
            Severity::Warning => "warning",
        }
    }
}

/// Zero-based position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct Position {
    pub line: u32,
    pub character: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Range {
    pub start: Position,
    pub end: Position,
}

impl Range {
    /// One-column range at a zero-based point.
    pub fn point(line: u32, character: u32) -> Self {
        Range {
            start: Position { line, character },
            end: Position {
                line,
                character: character.saturating_add(1),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub uri: PathBuf,
    pub range: Range,
    pub message: String,
    pub severity: Severity,
    pub source: &'static str,
}

/// Parse one raw error or warning string. Dialects are tried in order and the
/// first match wins.
pub fn parse(severity: Severity, input: &str, root: &Path) -> Option<Diagnostic> {
    parse_loader(severity, input, root).or_else(|| parse_generic(severity, input, root))
}

fn parse_loader(severity: Severity, input: &str, root: &Path) -> Option<Diagnostic> {
    let caps = LOADER_DIALECT.captures(input)?;
    let whole = caps.get(0)?;
    let line = number(&caps[2]);
    let column = number(&caps[3]);

    Some(build(
        severity,
        &caps[1],
        line,
        column,
        &input[whole.end()..],
        root,
    ))
}

fn parse_generic(severity: Severity, input: &str, root: &Path) -> Option<Diagnostic> {
    let caps = GENERIC_DIALECT.captures(input)?;
    let (line, column) = match (caps.get(2), caps.get(3)) {
        (Some(line), Some(column)) => (number(line.as_str()), number(column.as_str())),
        _ => (1, 1),
    };
    let message = input.split_once('\n').map(|(_, rest)| rest).unwrap_or("");

    Some(build(severity, &caps[1], line, column, message, root))
}

/// Digits only; anything too large for a `u32` saturates.
fn number(digits: &str) -> u32 {
    digits.parse().unwrap_or(u32::MAX)
}

/// `line` and `column` are one-based, as build tools print them.
fn build(
    severity: Severity,
    file: &str,
    line: u32,
    column: u32,
    message: &str,
    root: &Path,
) -> Diagnostic {
    Diagnostic {
        uri: resolve(file, root),
        range: Range::point(line.saturating_sub(1), column.saturating_sub(1)),
        message: message.to_string(),
        severity,
        source: SOURCE,
    }
}

fn resolve(file: &str, root: &Path) -> PathBuf {
    let path = Path::new(file);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        normalize(&root.join(path))
    }
}

/// Lexical `..` resolution that never climbs above the root.
fn normalize(path: &Path) -> PathBuf {
    let mut out: Vec<Component> = Vec::new();
    for c in path.components() {
        match c {
            Component::ParentDir => match out.last().copied() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir | Component::Prefix(_)) => {}
                _ => out.push(c),
            },
            Component::CurDir => {}
            other => out.push(other),
        }
    }
    out.iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(sl: u32, sc: u32, el: u32, ec: u32) -> Range {
        Range {
            start: Position {
                line: sl,
                character: sc,
            },
            end: Position {
                line: el,
                character: ec,
            },
        }
    }

    #[test]
    fn error_with_line_and_column() {
        let d = parse(
            Severity::Error,
            "src/index.js 5:8\nsome error description\n",
            Path::new("/root"),
        )
        .unwrap();

        assert_eq!(d.uri, PathBuf::from("/root/src/index.js"));
        assert_eq!(d.range, range(4, 7, 4, 8));
        assert_eq!(d.message, "some error description\n");
        assert_eq!(d.severity, Severity::Error);
        assert_eq!(d.source, "webpack");
    }

    #[test]
    fn error_without_line_and_column() {
        let d = parse(
            Severity::Warning,
            "src/index.js\nsome error description\n      ",
            Path::new("/root"),
        )
        .unwrap();

        assert_eq!(d.uri, PathBuf::from("/root/src/index.js"));
        assert_eq!(d.range, range(0, 0, 0, 1));
        assert_eq!(d.message, "some error description\n      ");
        assert_eq!(d.severity, Severity::Warning);
    }

    #[test]
    fn loader_annotated_error_keeps_absolute_path() {
        let input = "/complex-workspace/workspace/src/index.ts\n\
                     ./src/index.ts\n\
                     [tsl] ERROR in /complex-workspace/workspace/src/index.ts(2,1)\n      \
                     TS2304: Cannot find name 'asdfd'.\n";
        let d = parse(Severity::Error, input, Path::new("/elsewhere")).unwrap();

        assert_eq!(
            d.uri,
            PathBuf::from("/complex-workspace/workspace/src/index.ts")
        );
        assert_eq!(d.range, range(1, 0, 1, 1));
        assert_eq!(d.message, "      TS2304: Cannot find name 'asdfd'.\n");
    }

    #[test]
    fn loader_dialect_on_first_line() {
        let d = parse(
            Severity::Error,
            "[tsl] ERROR in /abs/path.ts(2,1)\n    TS2304: Cannot find name 'x'.\n",
            Path::new("/root"),
        )
        .unwrap();
        assert_eq!(d.uri, PathBuf::from("/abs/path.ts"));
        assert_eq!(d.range, range(1, 0, 1, 1));
        assert_eq!(d.message, "    TS2304: Cannot find name 'x'.\n");
    }

    #[test]
    fn loader_dialect_joins_relative_path() {
        let d = parse(
            Severity::Warning,
            "[eslint] WARNING in src/a.js(10,3)\nunused variable",
            Path::new("/root"),
        )
        .unwrap();
        assert_eq!(d.uri, PathBuf::from("/root/src/a.js"));
        assert_eq!(d.range, range(9, 2, 9, 3));
        assert_eq!(d.message, "unused variable");
    }

    #[test]
    fn relative_path_is_normalized() {
        let d = parse(Severity::Error, "./src/../lib/x.js 1:1\nboom", Path::new("/root")).unwrap();
        assert_eq!(d.uri, PathBuf::from("/root/lib/x.js"));
        assert_eq!(d.range, range(0, 0, 0, 1));
    }

    #[test]
    fn parent_dirs_stop_at_the_filesystem_root() {
        let d = parse(Severity::Error, "../../../x.js 1:1\nboom", Path::new("/a")).unwrap();
        assert_eq!(d.uri, PathBuf::from("/x.js"));
        assert!(d.uri.is_absolute());

        let d = parse(Severity::Error, "../b/./c.js\nboom", Path::new("/a/deep")).unwrap();
        assert_eq!(d.uri, PathBuf::from("/a/b/c.js"));
    }

    #[test]
    fn oversized_positions_saturate() {
        let d = parse(Severity::Error, "src/a.js 99999999999:1\nboom", Path::new("/a")).unwrap();
        assert_eq!(d.uri, PathBuf::from("/a/src/a.js"));
        assert_eq!(d.range.start.line, u32::MAX - 1);
        assert_eq!(d.range.start.character, 0);
        assert_eq!(d.message, "boom");

        let d = parse(
            Severity::Error,
            "[tsl] ERROR in /abs/x.ts(1,99999999999)\nboom",
            Path::new("/a"),
        )
        .unwrap();
        assert_eq!(d.range, range(0, u32::MAX - 1, 0, u32::MAX));
    }

    #[test]
    fn single_line_input_has_empty_message() {
        let d = parse(Severity::Error, "src/a.js 3:4", Path::new("/root")).unwrap();
        assert_eq!(d.range, range(2, 3, 2, 4));
        assert_eq!(d.message, "");
    }

    #[test]
    fn zero_positions_clamp() {
        let d = parse(Severity::Error, "a.js 0:0\nx", Path::new("/root")).unwrap();
        assert_eq!(d.range, range(0, 0, 0, 1));
    }

    #[test]
    fn no_dialect_matches() {
        assert_eq!(parse(Severity::Error, "", Path::new("/root")), None);
        assert_eq!(
            parse(Severity::Error, "   indented text\nmore", Path::new("/root")),
            None
        );
        assert_eq!(parse(Severity::Error, "\nsecond line", Path::new("/root")), None);
    }
}
