//! Driving the workspace's webpack CLI in watch mode and decoding what it prints.

use crate::error::ResolveError;
use crate::protocol::{FromWorker, Stats};
use regex::Regex;
use serde_json::Value;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

static PROGRESS_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[webpack\.Progress\]\s+(\d{1,3})%").expect("progress regex is valid")
});

/// Find `tool` the way module resolution would: `node_modules/.bin` in `cwd`
/// or any of its ancestors.
pub fn resolve_tool(tool: &str, cwd: &Path) -> Result<PathBuf, ResolveError> {
    let mut names = vec![tool.to_string()];
    if cfg!(windows) {
        names.insert(0, format!("{tool}.cmd"));
    }

    cwd.ancestors()
        .map(|dir| dir.join("node_modules").join(".bin"))
        .flat_map(|bin| names.iter().map(move |name| bin.join(name)))
        .find(|candidate| candidate.is_file())
        .ok_or_else(|| ResolveError::ToolNotFound {
            tool: tool.to_string(),
            cwd: cwd.to_path_buf(),
        })
}

/// Resolved program and arguments of one watch session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub cwd: PathBuf,
}

impl WatchCommand {
    pub fn resolve(tool: &str, cwd: &Path, config_file: &Path) -> Result<Self, ResolveError> {
        let config = cwd.join(config_file);
        if !config.is_file() {
            return Err(ResolveError::ConfigMissing(config));
        }
        let program = resolve_tool(tool, cwd)?;

        Ok(WatchCommand {
            program,
            args: vec![
                "--watch".into(),
                // Lets the session close gracefully when stdin does.
                "--watch-options-stdin".into(),
                "--config".into(),
                config.into_os_string(),
                "--mode".into(),
                "development".into(),
                "--progress".into(),
                "--json".into(),
            ],
            cwd: cwd.to_path_buf(),
        })
    }
}

/// Turns the CLI's output lines into protocol messages.
///
/// Progress arrives on stderr; each finished compile prints a JSON stats
/// document on stdout, possibly spread over many lines.
#[derive(Debug, Default)]
pub struct OutputDecoder {
    in_cycle: bool,
    block: Option<JsonBlock>,
}

impl OutputDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stdout_line(&mut self, line: &str) -> Vec<FromWorker> {
        let mut out = Vec::new();
        if let Some(block) = self.block.as_mut() {
            if JsonBlock::continues(line) {
                block.push(line);
                if block.is_complete() {
                    let text = self.block.take().map(|b| b.text).unwrap_or_default();
                    return self.finish_cycle(&text);
                }
                return out;
            }
            // Not pretty-printed JSON after all: give the lines back as log output.
            if let Some(abandoned) = self.block.take() {
                out.extend(abandoned.text.lines().map(FromWorker::log));
            }
        }

        if line.trim_start().starts_with('{') {
            let mut block = JsonBlock::default();
            block.push(line);
            if block.is_complete() {
                out.extend(self.finish_cycle(&block.text));
                return out;
            }
            self.block = Some(block);
            return out;
        }

        out.push(FromWorker::log(line));
        out
    }

    pub fn stderr_line(&mut self, line: &str) -> Vec<FromWorker> {
        let Some(caps) = PROGRESS_LINE.captures(line) else {
            return vec![FromWorker::log_error(line)];
        };
        let percent = caps[1].parse::<u8>().unwrap_or(100).min(100);

        let mut out = Vec::new();
        if !self.in_cycle {
            self.in_cycle = true;
            out.push(FromWorker::CompileProgress {
                percent: 0,
                done: false,
            });
        }
        out.push(FromWorker::CompileProgress {
            percent,
            done: false,
        });
        out
    }

    /// Output that ended in the middle of a stats document is dropped.
    pub fn reset(&mut self) {
        self.in_cycle = false;
        self.block = None;
    }

    fn finish_cycle(&mut self, text: &str) -> Vec<FromWorker> {
        self.in_cycle = false;
        let done = FromWorker::CompileProgress {
            percent: 100,
            done: true,
        };
        match serde_json::from_str::<Value>(text) {
            Ok(json) => vec![
                done,
                FromWorker::ResultStats {
                    stats: stats_from_json(&json),
                },
            ],
            Err(e) => vec![
                done,
                FromWorker::ResultError {
                    error: serde_json::json!({
                        "message": format!("Unreadable stats output: {e}"),
                    }),
                },
            ],
        }
    }
}

/// Restrict a stats document to its errors and warnings.
pub fn stats_from_json(json: &Value) -> Stats {
    Stats {
        errors: problems(json, "errors"),
        warnings: problems(json, "warnings"),
    }
}

fn problems(json: &Value, key: &str) -> Vec<String> {
    json.get(key)
        .and_then(Value::as_array)
        .map(|items| items.iter().map(render_problem).collect())
        .unwrap_or_default()
}

/// Older webpack prints problems as strings; newer as objects with the
/// module name and location split out.
fn render_problem(item: &Value) -> String {
    match item {
        Value::String(text) => text.clone(),
        Value::Object(fields) => {
            let message = fields
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let module = fields
                .get("moduleName")
                .and_then(Value::as_str)
                .filter(|m| !m.is_empty());
            let loc = fields
                .get("loc")
                .and_then(Value::as_str)
                .filter(|l| !l.is_empty());
            match (module, loc) {
                (Some(module), Some(loc)) => format!("{module} {loc}\n{message}"),
                (Some(module), None) => format!("{module}\n{message}"),
                _ => message.to_string(),
            }
        }
        other => other.to_string(),
    }
}

/// Accumulates lines until the braces of a JSON document balance.
#[derive(Debug, Default)]
struct JsonBlock {
    text: String,
    depth: i64,
    opened: bool,
    in_string: bool,
    escaped: bool,
}

impl JsonBlock {
    fn push(&mut self, line: &str) {
        for c in line.chars() {
            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if c == '\\' {
                    self.escaped = true;
                } else if c == '"' {
                    self.in_string = false;
                }
                continue;
            }
            match c {
                '"' => self.in_string = true,
                '{' | '[' => {
                    self.depth += 1;
                    self.opened = true;
                }
                '}' | ']' => self.depth -= 1,
                _ => {}
            }
        }
        self.text.push_str(line);
        self.text.push('\n');
    }

    /// Stats are pretty-printed: every line after the first is indented,
    /// except the closing bracket.
    fn continues(line: &str) -> bool {
        line.is_empty() || line.starts_with(char::is_whitespace) || line.starts_with(['}', ']'])
    }

    fn is_complete(&self) -> bool {
        self.opened && self.depth <= 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn resolves_tool_from_ancestor_node_modules() {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("node_modules").join(".bin");
        fs::create_dir_all(&bin).unwrap();
        let name = if cfg!(windows) { "webpack.cmd" } else { "webpack" };
        fs::write(bin.join(name), "").unwrap();
        let nested = dir.path().join("packages").join("app");
        fs::create_dir_all(&nested).unwrap();

        assert_eq!(resolve_tool("webpack", &nested).unwrap(), bin.join(name));
        assert!(matches!(
            resolve_tool("rspack", &nested),
            Err(ResolveError::ToolNotFound { .. })
        ));
    }

    #[test]
    fn watch_command_requires_config() {
        let dir = tempfile::tempdir().unwrap();
        let err = WatchCommand::resolve("webpack", dir.path(), Path::new("webpack.config.js"))
            .unwrap_err();
        assert!(matches!(err, ResolveError::ConfigMissing(_)));

        fs::write(dir.path().join("webpack.config.js"), "").unwrap();
        let err = WatchCommand::resolve("webpack", dir.path(), Path::new("webpack.config.js"))
            .unwrap_err();
        assert!(matches!(err, ResolveError::ToolNotFound { .. }));
    }

    #[test]
    fn watch_command_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("node_modules").join(".bin");
        fs::create_dir_all(&bin).unwrap();
        fs::write(bin.join(if cfg!(windows) { "webpack.cmd" } else { "webpack" }), "").unwrap();
        fs::write(dir.path().join("webpack.config.js"), "").unwrap();

        let cmd =
            WatchCommand::resolve("webpack", dir.path(), Path::new("webpack.config.js")).unwrap();
        assert_eq!(cmd.cwd, dir.path());
        assert!(cmd.args.contains(&OsString::from("--watch")));
        assert!(cmd.args.contains(&OsString::from("--json")));
        assert!(cmd
            .args
            .contains(&dir.path().join("webpack.config.js").into_os_string()));
    }

    #[test]
    fn progress_lines_open_a_cycle() {
        let mut decoder = OutputDecoder::new();
        let out = decoder.stderr_line("<s> [webpack.Progress] 10% building 0/1 entries");
        assert_eq!(
            out,
            vec![
                FromWorker::CompileProgress {
                    percent: 0,
                    done: false
                },
                FromWorker::CompileProgress {
                    percent: 10,
                    done: false
                },
            ]
        );
        let out = decoder.stderr_line("<s> [webpack.Progress] 65% building");
        assert_eq!(
            out,
            vec![FromWorker::CompileProgress {
                percent: 65,
                done: false
            }]
        );
    }

    #[test]
    fn other_lines_are_logged() {
        let mut decoder = OutputDecoder::new();
        assert_eq!(
            decoder.stderr_line("[webpack-cli] watching files"),
            vec![FromWorker::log_error("[webpack-cli] watching files")]
        );
        assert_eq!(
            decoder.stdout_line("asset bundle.js 1 KiB"),
            vec![FromWorker::log("asset bundle.js 1 KiB")]
        );
    }

    #[test]
    fn multi_line_stats_finish_the_cycle() {
        let mut decoder = OutputDecoder::new();
        decoder.stderr_line("<s> [webpack.Progress] 99% done");

        assert!(decoder.stdout_line("{").is_empty());
        assert!(decoder.stdout_line(r#"  "hash": "abc {not a brace","#).is_empty());
        assert!(decoder
            .stdout_line(r#"  "errors": ["src/index.js 5:8\nsome error"],"#)
            .is_empty());
        assert!(decoder.stdout_line(r#"  "warnings": []"#).is_empty());
        let out = decoder.stdout_line("}");

        assert_eq!(
            out,
            vec![
                FromWorker::CompileProgress {
                    percent: 100,
                    done: true
                },
                FromWorker::ResultStats {
                    stats: Stats {
                        errors: vec!["src/index.js 5:8\nsome error".into()],
                        warnings: vec![],
                    }
                },
            ]
        );

        // The next progress tick starts a new cycle.
        let out = decoder.stderr_line("<s> [webpack.Progress] 1% setup");
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn single_line_stats_with_objects() {
        let mut decoder = OutputDecoder::new();
        let out = decoder.stdout_line(
            r#"{"errors":[{"moduleName":"./src/a.js","loc":"3:4-9","message":"Module not found"}],"warnings":[{"message":"size limit"}]}"#,
        );
        assert_eq!(
            out[1],
            FromWorker::ResultStats {
                stats: Stats {
                    errors: vec!["./src/a.js 3:4-9\nModule not found".into()],
                    warnings: vec!["size limit".into()],
                }
            }
        );
    }

    #[test]
    fn clean_stats_still_report() {
        let mut decoder = OutputDecoder::new();
        let out = decoder.stdout_line(r#"{"hash":"x","errors":[],"warnings":[]}"#);
        assert!(matches!(&out[1], FromWorker::ResultStats { stats } if stats.is_clean()));
    }

    #[test]
    fn unreadable_stats_are_a_hard_error() {
        let mut decoder = OutputDecoder::new();
        let out = decoder.stdout_line("{ this is: not json }");
        assert!(matches!(out[1], FromWorker::ResultError { .. }));
    }

    #[test]
    fn unbalanced_brace_line_does_not_swallow_output() {
        let mut decoder = OutputDecoder::new();
        assert!(decoder.stdout_line("{ oops, a stray brace").is_empty());
        assert_eq!(
            decoder.stdout_line("asset bundle.js 1 KiB"),
            vec![
                FromWorker::log("{ oops, a stray brace"),
                FromWorker::log("asset bundle.js 1 KiB"),
            ]
        );
        assert_eq!(
            decoder.stdout_line("compiled successfully"),
            vec![FromWorker::log("compiled successfully")]
        );

        // A real stats document right after still parses.
        let out = decoder.stdout_line(r#"{"errors":[],"warnings":[]}"#);
        assert!(matches!(&out[1], FromWorker::ResultStats { stats } if stats.is_clean()));
    }

    #[test]
    fn abandoned_block_is_followed_by_a_new_one() {
        let mut decoder = OutputDecoder::new();
        decoder.stdout_line("{ stray");
        let out = decoder.stdout_line("{");
        assert_eq!(out, vec![FromWorker::log("{ stray")]);
        decoder.stdout_line(r#"  "errors": [],"#);
        decoder.stdout_line(r#"  "warnings": []"#);
        let out = decoder.stdout_line("}");
        assert!(matches!(&out[1], FromWorker::ResultStats { stats } if stats.is_clean()));
    }

    #[test]
    fn reset_drops_partial_stats() {
        let mut decoder = OutputDecoder::new();
        decoder.stdout_line("{");
        decoder.reset();
        assert_eq!(decoder.stdout_line("hello"), vec![FromWorker::log("hello")]);
    }
}
