//! Migration script discovery and parsing.
//!
//! Scripts are named `<version>_<mode>.<ext>`. The extension picks the
//! format: `.mig` command scripts (one command per line), `.sql` statements
//! and `.txt`/`.rst` doctests (`>>> command` lines followed by the expected
//! output).

use std::path::{Path, PathBuf};

use cubicweb_deps::Version;
use tracing::debug;

use crate::config::Mode;
use crate::error::{CwError, MigrationError, Result};

pub const ALLOWED_EXTENSIONS: [&str; 4] = ["mig", "sql", "txt", "rst"];

/// Editor leftovers never picked up as scripts.
pub const IGNORED_SUFFIXES: [&str; 3] = ["~", ".orig", ".swp"];

/// Repair script of the framework migration directory, run before anything
/// else when the framework itself is upgraded.
pub const BOOTSTRAP_SCRIPT: &str = "bootstrapmigration.mig";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptKind {
    Commands,
    Sql,
    Doctest,
}

impl ScriptKind {
    pub fn of(path: &Path) -> Result<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("mig") => Ok(Self::Commands),
            Some("sql") => Ok(Self::Sql),
            Some("txt" | "rst") => Ok(Self::Doctest),
            _ => Err(MigrationError::UnknownExtension {
                path: path.to_path_buf(),
                allowed: ALLOWED_EXTENSIONS.join(", "),
            }
            .into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationScript {
    pub version: Version,
    pub mode: String,
    pub path: PathBuf,
}

/// Version and mode encoded in a script file name.
pub fn parse_script_name(file_name: &str) -> Option<(Version, String)> {
    let (stem, _ext) = file_name.rsplit_once('.')?;
    let (version, mode) = stem.rsplit_once('_')?;
    Some((version.parse().ok()?, mode.to_string()))
}

/// Scripts of `directory` with `from < version <= to` whose mode `mode`
/// accepts, by ascending version.
pub fn filter_scripts(directory: &Path, from: Version, to: Version, mode: Mode) -> Result<Vec<MigrationScript>> {
    if from >= to || !directory.is_dir() {
        return Ok(Vec::new());
    }
    let pattern = format!("{}/*_*.*", glob::Pattern::escape(&directory.to_string_lossy()));
    let paths = glob::glob(&pattern).map_err(|e| MigrationError::Syntax(e.to_string()))?;
    let mut scripts = Vec::new();
    for path in paths.flatten() {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if IGNORED_SUFFIXES.iter().any(|s| name.ends_with(s)) || !path.is_file() {
            continue;
        }
        let Some((version, script_mode)) = parse_script_name(name) else {
            debug!(file = name, "Not a migration script name");
            continue;
        };
        if !mode.accepts(&script_mode) || version <= from || version > to {
            continue;
        }
        scripts.push(MigrationScript {
            version,
            mode: script_mode,
            path,
        });
    }
    scripts.sort_by(|a, b| (a.version, &a.path).cmp(&(b.version, &b.path)));
    Ok(scripts)
}

// ── Command scripts ───────────────────────────────────────────────

/// Split a command line into words. Single quotes are literal, double
/// quotes allow `\"` and `\\`, an unquoted `#` starting a word begins a
/// comment.
pub fn tokenize(line: &str) -> std::result::Result<Vec<String>, MigrationError> {
    let mut words = Vec::new();
    let mut current: Option<String> = None;
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        match c {
            c if c.is_whitespace() => {
                if let Some(word) = current.take() {
                    words.push(word);
                }
            }
            '#' if current.is_none() => break,
            '\'' => {
                let word = current.get_or_insert_with(String::new);
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => word.push(c),
                        None => return Err(MigrationError::Syntax(format!("unclosed quote in {line:?}"))),
                    }
                }
            }
            '"' => {
                let word = current.get_or_insert_with(String::new);
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(c @ ('"' | '\\')) => word.push(c),
                            Some(c) => {
                                word.push('\\');
                                word.push(c);
                            }
                            None => {
                                return Err(MigrationError::Syntax(format!("unclosed quote in {line:?}")));
                            }
                        },
                        Some(c) => word.push(c),
                        None => return Err(MigrationError::Syntax(format!("unclosed quote in {line:?}"))),
                    }
                }
            }
            '\\' => {
                let escaped = chars
                    .next()
                    .ok_or_else(|| MigrationError::Syntax(format!("trailing backslash in {line:?}")))?;
                current.get_or_insert_with(String::new).push(escaped);
            }
            c => current.get_or_insert_with(String::new).push(c),
        }
    }
    if let Some(word) = current {
        words.push(word);
    }
    Ok(words)
}

/// A command with its 1-based line number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub line: usize,
    pub words: Vec<String>,
}

pub fn parse_commands(path: &Path, text: &str) -> Result<Vec<CommandLine>> {
    let mut commands = Vec::new();
    for (index, line) in text.lines().enumerate() {
        let words = tokenize(line).map_err(|e| MigrationError::Script {
            path: path.to_path_buf(),
            line: index + 1,
            source: Box::new(CwError::from(e)),
        })?;
        if !words.is_empty() {
            commands.push(CommandLine {
                line: index + 1,
                words,
            });
        }
    }
    Ok(commands)
}

// ── Doctests ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DoctestStep {
    pub line: usize,
    pub command: String,
    /// Expected output lines, empty when the command prints nothing.
    pub expected: Vec<String>,
}

/// Steps of a doctest. Text outside `>>>` blocks is prose.
pub fn parse_doctest(text: &str) -> Vec<DoctestStep> {
    let mut steps: Vec<DoctestStep> = Vec::new();
    let mut in_output = false;
    for (index, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if let Some(command) = line.strip_prefix(">>>") {
            steps.push(DoctestStep {
                line: index + 1,
                command: command.trim().to_string(),
                expected: Vec::new(),
            });
            in_output = true;
        } else if line.is_empty() {
            in_output = false;
        } else if in_output {
            if let Some(step) = steps.last_mut() {
                step.expected.push(line.to_string());
            }
        }
    }
    steps
}

// ── SQL scripts ───────────────────────────────────────────────────

/// Split SQL text on `;` outside quotes, dropping `--` comments and empty
/// statements. Each statement comes with the 1-based line it starts on.
pub fn split_sql(text: &str) -> Vec<(usize, String)> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut start: Option<usize> = None;
    let mut line = 1;
    let mut quote: Option<char> = None;
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match (quote, c) {
            (Some(q), c) if c == q => {
                quote = None;
                current.push(c);
            }
            (Some(_), c) => current.push(c),
            (None, '\'' | '"') => {
                quote = Some(c);
                start.get_or_insert(line);
                current.push(c);
            }
            (None, '-') if chars.peek() == Some(&'-') => {
                for c in chars.by_ref() {
                    if c == '\n' {
                        line += 1;
                        current.push('\n');
                        break;
                    }
                }
                continue;
            }
            (None, ';') => {
                push_statement(&mut statements, &mut current, start.take());
            }
            (None, c) => {
                if !c.is_whitespace() {
                    start.get_or_insert(line);
                }
                current.push(c);
            }
        }
        if c == '\n' {
            line += 1;
        }
    }
    push_statement(&mut statements, &mut current, start);
    statements
}

fn push_statement(statements: &mut Vec<(usize, String)>, current: &mut String, start: Option<usize>) {
    let stmt = current.trim();
    if let (Some(line), false) = (start, stmt.is_empty()) {
        statements.push((line, stmt.to_string()));
    }
    current.clear();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        s.parse().unwrap()
    }

    fn touch(dir: &Path, names: &[&str]) {
        for name in names {
            std::fs::write(dir.join(name), "").unwrap();
        }
    }

    fn versions(scripts: &[MigrationScript]) -> Vec<String> {
        scripts.iter().map(|s| s.version.to_string()).collect()
    }

    #[test]
    fn filter_keeps_half_open_range_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        touch(tmp.path(), &["2.10.2_Any.mig", "2.5.0_Any.mig", "2.6.0_Any.sql"]);
        let scripts = filter_scripts(tmp.path(), v("2.4.0"), v("2.6.0"), Mode::All).unwrap();
        assert_eq!(versions(&scripts), vec!["2.5.0", "2.6.0"]);
        let all = filter_scripts(tmp.path(), v("2.4.0"), v("3.0.0"), Mode::All).unwrap();
        assert_eq!(versions(&all), vec!["2.5.0", "2.6.0", "2.10.2"]);
    }

    #[test]
    fn same_version_yields_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        touch(tmp.path(), &["2.5.0_Any.mig"]);
        for x in ["2.4.0", "2.5.0", "9.9.9"] {
            assert!(filter_scripts(tmp.path(), v(x), v(x), Mode::All).unwrap().is_empty());
        }
    }

    #[test]
    fn modes_and_leftovers_are_filtered() {
        let tmp = tempfile::tempdir().unwrap();
        touch(
            tmp.path(),
            &["1.1.0_web.mig", "1.1.0_repository.mig", "1.1.0_Any.mig~", "1.1.0_Any.mig.orig", "README"],
        );
        let repo = filter_scripts(tmp.path(), v("1.0.0"), v("1.1.0"), Mode::Repository).unwrap();
        assert_eq!(repo.len(), 1);
        assert_eq!(repo[0].mode, "repository");
        let web = filter_scripts(tmp.path(), v("1.0.0"), v("1.1.0"), Mode::Web).unwrap();
        assert_eq!(web.len(), 1);
        assert_eq!(web[0].mode, "web");
    }

    #[test]
    fn unknown_extension_names_the_allowed_set() {
        let err = ScriptKind::of(Path::new("1.0.0_Any.py")).unwrap_err();
        assert!(err.to_string().contains("mig, sql, txt, rst"));
        assert_eq!(ScriptKind::of(Path::new("x.rst")).unwrap(), ScriptKind::Doctest);
    }

    #[test]
    fn tokenizer_handles_quotes_and_comments() {
        assert_eq!(
            tokenize(r#"sql "UPDATE t SET a = 'x'" # trailing"#).unwrap(),
            vec!["sql", "UPDATE t SET a = 'x'"]
        );
        assert_eq!(tokenize("set_property 'a b' c\\ d").unwrap(), vec!["set_property", "a b", "c d"]);
        assert_eq!(tokenize(r#"x "a\"b""#).unwrap(), vec!["x", "a\"b"]);
        assert!(tokenize("# only a comment").unwrap().is_empty());
        assert!(tokenize("sql 'open").is_err());
    }

    #[test]
    fn doctest_steps_collect_expected_lines() {
        let text = "Some prose.\n\n>>> sql \"SELECT 1\"\n1\n\n>>> commit\n\nMore prose.\n";
        let steps = parse_doctest(text);
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].line, 3);
        assert_eq!(steps[0].expected, vec!["1"]);
        assert!(steps[1].expected.is_empty());
    }

    #[test]
    fn sql_split_respects_quotes_and_comments() {
        let stmts = split_sql("-- header\nINSERT INTO t VALUES ('a;b');\n\nDELETE FROM t;");
        assert_eq!(
            stmts,
            vec![(2, "INSERT INTO t VALUES ('a;b')".to_string()), (4, "DELETE FROM t".to_string())]
        );
    }

    #[test]
    fn sql_statements_carry_their_own_line() {
        let text = "CREATE TABLE x (a INTEGER);\nCREATE TABLE x (a INTEGER);\n";
        let lines: Vec<usize> = split_sql(text).into_iter().map(|(line, _)| line).collect();
        assert_eq!(lines, vec![1, 2]);
        let quoted = split_sql("INSERT INTO t VALUES ('a\nb');\n  DELETE FROM t;");
        assert_eq!(quoted[1].0, 2);
    }
}
