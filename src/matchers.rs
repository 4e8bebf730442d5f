//! Deterministic pattern fixes
//!
//! An error is classified by an ordered predicate table; at most one class
//! applies. Each class has a matcher that computes the new file content from
//! the old one. Matchers are idempotent: when there is nothing left to fix,
//! a second run leaves the file untouched.

use crate::backup::guarded;
use crate::error::{FixError, FixResult};
use crate::patch::{read_text, write_text, SourceLines};
use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;
use tracing::debug;

static MISSING_ATTRIBUTE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"'(\w+)' object has no attribute '(\w+)'").expect("attribute pattern is valid")
});

static ASSERTION_MISMATCH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\S+) != (\S+)").expect("assertion pattern is valid"));

static MISSING_MODULE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"No module named '([\w\.]+)'").expect("module pattern is valid")
});

static MISSING_POSITIONAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\w+)\(\) missing (\d+) required positional argument")
        .expect("positional pattern is valid")
});

const INDENT: &str = "    ";
const PLACEHOLDER_ARG: &str = "None";

/// Error classes the pattern tier knows how to fix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    MissingAttribute,
    AssertionMismatch,
    ImportError,
    MissingPositionalArgs,
    Indentation,
}

/// Classification table, in priority order. First match wins.
const CLASSIFIERS: &[(ErrorClass, fn(&str) -> bool)] = &[
    (ErrorClass::MissingAttribute, |e| e.contains("AttributeError")),
    (ErrorClass::AssertionMismatch, |e| e.contains("AssertionError")),
    (ErrorClass::ImportError, |e| e.contains("ImportError")),
    (ErrorClass::MissingPositionalArgs, |e| {
        e.contains("TypeError") && e.contains("missing") && e.contains("required positional argument")
    }),
    (ErrorClass::Indentation, |e| e.contains("IndentationError")),
];

/// Pick the one class that applies to `error`, if any.
pub fn classify(error: &str) -> Option<ErrorClass> {
    CLASSIFIERS
        .iter()
        .find(|(_, matches)| matches(error))
        .map(|(class, _)| *class)
}

/// What a successful matcher did to the file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchOutcome {
    Modified,
    Unchanged,
}

impl ErrorClass {
    pub fn name(&self) -> &'static str {
        match self {
            ErrorClass::MissingAttribute => "missing-attribute",
            ErrorClass::AssertionMismatch => "assertion-mismatch",
            ErrorClass::ImportError => "import-error",
            ErrorClass::MissingPositionalArgs => "missing-positional-args",
            ErrorClass::Indentation => "indentation",
        }
    }

    /// Compute the fixed content. `Ok(None)` means the fix is already in
    /// place.
    pub fn rewrite(&self, content: &str, error: &str) -> FixResult<Option<String>> {
        match self {
            ErrorClass::MissingAttribute => add_stub_method(content, error),
            ErrorClass::AssertionMismatch => align_assertion(content, error),
            ErrorClass::ImportError => add_import(content, error),
            ErrorClass::MissingPositionalArgs => pad_call_sites(content, error),
            ErrorClass::Indentation => Ok(expand_tabs(content)),
        }
    }

    /// Run the matcher against `path`, writing under a backup guard.
    pub fn apply(&self, path: &Path, error: &str) -> FixResult<MatchOutcome> {
        let content = read_text(path)?;
        match self.rewrite(&content, error)? {
            Some(fixed) => {
                guarded(path, |p| write_text(p, &fixed))?;
                debug!(file = %path.display(), matcher = self.name(), "pattern fix written");
                Ok(MatchOutcome::Modified)
            }
            None => Ok(MatchOutcome::Unchanged),
        }
    }
}

fn mismatch(matcher: &'static str) -> FixError {
    FixError::ParseMismatch { matcher }
}

fn indent_of(line: &str) -> &str {
    &line[..line.len() - line.trim_start().len()]
}

/// Insert a no-op method named after the missing attribute into its class.
/// A class that cannot be found is left alone.
fn add_stub_method(content: &str, error: &str) -> FixResult<Option<String>> {
    let caps = MISSING_ATTRIBUTE
        .captures(error)
        .ok_or_else(|| mismatch(ErrorClass::MissingAttribute.name()))?;
    let (class_name, attr) = (&caps[1], &caps[2]);

    let mut source = SourceLines::parse(content);
    let Some(class_idx) = source
        .lines
        .iter()
        .position(|line| is_class_definition(line, class_name))
    else {
        debug!(class = class_name, "class definition not found, nothing inserted");
        return Ok(None);
    };

    let class_indent = indent_of(&source.lines[class_idx]).to_string();
    let def_prefix = format!("def {}(", attr);
    let already_defined = source.lines[class_idx + 1..]
        .iter()
        .take_while(|line| line.trim().is_empty() || indent_of(line).len() > class_indent.len())
        .any(|line| line.trim_start().starts_with(&def_prefix));
    if already_defined {
        return Ok(None);
    }

    let body_indent = format!("{}{}", class_indent, INDENT);
    source.lines.insert(
        class_idx + 1,
        format!("{}def {}(self, *args, **kwargs):", body_indent, attr),
    );
    source
        .lines
        .insert(class_idx + 2, format!("{}{}pass", body_indent, INDENT));
    Ok(Some(source.render()))
}

fn is_class_definition(line: &str, class_name: &str) -> bool {
    line.trim_start()
        .strip_prefix("class ")
        .and_then(|rest| rest.trim_start().strip_prefix(class_name))
        .and_then(|rest| rest.chars().next())
        .is_some_and(|c| c == '(' || c == ':' || c.is_whitespace())
}

/// Rewrite the first `assert ... == ...` line so both sides are the actual
/// value reported by the failure.
fn align_assertion(content: &str, error: &str) -> FixResult<Option<String>> {
    let caps = ASSERTION_MISMATCH
        .captures(error)
        .ok_or_else(|| mismatch(ErrorClass::AssertionMismatch.name()))?;
    let actual = &caps[2];

    let mut source = SourceLines::parse(content);
    let line = source
        .lines
        .iter_mut()
        .find(|line| line.contains("==") && line.contains("assert"))
        .ok_or_else(|| mismatch(ErrorClass::AssertionMismatch.name()))?;

    let remainder = line
        .find("==")
        .map(|eq| {
            let rhs = &line[eq + 2..];
            let operand = rhs[..operand_end(rhs)].trim_end();
            rhs[operand.len()..].trim_end()
        })
        .unwrap_or_default();
    let rewritten = format!(
        "{}assert {} == {}{}",
        indent_of(line.as_str()),
        actual,
        actual,
        remainder
    );
    if *line == rewritten {
        return Ok(None);
    }
    *line = rewritten;
    Ok(Some(source.render()))
}

/// Byte offset where the operand at the start of `text` ends: the first
/// `,` or `#` outside brackets and string literals.
fn operand_end(text: &str) -> usize {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    for (i, c) in text.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"' | '\'') => quote = Some(c),
            (None, '(' | '[' | '{') => depth += 1,
            (None, ')' | ']' | '}') => depth = depth.saturating_sub(1),
            (None, ',' | '#') if depth == 0 => return i,
            _ => {}
        }
    }
    text.len()
}

/// Add `import <module>` at the top of the file. An existing import means
/// this matcher has nothing to offer.
fn add_import(content: &str, error: &str) -> FixResult<Option<String>> {
    let caps = MISSING_MODULE
        .captures(error)
        .ok_or_else(|| mismatch(ErrorClass::ImportError.name()))?;
    let module = &caps[1];

    let existing = Regex::new(&format!(
        r"(?m)^\s*(import\s+{m}\b|from\s+{m}\s+import\b)",
        m = regex::escape(module)
    ))
    .map_err(|e| FixError::PatchParse(e.to_string()))?;
    if existing.is_match(content) {
        return Err(FixError::NothingToDo(format!("'{}' is already imported", module)));
    }

    let mut source = SourceLines::parse(content);
    source.lines.insert(0, format!("import {}", module));
    Ok(Some(source.render()))
}

/// Append placeholder arguments to every call of the function named in the
/// error. Fails when no call site changed.
fn pad_call_sites(content: &str, error: &str) -> FixResult<Option<String>> {
    let caps = MISSING_POSITIONAL
        .captures(error)
        .ok_or_else(|| mismatch(ErrorClass::MissingPositionalArgs.name()))?;
    let function = &caps[1];
    let missing: usize = caps[2]
        .parse()
        .map_err(|_| mismatch(ErrorClass::MissingPositionalArgs.name()))?;

    let call = Regex::new(&format!(r"\b{}\(", regex::escape(function)))
        .map_err(|e| FixError::PatchParse(e.to_string()))?;
    let def_prefixes = [format!("def {}(", function), format!("async def {}(", function)];

    let mut source = SourceLines::parse(content);
    let mut changed = 0usize;
    let mut already_padded = 0usize;

    for line in source.lines.iter_mut() {
        let trimmed = line.trim_start();
        if def_prefixes.iter().any(|p| trimmed.starts_with(p.as_str())) {
            continue;
        }

        // Right to left so earlier offsets stay valid.
        let opens: Vec<usize> = call.find_iter(line.as_str()).map(|m| m.end() - 1).collect();
        for open in opens.into_iter().rev() {
            let Some(close) = matching_paren(line.as_str(), open) else {
                continue;
            };
            let args = &line[open + 1..close];
            if ends_with_placeholders(args, missing) {
                already_padded += 1;
                continue;
            }
            let padding = vec![PLACEHOLDER_ARG; missing].join(", ");
            let replacement = if args.trim().is_empty() {
                padding
            } else {
                format!("{}, {}", args.trim_end(), padding)
            };
            line.replace_range(open + 1..close, &replacement);
            changed += 1;
        }
    }

    match (changed, already_padded) {
        (0, 0) => Err(mismatch(ErrorClass::MissingPositionalArgs.name())),
        (0, _) => Ok(None),
        _ => Ok(Some(source.render())),
    }
}

fn matching_paren(line: &str, open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (i, c) in line[open..].char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(open + i);
                }
            }
            _ => {}
        }
    }
    None
}

fn ends_with_placeholders(args: &str, count: usize) -> bool {
    let parts: Vec<&str> = args.split(',').map(str::trim).collect();
    parts.len() >= count
        && count > 0
        && parts[parts.len() - count..].iter().all(|p| *p == PLACEHOLDER_ARG)
}

fn expand_tabs(content: &str) -> Option<String> {
    content.contains('\t').then(|| content.replace('\t', INDENT))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_classify_priority_order() {
        assert_eq!(
            classify("AttributeError: x; AssertionError: 1 != 2"),
            Some(ErrorClass::MissingAttribute)
        );
        assert_eq!(
            classify("AssertionError: 1 != 2"),
            Some(ErrorClass::AssertionMismatch)
        );
        assert_eq!(
            classify("ImportError: No module named 'requests'"),
            Some(ErrorClass::ImportError)
        );
        assert_eq!(
            classify("TypeError: add() missing 1 required positional argument: 'b'"),
            Some(ErrorClass::MissingPositionalArgs)
        );
        assert_eq!(classify("TypeError: unsupported operand"), None);
        assert_eq!(
            classify("IndentationError: unexpected indent"),
            Some(ErrorClass::Indentation)
        );
        assert_eq!(classify("ZeroDivisionError: division by zero"), None);
    }

    #[test]
    fn test_stub_method_inserted_after_class_line() {
        let content = "class Calc:\n    def sub(self, a, b):\n        return a - b\n";
        let fixed = add_stub_method(content, "AttributeError: 'Calc' object has no attribute 'add'")
            .unwrap()
            .unwrap();
        assert_eq!(
            fixed,
            "class Calc:\n    def add(self, *args, **kwargs):\n        pass\n    def sub(self, a, b):\n        return a - b\n"
        );
        // Second run: method exists, nothing changes.
        assert_eq!(
            add_stub_method(&fixed, "AttributeError: 'Calc' object has no attribute 'add'").unwrap(),
            None
        );
    }

    #[test]
    fn test_stub_method_class_not_found_is_noop() {
        let content = "class Calculator:\n    pass\n";
        assert_eq!(
            add_stub_method(content, "'Calc' object has no attribute 'add'").unwrap(),
            None
        );
        assert!(matches!(
            add_stub_method(content, "AttributeError: module has no attribute"),
            Err(FixError::ParseMismatch { .. })
        ));
    }

    #[test]
    fn test_align_assertion() {
        let content = "def test_add():\n    assert add(2, 2) == 5\n    assert other() == 1\n";
        let fixed = align_assertion(content, "AssertionError: 5 != 4").unwrap().unwrap();
        assert_eq!(
            fixed,
            "def test_add():\n    assert 4 == 4\n    assert other() == 1\n"
        );
        assert_eq!(align_assertion(&fixed, "AssertionError: 5 != 4").unwrap(), None);
    }

    #[test]
    fn test_align_assertion_keeps_message_and_comment() {
        let content = "    assert total(\"a,b\") == 5, \"total, off\"\nassert f() == 1  # flaky\n";
        let fixed = align_assertion(content, "AssertionError: 5 != 4").unwrap().unwrap();
        assert_eq!(
            fixed,
            "    assert 4 == 4, \"total, off\"\nassert f() == 1  # flaky\n"
        );
        assert_eq!(align_assertion(&fixed, "AssertionError: 5 != 4").unwrap(), None);

        let fixed = align_assertion("assert f() == 1  # flaky\n", "AssertionError: 1 != 2")
            .unwrap()
            .unwrap();
        assert_eq!(fixed, "assert 2 == 2  # flaky\n");
    }

    #[test]
    fn test_align_assertion_without_assert_line_fails() {
        let content = "def test_add():\n    self.assertEqual(1, 2)\n";
        assert!(matches!(
            align_assertion(content, "AssertionError: 1 != 2"),
            Err(FixError::ParseMismatch { .. })
        ));
    }

    #[test]
    fn test_add_import() {
        let content = "def test_get():\n    requests.get('x')\n";
        let fixed = add_import(content, "ImportError: No module named 'requests'")
            .unwrap()
            .unwrap();
        assert!(fixed.starts_with("import requests\n"));
        assert!(matches!(
            add_import(&fixed, "ImportError: No module named 'requests'"),
            Err(FixError::NothingToDo(_))
        ));
        assert!(matches!(
            add_import("from os.path import join\n", "No module named 'os.path'"),
            Err(FixError::NothingToDo(_))
        ));
    }

    #[test]
    fn test_pad_call_sites() {
        let content = "def add(a, b):\n    return a + b\n\nx = add(1)\ny = calc.add() + add(add(2))\n";
        let fixed = pad_call_sites(
            content,
            "TypeError: add() missing 1 required positional argument: 'b'",
        )
        .unwrap()
        .unwrap();
        assert_eq!(
            fixed,
            "def add(a, b):\n    return a + b\n\nx = add(1, None)\ny = calc.add(None) + add(add(2, None), None)\n"
        );
    }

    #[test]
    fn test_pad_call_sites_second_run_is_noop() {
        let content = "result = mul(3)\n";
        let error = "TypeError: mul() missing 2 required positional arguments: 'b' and 'c'";
        let fixed = pad_call_sites(content, error).unwrap().unwrap();
        assert_eq!(fixed, "result = mul(3, None, None)\n");
        assert_eq!(pad_call_sites(&fixed, error).unwrap(), None);
    }

    #[test]
    fn test_pad_call_sites_without_calls_fails() {
        assert!(pad_call_sites(
            "def add(a, b):\n    pass\n",
            "TypeError: add() missing 1 required positional argument: 'b'"
        )
        .is_err());
    }

    #[test]
    fn test_indentation_fix_is_idempotent_on_disk() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("m.py");
        fs::write(&file, "def f():\n\treturn 1\n").unwrap();

        let first = ErrorClass::Indentation
            .apply(&file, "IndentationError: unindent")
            .unwrap();
        let once = fs::read_to_string(&file).unwrap();
        let second = ErrorClass::Indentation
            .apply(&file, "IndentationError: unindent")
            .unwrap();
        let twice = fs::read_to_string(&file).unwrap();

        assert_eq!(first, MatchOutcome::Modified);
        assert_eq!(second, MatchOutcome::Unchanged);
        assert_eq!(once, "def f():\n    return 1\n");
        assert_eq!(once, twice);
    }

    #[test]
    fn test_crlf_line_endings_survive_pattern_fixes() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("calc.py");
        fs::write(&file, "class Calc:\r\n    x = 1\r\n").unwrap();

        let outcome = ErrorClass::MissingAttribute
            .apply(&file, "AttributeError: 'Calc' object has no attribute 'add'")
            .unwrap();
        assert_eq!(outcome, MatchOutcome::Modified);
        assert_eq!(
            fs::read_to_string(&file).unwrap(),
            "class Calc:\r\n    def add(self, *args, **kwargs):\r\n        pass\r\n    x = 1\r\n"
        );

        let fixed = add_import("x = 1\r\n", "No module named 'os'").unwrap().unwrap();
        assert_eq!(fixed, "import os\r\nx = 1\r\n");
    }

    #[test]
    fn test_apply_missing_file() {
        let dir = tempdir().unwrap();
        let err = ErrorClass::Indentation
            .apply(&dir.path().join("gone.py"), "IndentationError")
            .unwrap_err();
        assert!(matches!(err, FixError::FileNotFound(_)));
    }
}
