//! Unified diff parsing and application
//!
//! Handles diffs covering one or more files, as produced by `git diff` or
//! (less reliably) by a language model.

use crate::error::{FixError, FixResult};
use crate::util::line_ending;

/// How far from the stated start line a hunk may have drifted.
const HUNK_SEARCH_WINDOW: usize = 200;

/// A single line in a diff hunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffLine {
    Context(String),
    Add(String),
    Remove(String),
}

/// A hunk in a unified diff
#[derive(Debug, Clone, PartialEq)]
pub struct DiffHunk {
    pub old_start: usize,
    pub old_count: usize,
    pub new_start: usize,
    pub new_count: usize,
    pub lines: Vec<DiffLine>,
}

impl DiffHunk {
    /// Lines the hunk expects to find in the original (context + removed)
    fn old_lines(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter_map(|l| match l {
                DiffLine::Context(s) | DiffLine::Remove(s) => Some(s.as_str()),
                DiffLine::Add(_) => None,
            })
            .collect()
    }

    /// Lines the hunk leaves behind (context + added)
    fn new_lines(&self) -> Vec<String> {
        self.lines
            .iter()
            .filter_map(|l| match l {
                DiffLine::Context(s) | DiffLine::Add(s) => Some(s.clone()),
                DiffLine::Remove(_) => None,
            })
            .collect()
    }

    /// Get a summary of changes in this hunk
    pub fn summary(&self) -> (usize, usize) {
        let adds = self.lines.iter().filter(|l| matches!(l, DiffLine::Add(_))).count();
        let removes = self.lines.iter().filter(|l| matches!(l, DiffLine::Remove(_))).count();
        (adds, removes)
    }
}

/// The hunks for one file
#[derive(Debug, Clone, PartialEq)]
pub struct FilePatch {
    pub old_path: String,
    pub new_path: String,
    pub hunks: Vec<DiffHunk>,
}

impl FilePatch {
    /// Path the patch should be written to. Falls back to the old path when
    /// the new side is `/dev/null`.
    pub fn target_path(&self) -> &str {
        if self.new_path == "/dev/null" {
            &self.old_path
        } else {
            &self.new_path
        }
    }

    pub fn is_creation(&self) -> bool {
        self.old_path == "/dev/null"
    }

    /// Get total additions and deletions
    pub fn stats(&self) -> (usize, usize) {
        self.hunks.iter().fold((0, 0), |acc, h| {
            let (a, r) = h.summary();
            (acc.0 + a, acc.1 + r)
        })
    }
}

/// Every file patch found in a diff text, in order of appearance
#[derive(Debug, Clone, PartialEq)]
pub struct PatchSet {
    pub files: Vec<FilePatch>,
}

impl PatchSet {
    /// Parse diff text. Files without any hunk are dropped; zero remaining
    /// files is an error.
    pub fn parse(diff: &str) -> FixResult<Self> {
        let lines: Vec<&str> = diff.lines().collect();
        let mut files = Vec::new();
        let mut i = 0;

        while i < lines.len() {
            if is_file_header(&lines, i) {
                let old_path = header_path(lines[i], "--- ", "a/");
                let new_path = header_path(lines[i + 1], "+++ ", "b/");
                i += 2;

                let mut hunks = Vec::new();
                while i < lines.len() && !is_file_header(&lines, i) {
                    if lines[i].starts_with("@@") {
                        hunks.push(parse_hunk(&lines, &mut i)?);
                    } else {
                        i += 1;
                    }
                }

                if hunks.is_empty() {
                    continue;
                }
                files.push(FilePatch {
                    old_path,
                    new_path,
                    hunks,
                });
            } else {
                i += 1;
            }
        }

        if files.is_empty() {
            return Err(FixError::PatchParse("no file patches found in diff".to_string()));
        }

        Ok(Self { files })
    }
}

/// True when `text` looks like it carries a diff header.
pub fn has_diff_header(text: &str) -> bool {
    let lines: Vec<&str> = text.lines().collect();
    (0..lines.len()).any(|i| is_file_header(&lines, i))
        || lines.iter().any(|l| l.starts_with("@@ "))
}

fn is_file_header(lines: &[&str], i: usize) -> bool {
    lines[i].starts_with("--- ") && lines.get(i + 1).is_some_and(|next| next.starts_with("+++ "))
}

fn header_path(line: &str, marker: &str, side_prefix: &str) -> String {
    let raw = line.strip_prefix(marker).unwrap_or(line);
    // Handle timestamp suffix
    let raw = raw.split('\t').next().unwrap_or(raw).trim();
    raw.strip_prefix(side_prefix).unwrap_or(raw).to_string()
}

/// Parse a single hunk from the diff
fn parse_hunk(lines: &[&str], idx: &mut usize) -> FixResult<DiffHunk> {
    let header = lines[*idx];

    // Parse @@ -old_start,old_count +new_start,new_count @@
    let parts: Vec<&str> = header.split_whitespace().collect();
    if parts.len() < 3 || parts[0] != "@@" || !parts[1].starts_with('-') || !parts[2].starts_with('+')
    {
        return Err(FixError::PatchParse(format!("Invalid hunk header: {}", header)));
    }

    let (old_start, old_count) = parse_range(&parts[1][1..])?;
    let (new_start, new_count) = parse_range(&parts[2][1..])?;

    *idx += 1;
    let mut diff_lines = Vec::new();

    while *idx < lines.len() {
        let line = lines[*idx];

        // Stop at next hunk, next file, or a git extended header
        if line.starts_with("@@") || line.starts_with("diff ") || is_file_header(lines, *idx) {
            break;
        }

        if let Some(rest) = line.strip_prefix('+') {
            diff_lines.push(DiffLine::Add(rest.to_string()));
        } else if let Some(rest) = line.strip_prefix('-') {
            diff_lines.push(DiffLine::Remove(rest.to_string()));
        } else if let Some(rest) = line.strip_prefix(' ') {
            diff_lines.push(DiffLine::Context(rest.to_string()));
        } else if line.is_empty() {
            diff_lines.push(DiffLine::Context(String::new()));
        } else if line.starts_with('\\') {
            // "\ No newline at end of file"
        } else {
            // Prose after the diff (common in model output)
            break;
        }

        *idx += 1;
    }

    // Blank lines trailing the diff text are not part of the hunk when the
    // header says the old side is already complete.
    let mut hunk = DiffHunk {
        old_start,
        old_count,
        new_start,
        new_count,
        lines: diff_lines,
    };
    while hunk.old_lines().len() > old_count
        && matches!(hunk.lines.last(), Some(DiffLine::Context(s)) if s.is_empty())
    {
        hunk.lines.pop();
    }

    Ok(hunk)
}

/// Parse a range like "10,5" or "10" into (start, count)
fn parse_range(s: &str) -> FixResult<(usize, usize)> {
    let invalid = || FixError::PatchParse(format!("Invalid range: {}", s));
    if let Some((start, count)) = s.split_once(',') {
        let start: usize = start.parse().map_err(|_| invalid())?;
        let count: usize = count.parse().map_err(|_| invalid())?;
        Ok((start, count))
    } else {
        let start: usize = s.parse().map_err(|_| invalid())?;
        Ok((start, 1))
    }
}

/// Apply one file's hunks to its original content.
///
/// Context and removed lines must match the original (trailing whitespace
/// ignored). A hunk that drifted is located by searching outward from its
/// stated start line.
pub fn apply_file_patch(original: &str, patch: &FilePatch) -> Result<String, String> {
    let mut lines: Vec<String> = original.lines().map(|s| s.to_string()).collect();

    let mut order: Vec<(usize, &DiffHunk)> = patch.hunks.iter().enumerate().collect();
    order.sort_by(|a, b| b.1.old_start.cmp(&a.1.old_start));

    // Apply hunks bottom-up so line numbers of earlier hunks don't shift
    for (n, hunk) in order {
        let old = hunk.old_lines();
        let expected = hunk.old_start.saturating_sub(1);
        let start = locate(&lines, &old, expected)
            .ok_or_else(|| format!("hunk {} does not match the file", n + 1))?;
        lines.splice(start..start + old.len(), hunk.new_lines());
    }

    let eol = line_ending(original);
    let mut patched = lines.join(eol);
    if original.ends_with('\n') && !patched.is_empty() {
        patched.push_str(eol);
    }
    Ok(patched)
}

fn locate(lines: &[String], old: &[&str], expected: usize) -> Option<usize> {
    if old.is_empty() {
        return Some(expected.min(lines.len()));
    }
    if old.len() > lines.len() {
        return None;
    }

    let last_start = lines.len() - old.len();
    let matches_at = |start: usize| {
        old.iter()
            .zip(&lines[start..start + old.len()])
            .all(|(want, have)| want.trim_end() == have.trim_end())
    };

    let expected = expected.min(last_start);
    (0..=HUNK_SEARCH_WINDOW).find_map(|offset| {
        let below = expected + offset;
        if below <= last_start && matches_at(below) {
            return Some(below);
        }
        let above = expected.checked_sub(offset)?;
        matches_at(above).then_some(above)
    })
}

/// Pull diff text out of a model reply that may wrap it in markdown fences
/// or surround it with prose.
pub fn extract_diff_block(text: &str) -> &str {
    let mut rest = text;
    while let Some(open) = rest.find("```") {
        let after_fence = &rest[open + 3..];
        let body_start = after_fence.find('\n').map(|i| i + 1).unwrap_or(after_fence.len());
        let body = &after_fence[body_start..];
        let Some(close) = body.find("```") else {
            break;
        };
        let block = &body[..close];
        if has_diff_header(block) {
            return block;
        }
        rest = &body[close + 3..];
    }
    text.trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_diff() {
        let diff = r#"--- a/src/example.py
+++ b/src/example.py
@@ -1,4 +1,5 @@
 def hello():
-    print("old")
+    print("new")
+    print("extra")
     return True

"#;
        let parsed = PatchSet::parse(diff).unwrap();
        assert_eq!(parsed.files.len(), 1);
        assert_eq!(parsed.files[0].old_path, "src/example.py");
        assert_eq!(parsed.files[0].hunks.len(), 1);
        assert_eq!(parsed.files[0].stats(), (2, 1));
    }

    #[test]
    fn test_parse_multi_file_diff() {
        let diff = "\
diff --git a/a.py b/a.py
--- a/a.py
+++ b/a.py
@@ -1 +1 @@
-x = 1
+x = 2
diff --git a/b.py b/b.py
--- a/b.py
+++ b/b.py
@@ -2,2 +2,2 @@
 y = 1
-z = 1
+z = 3
";
        let parsed = PatchSet::parse(diff).unwrap();
        assert_eq!(parsed.files.len(), 2);
        assert_eq!(parsed.files[0].target_path(), "a.py");
        assert_eq!(parsed.files[1].target_path(), "b.py");
        assert_eq!(parsed.files[1].hunks[0].old_start, 2);
    }

    #[test]
    fn test_parse_without_files_fails() {
        assert!(matches!(
            PatchSet::parse("I could not find a fix, sorry."),
            Err(FixError::PatchParse(_))
        ));
        assert!(PatchSet::parse("--- a/x.py\n+++ b/x.py\n").is_err());
    }

    #[test]
    fn test_apply_diff_preserves_trailing_newline() {
        let original = "def hello():\n    print(\"old\")\n    return True\n";
        let diff = r#"--- a/test.py
+++ b/test.py
@@ -1,3 +1,4 @@
 def hello():
-    print("old")
+    print("new")
+    print("extra")
     return True
"#;
        let parsed = PatchSet::parse(diff).unwrap();
        let result = apply_file_patch(original, &parsed.files[0]).unwrap();
        assert_eq!(
            result,
            "def hello():\n    print(\"new\")\n    print(\"extra\")\n    return True\n"
        );
    }

    #[test]
    fn test_apply_finds_drifted_hunk() {
        let original = "a\nb\nc\nd\ne\n";
        let diff = "--- a/f\n+++ b/f\n@@ -1,2 +1,2 @@\n d\n-e\n+E\n";
        let parsed = PatchSet::parse(diff).unwrap();
        assert_eq!(apply_file_patch(original, &parsed.files[0]).unwrap(), "a\nb\nc\nd\nE\n");
    }

    #[test]
    fn test_apply_rejects_mismatched_context() {
        let original = "a\nb\n";
        let diff = "--- a/f\n+++ b/f\n@@ -1,2 +1,2 @@\n x\n-y\n+z\n";
        let parsed = PatchSet::parse(diff).unwrap();
        let err = apply_file_patch(original, &parsed.files[0]).unwrap_err();
        assert!(err.contains("hunk 1"));
    }

    #[test]
    fn test_apply_multiple_hunks_bottom_up() {
        let original = "one\ntwo\nthree\nfour\nfive\n";
        let diff = "\
--- a/f
+++ b/f
@@ -1,2 +1,3 @@
 one
+one-and-a-half
 two
@@ -4,2 +5,2 @@
 four
-five
+FIVE
";
        let parsed = PatchSet::parse(diff).unwrap();
        assert_eq!(
            apply_file_patch(original, &parsed.files[0]).unwrap(),
            "one\none-and-a-half\ntwo\nthree\nfour\nFIVE\n"
        );
    }

    #[test]
    fn test_extract_diff_block_from_fenced_reply() {
        let reply = "Here is the fix:\n\n```diff\n--- a/x.py\n+++ b/x.py\n@@ -1 +1 @@\n-a\n+b\n```\nHope it helps.";
        let block = extract_diff_block(reply);
        assert!(block.starts_with("--- a/x.py"));
        assert!(!block.contains("```"));
        assert_eq!(PatchSet::parse(block).unwrap().files.len(), 1);
    }

    #[test]
    fn test_extract_diff_block_skips_non_diff_fences() {
        let reply = "```python\nprint(1)\n```\n```\n--- a/x.py\n+++ b/x.py\n@@ -1 +1 @@\n-a\n+b\n```";
        assert!(extract_diff_block(reply).starts_with("--- a/x.py"));
        assert_eq!(extract_diff_block("  plain  "), "plain");
    }

    #[test]
    fn test_has_diff_header() {
        assert!(has_diff_header("--- a/x\n+++ b/x\n"));
        assert!(has_diff_header("@@ -1 +1 @@\n-a\n+b"));
        assert!(!has_diff_header("def foo():\n    pass"));
    }
}
