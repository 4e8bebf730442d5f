//! Fix payloads and the patch applier
//!
//! A payload describes a fix independent of where it came from. The applier
//! writes it to disk under a backup guard, so a failed apply leaves every
//! touched file as it was.

use crate::backup::{guarded, BackupGuard};
use crate::diff::{self, FilePatch, PatchSet};
use crate::error::{FixError, FixResult};
use crate::util::{line_ending, resolve_under_root};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Payload the AI tier records once its patch applied. It marks the error
/// as seen; it is not itself a replayable fix.
pub const AI_SENTINEL: &str = "AI patch applied";

/// A structured fix. Exactly one variant is active per payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum FixPayload {
    /// Insert literal lines after the given (1-based) line numbers
    #[serde(rename = "snippet")]
    SnippetInject { targets: Vec<(usize, String)> },
    /// A patch in unified diff form, covering one or more files
    #[serde(rename = "diff")]
    UnifiedDiff { diff_text: String },
    /// Rewrite the value of `key` in the target file
    #[serde(rename = "config")]
    ConfigUpdate { key: String, new_value: String },
    /// Append a definition verbatim to the end of the file
    #[serde(rename = "append")]
    RawAppend { code_text: String },
}

/// Which rule recognized a stored payload text
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PayloadShape {
    TaggedJson,
    DiffText,
    Definition,
}

/// Ordered predicate chain used to recognize stored payload text.
/// First match wins.
const SHAPE_RULES: &[(PayloadShape, fn(&str) -> bool)] = &[
    (PayloadShape::TaggedJson, is_tagged_json),
    (PayloadShape::DiffText, diff::has_diff_header),
    (PayloadShape::Definition, has_definition_keyword),
];

fn is_tagged_json(text: &str) -> bool {
    let trimmed = text.trim_start();
    if !trimmed.starts_with('{') {
        return false;
    }
    serde_json::from_str::<serde_json::Value>(trimmed)
        .ok()
        .and_then(|v| v.as_object().map(|o| o.contains_key("type")))
        .unwrap_or(false)
}

fn has_definition_keyword(text: &str) -> bool {
    text.contains("def ") || text.contains("class ")
}

impl FixPayload {
    /// Resolve free-form stored text into a payload variant.
    pub fn resolve(text: &str) -> FixResult<Self> {
        let shape = SHAPE_RULES
            .iter()
            .find(|(_, matches)| matches(text))
            .map(|(shape, _)| *shape)
            .ok_or(FixError::UnrecognizedPayload)?;

        match shape {
            PayloadShape::TaggedJson => serde_json::from_str(text.trim())
                .map_err(|e| FixError::PatchParse(format!("invalid payload JSON: {}", e))),
            PayloadShape::DiffText => Ok(FixPayload::UnifiedDiff {
                diff_text: text.to_string(),
            }),
            PayloadShape::Definition => Ok(FixPayload::RawAppend {
                code_text: text.to_string(),
            }),
        }
    }

    /// Serialized form for the learning store. Structured variants are
    /// stored as tagged JSON; diffs and definitions as their raw text, which
    /// `resolve` recognizes on the way back.
    pub fn to_stored(&self) -> String {
        match self {
            FixPayload::UnifiedDiff { diff_text } => diff_text.clone(),
            FixPayload::RawAppend { code_text } if has_definition_keyword(code_text) => {
                code_text.clone()
            }
            other => serde_json::to_string(other).unwrap_or_default(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            FixPayload::SnippetInject { .. } => "snippet",
            FixPayload::UnifiedDiff { .. } => "diff",
            FixPayload::ConfigUpdate { .. } => "config",
            FixPayload::RawAppend { .. } => "append",
        }
    }
}

/// Source text split into lines, remembering its line ending and whether
/// it ended in one
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SourceLines {
    pub lines: Vec<String>,
    eol: &'static str,
    trailing_newline: bool,
}

impl SourceLines {
    pub fn parse(content: &str) -> Self {
        Self {
            lines: content.lines().map(str::to_string).collect(),
            eol: line_ending(content),
            trailing_newline: content.ends_with('\n') || content.is_empty(),
        }
    }

    pub fn render(&self) -> String {
        let mut out = self.lines.join(self.eol);
        if self.trailing_newline && !out.is_empty() {
            out.push_str(self.eol);
        }
        out
    }

    pub fn read(path: &Path) -> FixResult<Self> {
        Ok(Self::parse(&read_text(path)?))
    }

    pub fn write(&self, path: &Path) -> FixResult<()> {
        write_text(path, &self.render())
    }
}

pub(crate) fn read_text(path: &Path) -> FixResult<String> {
    if !path.is_file() {
        return Err(FixError::FileNotFound(path.to_path_buf()));
    }
    fs::read_to_string(path).map_err(|e| FixError::io(path, e))
}

pub(crate) fn write_text(path: &Path, content: &str) -> FixResult<()> {
    fs::write(path, content).map_err(|e| FixError::io(path, e))
}

/// Applies payloads to files under the project root
#[derive(Debug, Clone)]
pub struct PatchApplier {
    project_root: PathBuf,
}

impl PatchApplier {
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
        }
    }

    /// Apply `payload` to `target`. Returns every file that was modified.
    pub fn apply(&self, target: &Path, payload: &FixPayload) -> FixResult<Vec<PathBuf>> {
        debug!(file = %target.display(), kind = payload.kind(), "applying payload");
        match payload {
            FixPayload::SnippetInject { targets } => {
                guarded(target, |path| inject_snippets(path, targets))?;
            }
            FixPayload::UnifiedDiff { diff_text } => {
                let set = PatchSet::parse(diff_text)?;
                return self.apply_patch_set(target, &set);
            }
            FixPayload::ConfigUpdate { key, new_value } => {
                guarded(target, |path| update_config_value(path, key, new_value))?;
            }
            FixPayload::RawAppend { code_text } => {
                guarded(target, |path| append_code(path, code_text))?;
            }
        }
        Ok(vec![target.to_path_buf()])
    }

    /// Apply every file patch, or none of them.
    fn apply_patch_set(&self, target: &Path, set: &PatchSet) -> FixResult<Vec<PathBuf>> {
        let mut guards: Vec<(BackupGuard, &FilePatch)> = Vec::with_capacity(set.files.len());
        for file_patch in &set.files {
            let path = self.resolve_patch_path(target, file_patch)?;
            if guards.iter().any(|(g, _)| g.target() == path) {
                return Err(FixError::PatchParse(format!(
                    "diff patches {} more than once",
                    path.display()
                )));
            }
            guards.push((BackupGuard::acquire(&path)?, file_patch));
        }

        let mut failure = None;
        for (guard, file_patch) in &guards {
            let original = guard.original_text();
            let result = diff::apply_file_patch(&original, file_patch)
                .map_err(|reason| FixError::apply(guard.target(), reason))
                .and_then(|patched| write_text(guard.target(), &patched));
            if let Err(err) = result {
                failure = Some(err);
                break;
            }
            let (added, removed) = file_patch.stats();
            debug!(file = %guard.target().display(), added, removed, "file patched");
        }

        if let Some(err) = failure {
            for (guard, _) in guards {
                guard.restore()?;
            }
            return Err(err);
        }

        let touched: Vec<PathBuf> = guards
            .into_iter()
            .map(|(guard, _)| {
                let path = guard.target().to_path_buf();
                guard.commit();
                path
            })
            .collect();
        info!(files = touched.len(), "diff applied");
        Ok(touched)
    }

    /// Map a path named in a diff onto disk. The path must stay inside the
    /// project root. Model-written diffs often name the file loosely, so a
    /// path that matches the target's tail (or just its file name) is taken
    /// to mean the target.
    fn resolve_patch_path(&self, target: &Path, file_patch: &FilePatch) -> FixResult<PathBuf> {
        if file_patch.is_creation() {
            return Err(FixError::apply(
                file_patch.target_path(),
                "creating new files is not supported",
            ));
        }

        let named = Path::new(file_patch.target_path());
        let in_root = resolve_under_root(&self.project_root, named)
            .map_err(|reason| FixError::apply(named, reason))?;
        if in_root.is_file() {
            return Ok(in_root);
        }
        if target.ends_with(named) || named.file_name().is_some_and(|n| Some(n) == target.file_name())
        {
            return Ok(target.to_path_buf());
        }
        Err(FixError::FileNotFound(in_root))
    }
}

fn inject_snippets(path: &Path, targets: &[(usize, String)]) -> FixResult<()> {
    let mut source = SourceLines::read(path)?;
    for (line_no, text) in targets {
        if *line_no <= source.lines.len() {
            source.lines.insert(*line_no, text.clone());
        } else {
            debug!(line = line_no, "snippet target out of range, skipped");
        }
    }
    source.write(path)
}

fn update_config_value(path: &Path, key: &str, new_value: &str) -> FixResult<()> {
    let mut source = SourceLines::read(path)?;
    let line = source.lines.iter_mut().find_map(|line| {
        let sep_end = config_separator(line.as_str(), key)?;
        Some((line, sep_end))
    });

    let Some((line, sep_end)) = line else {
        return Err(FixError::apply(path, format!("key '{}' not found", key)));
    };
    *line = format!("{} {}", &line[..sep_end], new_value);
    source.write(path)
}

/// Byte offset just past the `=`/`:` that follows `key` at the start of the
/// line, if the line assigns `key`.
fn config_separator(line: &str, key: &str) -> Option<usize> {
    let indent = line.len() - line.trim_start().len();
    let rest = line[indent..].strip_prefix(key)?;
    let gap = rest.len() - rest.trim_start().len();
    let after_gap = &rest[gap..];
    let is_assignment = (after_gap.starts_with('=') && !after_gap.starts_with("=="))
        || after_gap.starts_with(':');
    is_assignment.then(|| indent + key.len() + gap + 1)
}

fn append_code(path: &Path, code_text: &str) -> FixResult<()> {
    let mut content = read_text(path)?;
    let eol = line_ending(&content);
    if !content.is_empty() && !content.ends_with('\n') {
        content.push_str(eol);
    }
    content.push_str(eol);
    content.push_str(&code_text.lines().collect::<Vec<_>>().join(eol));
    if !content.ends_with('\n') {
        content.push_str(eol);
    }
    write_text(path, &content)
}
