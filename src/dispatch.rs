//! Per-failure fix dispatch
//!
//! Each failure goes through three tiers in order, stopping at the first
//! that succeeds:
//!
//! 1. pattern: the single error class the text belongs to, if any
//! 2. learned: the first stored error key contained in the error text
//! 3. AI: a diff generated from the chunked file
//!
//! A tier that fails (or does not apply) hands over to the next one. Only
//! unrecoverable errors (a backup that could not be restored) escape.

use crate::ai::{chunk_source, AiBackend, PatchRequest};
use crate::diff::extract_diff_block;
use crate::error::{FixError, FixResult};
use crate::failure::FailureRecord;
use crate::learning::LearningStore;
use crate::matchers::{classify, MatchOutcome};
use crate::patch::{read_text, FixPayload, PatchApplier, AI_SENTINEL};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const DEFAULT_CHUNK_LINES: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Pattern,
    Learned,
    Ai,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Tier::Pattern => "pattern",
            Tier::Learned => "learned",
            Tier::Ai => "ai",
        })
    }
}

/// Result of dispatching one failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub fixed_by: Option<Tier>,
    /// Files written by the winning tier
    pub files: Vec<PathBuf>,
}

impl DispatchReport {
    pub fn fixed(&self) -> bool {
        self.fixed_by.is_some()
    }

    fn unfixed() -> Self {
        Self {
            fixed_by: None,
            files: Vec::new(),
        }
    }
}

pub struct FixDispatcher {
    project_root: PathBuf,
    test_root: PathBuf,
    applier: PatchApplier,
    store: LearningStore,
    ai: Option<Box<dyn AiBackend>>,
    chunk_lines: usize,
}

impl FixDispatcher {
    pub fn new(
        project_root: impl Into<PathBuf>,
        test_root: impl Into<PathBuf>,
        store: LearningStore,
        ai: Option<Box<dyn AiBackend>>,
    ) -> Self {
        let project_root = project_root.into();
        Self {
            applier: PatchApplier::new(&project_root),
            project_root,
            test_root: test_root.into(),
            store,
            ai,
            chunk_lines: DEFAULT_CHUNK_LINES,
        }
    }

    pub fn with_chunk_lines(mut self, chunk_lines: usize) -> Self {
        self.chunk_lines = chunk_lines.max(1);
        self
    }

    pub fn store(&self) -> &LearningStore {
        &self.store
    }

    /// Try every tier on `failure` until one fixes it.
    pub fn dispatch(&mut self, failure: &FailureRecord) -> FixResult<DispatchReport> {
        let path = self.test_root.join(&failure.file);
        debug!(file = %path.display(), test = %failure.test, error = %failure.error, "dispatching");

        for tier in [Tier::Pattern, Tier::Learned, Tier::Ai] {
            let attempt = match tier {
                Tier::Pattern => self.try_pattern(&path, &failure.error),
                Tier::Learned => self.try_learned(&path, &failure.error),
                Tier::Ai => self.try_ai(&path, &failure.error),
            };
            match attempt {
                Ok(Some(files)) => {
                    info!(%tier, file = %failure.file.display(), test = %failure.test, "fixed");
                    return Ok(DispatchReport {
                        fixed_by: Some(tier),
                        files,
                    });
                }
                Ok(None) => debug!(%tier, "tier does not apply"),
                Err(err) if err.is_unrecoverable() => return Err(err),
                Err(err) => warn!(%tier, file = %failure.file.display(), error = %err, "tier failed"),
            }
        }

        Ok(DispatchReport::unfixed())
    }

    fn try_pattern(&self, path: &Path, error: &str) -> FixResult<Option<Vec<PathBuf>>> {
        let Some(class) = classify(error) else {
            return Ok(None);
        };
        debug!(matcher = class.name(), "pattern matched");
        Ok(Some(match class.apply(path, error)? {
            MatchOutcome::Modified => vec![path.to_path_buf()],
            MatchOutcome::Unchanged => Vec::new(),
        }))
    }

    fn try_learned(&self, path: &Path, error: &str) -> FixResult<Option<Vec<PathBuf>>> {
        let Some(entry) = self.store.lookup(error) else {
            return Ok(None);
        };
        debug!(key = %entry.error, "learned fix found");
        let payload = FixPayload::resolve(&entry.payload)?;
        self.applier.apply(path, &payload).map(Some)
    }

    fn try_ai(&mut self, path: &Path, error: &str) -> FixResult<Option<Vec<PathBuf>>> {
        let Some(ai) = self.ai.as_ref() else {
            return Ok(None);
        };

        let content = read_text(path)?;
        let chunks = chunk_source(&content, self.chunk_lines);
        let display_path = path.strip_prefix(&self.project_root).unwrap_or(path);
        let request = PatchRequest {
            file: display_path,
            chunks: &chunks,
            error,
        };

        let response = ai.suggest_patch(&request)?;
        let diff_text = extract_diff_block(&response);
        if diff_text.is_empty() {
            return Err(FixError::Backend("empty response".to_string()));
        }
        let files = self.applier.apply(
            path,
            &FixPayload::UnifiedDiff {
                diff_text: diff_text.to_string(),
            },
        )?;

        if let Err(err) = self.store.store(error, AI_SENTINEL) {
            warn!(error = %err, "could not record AI fix in learning store");
        }
        Ok(Some(files))
    }
}
