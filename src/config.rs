//! Configuration management for nightmend
//!
//! Settings live in `<project>/.nightmend/config.json`, a file passed with
//! `--config`, or `nightmend/config.json` under the user config directory.
//! Environment variables override the file; command-line flags override
//! both.

use crate::ai::DEFAULT_MODEL;
use crate::dispatch::DEFAULT_CHUNK_LINES;
use crate::orchestrator::{DEFAULT_COMMIT_MESSAGE, DEFAULT_MAX_RETRIES};
use crate::runner::DEFAULT_TEST_COMMAND;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const CONFIG_DIR: &str = ".nightmend";
const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Repository root; diff paths are resolved against it
    pub project_root: PathBuf,
    /// Directory failing test paths are relative to (relative to the project root)
    pub test_root: PathBuf,
    /// Learned fixes file (relative to the project root)
    pub learning_store: PathBuf,
    pub max_retries: u32,
    pub interval_minutes: u64,
    pub test_command: String,
    pub test_timeout_secs: u64,
    /// Lines per chunk sent to the AI backend
    pub chunk_lines: usize,
    pub ai_enabled: bool,
    pub ai_model: String,
    /// Commit and push after a successful cycle that changed files
    pub publish: bool,
    pub commit_message: String,
    /// Default log filter when `RUST_LOG` is unset
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            project_root: PathBuf::from("."),
            test_root: PathBuf::from("."),
            learning_store: PathBuf::from(CONFIG_DIR).join("learned_fixes.json"),
            max_retries: DEFAULT_MAX_RETRIES,
            interval_minutes: 60,
            test_command: DEFAULT_TEST_COMMAND.to_string(),
            test_timeout_secs: 30 * 60,
            chunk_lines: DEFAULT_CHUNK_LINES,
            ai_enabled: true,
            ai_model: DEFAULT_MODEL.to_string(),
            publish: true,
            commit_message: DEFAULT_COMMIT_MESSAGE.to_string(),
            log_level: "debug".to_string(),
        }
    }
}

impl Config {
    /// Default location inside a project
    pub fn project_config_path(project_root: &Path) -> PathBuf {
        project_root.join(CONFIG_DIR).join(CONFIG_FILE)
    }

    /// User-wide fallback, `~/.config/nightmend/config.json` on Linux
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("nightmend").join(CONFIG_FILE))
    }

    /// Load from `explicit` (which must exist), else the project's config
    /// file, else the user-wide one, else defaults. A corrupt file is moved
    /// aside.
    pub fn load(explicit: Option<&Path>, project_root: &Path) -> Result<Self> {
        let (path, required) = match explicit {
            Some(path) => (path.to_path_buf(), true),
            None => {
                let project = Self::project_config_path(project_root);
                match Self::user_config_path() {
                    Some(user) if !project.exists() && user.exists() => (user, false),
                    _ => (project, false),
                }
            }
        };

        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(err) if !required && err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::for_project(project_root));
            }
            Err(err) => {
                return Err(err).with_context(|| format!("Failed to read config {}", path.display()))
            }
        };

        let mut config = match serde_json::from_str::<Config>(&content) {
            Ok(config) => config,
            Err(err) => {
                let preserved = preserve_corrupt_config(&path, &content);
                // Runs before the log subscriber exists.
                eprintln!(
                    "  Warning: Config file {} was corrupted ({}). It was saved to {} and defaults were loaded.",
                    path.display(),
                    err,
                    preserved.display()
                );
                return Ok(Self::for_project(project_root));
            }
        };

        // A project_root inside the file is relative to the project it was found in.
        if config.project_root == Path::new(".") {
            config.project_root = project_root.to_path_buf();
        } else if config.project_root.is_relative() {
            config.project_root = project_root.join(&config.project_root);
        }
        Ok(config)
    }

    fn for_project(project_root: &Path) -> Self {
        Self {
            project_root: project_root.to_path_buf(),
            ..Self::default()
        }
    }

    /// Apply `NIGHTMEND_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    pub(crate) fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(value) = var("NIGHTMEND_MAX_RETRIES") {
            self.max_retries = value
                .trim()
                .parse()
                .with_context(|| format!("NIGHTMEND_MAX_RETRIES is not a number: {}", value))?;
        }
        if let Some(value) = var("NIGHTMEND_TEST_ROOT") {
            self.test_root = PathBuf::from(value);
        }
        if let Some(value) = var("NIGHTMEND_TEST_COMMAND") {
            self.test_command = value;
        }
        if let Some(value) = var("NIGHTMEND_MODEL") {
            self.ai_model = value;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_retries == 0 {
            bail!("max_retries must be at least 1");
        }
        if self.chunk_lines == 0 {
            bail!("chunk_lines must be at least 1");
        }
        if self.interval_minutes == 0 {
            bail!("interval_minutes must be at least 1");
        }
        if self.test_command.trim().is_empty() {
            bail!("test_command is empty");
        }
        Ok(())
    }

    /// `path` joined onto the project root unless already absolute
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_root.join(path)
        }
    }

    pub fn test_root_path(&self) -> PathBuf {
        self.resolve(&self.test_root)
    }

    pub fn learning_store_path(&self) -> PathBuf {
        self.resolve(&self.learning_store)
    }

    /// Write this config to the project's config file.
    pub fn save_to_project(&self) -> Result<PathBuf> {
        let path = Self::project_config_path(&self.project_root);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        let mut on_disk = self.clone();
        on_disk.project_root = PathBuf::from(".");
        let content = serde_json::to_string_pretty(&on_disk).context("Failed to serialize config")?;
        write_config_atomic(&path, &content)?;
        Ok(path)
    }
}

/// API key for the AI backend, from the environment
pub fn api_key() -> Option<String> {
    ["NIGHTMEND_API_KEY", "OPENROUTER_API_KEY"]
        .iter()
        .find_map(|name| std::env::var(name).ok().filter(|v| !v.trim().is_empty()))
}

fn preserve_corrupt_config(path: &Path, content: &str) -> PathBuf {
    let corrupt_path = path.with_extension("json.corrupt");
    if fs::rename(path, &corrupt_path).is_err() {
        let _ = fs::write(&corrupt_path, content);
    }
    corrupt_path
}

fn write_config_atomic(path: &Path, content: &str) -> Result<()> {
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, content)
        .with_context(|| format!("Failed to write {}", tmp_path.display()))?;
    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err).with_context(|| format!("Failed to replace {}", path.display()));
    }
    Ok(())
}
