//! Configuration stored under `.forgeloop/config.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};

use crate::core::types::{Step, StepKind};
use crate::io::store::write_atomic;

/// Engine configuration (TOML).
///
/// Intended to be edited by humans. Missing fields fall back to defaults, and
/// a missing file is the same as an empty one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Program name used when printing resume instructions.
    pub cli_name: String,
    pub base_branch: String,
    pub remote: String,
    /// Tracing log file, relative to `.forgeloop/`.
    pub log_file: PathBuf,
    /// Launch a browser for CI URLs instead of only printing them.
    pub open_urls: bool,
    pub ai: AiConfig,
    pub validation: ValidationConfig,
    pub ci: CiConfig,
    pub notify: NotifyConfig,
    pub templates: BTreeMap<String, TemplateConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AiConfig {
    /// Agent command; the prompt is fed on stdin.
    pub command: Vec<String>,
    pub timeout_secs: u64,
    /// Truncate agent stdout/stderr logs beyond this many bytes.
    pub output_limit_bytes: usize,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            command: vec![
                "codex".to_string(),
                "exec".to_string(),
                "--sandbox".to_string(),
                "workspace-write".to_string(),
                "-".to_string(),
            ],
            timeout_secs: 30 * 60,
            output_limit_bytes: 100_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ValidationConfig {
    /// Shell snippets run in the worktree; every one must exit 0.
    pub commands: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            commands: vec!["just ci".to_string()],
            timeout_secs: 10 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CiConfig {
    pub poll_interval_secs: u64,
    pub timeout_secs: u64,
}

impl Default for CiConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
            timeout_secs: 45 * 60,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NotifyConfig {
    /// Optional hook; receives the event as JSON on stdin.
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TemplateConfig {
    pub steps: Vec<String>,
    /// Stop in `awaiting_approval` after the last step.
    pub require_approval: bool,
}

impl TemplateConfig {
    fn new(steps: &[StepKind]) -> Self {
        Self {
            steps: steps
                .iter()
                .filter_map(|kind| kind.name())
                .map(str::to_string)
                .collect(),
            require_approval: false,
        }
    }

    pub fn build_steps(&self) -> Vec<Step> {
        self.steps.iter().map(Step::new).collect()
    }
}

fn default_templates() -> BTreeMap<String, TemplateConfig> {
    let full = [
        StepKind::Implement,
        StepKind::Validate,
        StepKind::Commit,
        StepKind::Push,
        StepKind::Pr,
        StepKind::CiWait,
    ];
    let mut templates = BTreeMap::new();
    templates.insert("feature".to_string(), TemplateConfig::new(&full));
    templates.insert("fix".to_string(), TemplateConfig::new(&full));
    templates.insert(
        "commit".to_string(),
        TemplateConfig::new(&[StepKind::Implement, StepKind::Validate, StepKind::Commit]),
    );
    templates
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cli_name: "forgeloop".to_string(),
            base_branch: "main".to_string(),
            remote: "origin".to_string(),
            log_file: PathBuf::from("logs/forgeloop.log"),
            open_urls: false,
            ai: AiConfig::default(),
            validation: ValidationConfig::default(),
            ci: CiConfig::default(),
            notify: NotifyConfig::default(),
            templates: default_templates(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.cli_name.trim().is_empty() {
            return Err(anyhow!("cli_name must not be empty"));
        }
        if self.base_branch.trim().is_empty() {
            return Err(anyhow!("base_branch must not be empty"));
        }
        if self.remote.trim().is_empty() {
            return Err(anyhow!("remote must not be empty"));
        }
        if self.ai.command.is_empty() || self.ai.command[0].trim().is_empty() {
            return Err(anyhow!("ai.command must be a non-empty array"));
        }
        if self.ai.timeout_secs == 0 {
            return Err(anyhow!("ai.timeout_secs must be > 0"));
        }
        if self.ai.output_limit_bytes == 0 {
            return Err(anyhow!("ai.output_limit_bytes must be > 0"));
        }
        if self.validation.timeout_secs == 0 {
            return Err(anyhow!("validation.timeout_secs must be > 0"));
        }
        if self.ci.poll_interval_secs == 0 || self.ci.timeout_secs == 0 {
            return Err(anyhow!("ci.poll_interval_secs and ci.timeout_secs must be > 0"));
        }
        if self.templates.is_empty() {
            return Err(anyhow!("at least one template must be configured"));
        }
        for (id, template) in &self.templates {
            if template.steps.is_empty() {
                bail!("template '{id}' has no steps");
            }
        }
        Ok(())
    }

    pub fn template(&self, id: &str) -> Result<&TemplateConfig> {
        self.templates.get(id).with_context(|| {
            let known: Vec<&str> = self.templates.keys().map(String::as_str).collect();
            format!("unknown template '{id}' (known: {})", known.join(", "))
        })
    }

    pub fn ai_timeout(&self) -> Duration {
        Duration::from_secs(self.ai.timeout_secs)
    }

    pub fn validation_timeout(&self) -> Duration {
        Duration::from_secs(self.validation.timeout_secs)
    }

    pub fn ci_poll_interval(&self) -> Duration {
        Duration::from_secs(self.ci.poll_interval_secs)
    }

    pub fn ci_timeout(&self) -> Duration {
        Duration::from_secs(self.ci.timeout_secs)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `Config::default()`.
pub fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        let cfg = Config::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: Config =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &Config) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, buf.as_bytes())
}
