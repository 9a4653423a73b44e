//! TOML configuration for sandpatch.
//!
//! Every section and field is optional; absent values fall back to the tool
//! crate's defaults. Conversion into runtime settings is explicit
//! ([`SandpatchConfig::to_tool_settings`]), so nothing here is global.

use std::path::{Path, PathBuf};
use std::{env, fs};

use sandpatch_tools::loop_guard::{
    DEFAULT_DENIED_ACTIONS, DEFAULT_MUTATION_ACTIONS, DEFAULT_READ_ACTIONS,
    DEFAULT_VERIFICATION_ACTIONS,
};
use sandpatch_tools::sandbox::{
    DEFAULT_SANDBOX_DIR, default_protected_patterns, default_sandbox_deny_patterns,
};
use sandpatch_tools::{
    LoopPolicy, ReadFileLimits, SandboxConfig, SearchLimits, ToolLimits, ToolSettings,
};
use sandpatch_types::{ActionClass, EditLimits};
use serde::Deserialize;

/// Environment variable overriding the config file location.
pub const CONFIG_ENV_VAR: &str = "SANDPATCH_CONFIG";

// Default value function for serde (bool::default() is false, so only true needs a fn)
const fn default_true() -> bool {
    true
}

#[derive(Debug, Default, Deserialize)]
pub struct SandpatchConfig {
    pub sandbox: Option<SandboxSection>,
    pub patch: Option<PatchSection>,
    pub read: Option<ReadSection>,
    pub search: Option<SearchSection>,
    pub loop_guard: Option<LoopGuardSection>,
    pub logging: Option<LoggingSection>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config at {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config at {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl ConfigError {
    pub fn path(&self) -> &PathBuf {
        match self {
            ConfigError::Read { path, .. } | ConfigError::Parse { path, .. } => path,
        }
    }
}

/// Sandbox placement and path policy.
///
/// ```toml
/// [sandbox]
/// base_dir = "${HOME}/work"
/// dir_name = "playground"
/// denied_patterns = ["**/*.sqlite3"]
/// include_default_denies = true
/// ```
#[derive(Debug, Deserialize)]
pub struct SandboxSection {
    /// Directory holding the sandbox directory. `${VAR}` references are expanded.
    pub base_dir: Option<String>,
    pub dir_name: Option<String>,
    #[serde(default = "default_true")]
    pub create_root: bool,
    #[serde(default)]
    pub denied_patterns: Vec<String>,
    #[serde(default = "default_true")]
    pub include_default_denies: bool,
    /// Replaces the default lockfile list when present.
    pub protected_patterns: Option<Vec<String>>,
}

impl Default for SandboxSection {
    fn default() -> Self {
        Self {
            base_dir: None,
            dir_name: None,
            create_root: true,
            denied_patterns: Vec::new(),
            include_default_denies: true,
            protected_patterns: None,
        }
    }
}

/// `apply_patch` limits.
#[derive(Debug, Default, Deserialize)]
pub struct PatchSection {
    pub max_edits: Option<usize>,
    pub max_replacement_bytes: Option<usize>,
}

/// `read_file` limits; also caps the files `search` will open.
#[derive(Debug, Default, Deserialize)]
pub struct ReadSection {
    pub max_file_read_bytes: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SearchSection {
    pub max_results: Option<usize>,
}

/// Repetition guard thresholds and action classes.
///
/// An action list, when present, replaces that class's defaults.
///
/// ```toml
/// [loop_guard]
/// default_threshold = 2
/// verification_actions = ["ruby_syntax_check", "cargo_check"]
/// ```
#[derive(Debug, Default, Deserialize)]
pub struct LoopGuardSection {
    pub history_capacity: Option<usize>,
    pub default_threshold: Option<usize>,
    pub read_threshold: Option<usize>,
    pub verification_threshold: Option<usize>,
    pub read_actions: Option<Vec<String>>,
    pub verification_actions: Option<Vec<String>>,
    pub mutation_actions: Option<Vec<String>>,
    pub denied_actions: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LoggingSection {
    /// `tracing_subscriber::EnvFilter` directive, e.g. `"sandpatch_tools=debug"`.
    pub filter: Option<String>,
}

/// Expand `${VAR}` references. Unset variables expand to nothing; an
/// unclosed `${` is kept literally.
pub fn expand_env_vars(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let var = &after[..end];
                if var.is_empty() {
                    out.push_str("${}");
                } else {
                    out.push_str(&env::var(var).unwrap_or_default());
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

impl SandpatchConfig {
    /// Load from the default location. A missing file is `Ok(None)`.
    pub fn load() -> Result<Option<Self>, ConfigError> {
        match config_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(None),
        }
    }

    /// Load from an explicit path. A missing file is `Ok(None)`.
    pub fn load_from(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No config file");
            return Ok(None);
        }

        let content = fs::read_to_string(path).map_err(|source| {
            tracing::warn!("Failed to read config at {:?}: {}", path, source);
            ConfigError::Read {
                path: path.to_path_buf(),
                source,
            }
        })?;

        Self::parse(&content)
            .map(Some)
            .map_err(|source| {
                tracing::warn!("Failed to parse config at {:?}: {}", path, source);
                ConfigError::Parse {
                    path: path.to_path_buf(),
                    source,
                }
            })
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    #[must_use]
    pub fn logging_filter(&self) -> Option<&str> {
        self.logging.as_ref().and_then(|l| l.filter.as_deref())
    }

    /// Sandbox construction parameters. `cwd` is the base directory unless
    /// `[sandbox] base_dir` names one; a relative `base_dir` is taken from `cwd`.
    #[must_use]
    pub fn sandbox_config(&self, cwd: &Path) -> SandboxConfig {
        let default_section = SandboxSection::default();
        let section = self.sandbox.as_ref().unwrap_or(&default_section);

        let base_dir = match section.base_dir.as_deref() {
            Some(raw) => cwd.join(expand_env_vars(raw)),
            None => cwd.to_path_buf(),
        };

        let mut denied_patterns = if section.include_default_denies {
            default_sandbox_deny_patterns()
        } else {
            Vec::new()
        };
        denied_patterns.extend(section.denied_patterns.iter().cloned());

        SandboxConfig {
            base_dir,
            dir_name: section
                .dir_name
                .clone()
                .unwrap_or_else(|| DEFAULT_SANDBOX_DIR.to_string()),
            create_root: section.create_root,
            denied_patterns,
            protected_patterns: section
                .protected_patterns
                .clone()
                .unwrap_or_else(default_protected_patterns),
        }
    }

    #[must_use]
    pub fn tool_limits(&self) -> ToolLimits {
        let mut limits = ToolLimits::default();
        if let Some(patch) = &self.patch {
            let defaults = EditLimits::default();
            limits.edits = EditLimits {
                max_edits: patch.max_edits.unwrap_or(defaults.max_edits),
                max_replacement_bytes: patch
                    .max_replacement_bytes
                    .unwrap_or(defaults.max_replacement_bytes),
            };
        }
        if let Some(max) = self.read.as_ref().and_then(|r| r.max_file_read_bytes) {
            limits.read = ReadFileLimits {
                max_file_read_bytes: max,
            };
        }
        if let Some(max) = self.search.as_ref().and_then(|s| s.max_results) {
            limits.search = SearchLimits { max_results: max };
        }
        limits
    }

    #[must_use]
    pub fn loop_policy(&self) -> LoopPolicy {
        let Some(section) = &self.loop_guard else {
            return LoopPolicy::default();
        };

        let mut policy = LoopPolicy::unclassified();
        if let Some(n) = section.history_capacity {
            policy.history_capacity = n;
        }
        if let Some(n) = section.default_threshold {
            policy.default_threshold = n;
        }
        if let Some(n) = section.read_threshold {
            policy.read_threshold = n;
        }
        if let Some(n) = section.verification_threshold {
            policy.verification_threshold = n;
        }

        let lists: [(ActionClass, Option<&[String]>, &[&str]); 4] = [
            (ActionClass::Read, section.read_actions.as_deref(), DEFAULT_READ_ACTIONS),
            (
                ActionClass::Verification,
                section.verification_actions.as_deref(),
                DEFAULT_VERIFICATION_ACTIONS,
            ),
            (
                ActionClass::Mutation,
                section.mutation_actions.as_deref(),
                DEFAULT_MUTATION_ACTIONS,
            ),
            // Denied last, so an action listed twice is denied.
            (ActionClass::Denied, section.denied_actions.as_deref(), DEFAULT_DENIED_ACTIONS),
        ];
        for (class, configured, defaults) in lists {
            match configured {
                Some(actions) => policy.set_classes(class, actions),
                None => policy.set_classes(class, defaults),
            }
        }
        policy
    }

    #[must_use]
    pub fn to_tool_settings(&self, cwd: &Path) -> ToolSettings {
        ToolSettings {
            sandbox: self.sandbox_config(cwd),
            limits: self.tool_limits(),
            loop_policy: self.loop_policy(),
        }
    }
}

/// `$SANDPATCH_CONFIG`, else `~/.sandpatch/config.toml`.
pub fn config_path() -> Option<PathBuf> {
    if let Some(path) = env::var_os(CONFIG_ENV_VAR).filter(|p| !p.is_empty()) {
        return Some(PathBuf::from(path));
    }
    dirs::home_dir().map(|home| home.join(".sandpatch").join("config.toml"))
}
