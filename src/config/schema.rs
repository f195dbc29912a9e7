use crate::error::ConfigError;
use anyhow::{Context, Result};
use directories::UserDirs;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

// ── Top-level config ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Path to config.toml - computed at load time, not serialized
    #[serde(skip)]
    pub config_path: PathBuf,
    /// Default log level when no verbosity flag is given
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Where `RunState` is persisted (default: next to config.toml)
    #[serde(default)]
    pub state_path: Option<PathBuf>,

    #[serde(default)]
    pub scanner: ScannerConfig,

    #[serde(default)]
    pub policy: PolicyConfig,

    #[serde(default)]
    pub registry: RegistryConfig,

    #[serde(default)]
    pub git: GitConfig,

    #[serde(default)]
    pub host: HostConfig,

    #[serde(default)]
    pub run: RunConfig,

    #[serde(default)]
    pub watch: WatchConfig,

    #[serde(default)]
    pub webhook: WebhookConfig,
}

fn default_log_level() -> String {
    "info".into()
}

fn default_true() -> bool {
    true
}

// ── Scanner ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    /// Repository root to scan (default: current directory)
    #[serde(default = "default_scan_root")]
    pub root: PathBuf,
    #[serde(default = "default_dockerfile_glob_patterns")]
    pub dockerfile_glob_patterns: Vec<String>,
    /// Globs on the root-relative path of files to leave alone
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
    /// Image names never queried or updated
    #[serde(default)]
    pub ignore_images: Vec<String>,
}

fn default_scan_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_dockerfile_glob_patterns() -> Vec<String> {
    vec!["Dockerfile*".into(), "*.dockerfile".into()]
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            root: default_scan_root(),
            dockerfile_glob_patterns: default_dockerfile_glob_patterns(),
            exclude_patterns: Vec::new(),
            ignore_images: Vec::new(),
        }
    }
}

// ── Version policy ────────────────────────────────────────────────

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SortRule {
    #[default]
    Semver,
    Lexical,
    Date,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Regex every eligible tag must match
    #[serde(default = "default_tag_pattern")]
    pub tag_pattern: String,
    #[serde(default)]
    pub sort_rule: SortRule,
    /// old_tag -> new_tag pins that bypass sorting
    #[serde(default)]
    pub explicit_mappings: BTreeMap<String, String>,
    /// Leave references pinned to `latest` alone
    #[serde(default = "default_true")]
    pub skip_latest: bool,
    /// Per-image overrides; unset fields inherit the values above
    #[serde(default)]
    pub images: Vec<ImagePolicyConfig>,
}

fn default_tag_pattern() -> String {
    r"^v?\d+(\.\d+){0,2}$".into()
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            tag_pattern: default_tag_pattern(),
            sort_rule: SortRule::default(),
            explicit_mappings: BTreeMap::new(),
            skip_latest: true,
            images: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImagePolicyConfig {
    pub image: String,
    #[serde(default)]
    pub tag_pattern: Option<String>,
    #[serde(default)]
    pub sort_rule: Option<SortRule>,
    #[serde(default)]
    pub explicit_mappings: Option<BTreeMap<String, String>>,
}

// ── Registry ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum RegistryFlavor {
    /// Docker Hub `/v2/repositories/<ns>/<repo>/tags` listing
    #[default]
    Hub,
    /// Docker Registry v2 `/v2/<name>/tags/list`
    Distribution,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_registry_url")]
    pub base_url: String,
    #[serde(default)]
    pub flavor: RegistryFlavor,
    /// Bearer token for private registries
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_rate_limit_per_minute")]
    pub rate_limit_per_minute: u32,
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Images queried in parallel
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_registry_url() -> String {
    "https://registry.hub.docker.com".into()
}

fn default_rate_limit_per_minute() -> u32 {
    60
}

fn default_max_pages() -> u32 {
    10
}

fn default_page_size() -> u32 {
    100
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_concurrency() -> usize {
    4
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            base_url: default_registry_url(),
            flavor: RegistryFlavor::default(),
            token: None,
            rate_limit_per_minute: default_rate_limit_per_minute(),
            max_pages: default_max_pages(),
            page_size: default_page_size(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            concurrency: default_concurrency(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

// ── Git ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitConfig {
    #[serde(default = "default_remote")]
    pub remote: String,
    #[serde(default = "default_base_branch")]
    pub base_branch: String,
    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,
    /// `git push -o` options; GitLab honours `ci.skip`
    #[serde(default = "default_push_options")]
    pub push_options: Vec<String>,
    #[serde(default = "default_author_name")]
    pub commit_author_name: String,
    #[serde(default = "default_author_email")]
    pub commit_author_email: String,
}

fn default_remote() -> String {
    "origin".into()
}

fn default_base_branch() -> String {
    "main".into()
}

fn default_branch_prefix() -> String {
    "evergreen/".into()
}

fn default_push_options() -> Vec<String> {
    vec!["ci.skip".into()]
}

fn default_author_name() -> String {
    "Evergreen Bot".into()
}

fn default_author_email() -> String {
    "evergreen@localhost".into()
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            remote: default_remote(),
            base_branch: default_base_branch(),
            branch_prefix: default_branch_prefix(),
            push_options: default_push_options(),
            commit_author_name: default_author_name(),
            commit_author_email: default_author_email(),
        }
    }
}

// ── Merge request host ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostAuthStyle {
    /// `Authorization: Bearer <token>`
    #[default]
    Bearer,
    /// `PRIVATE-TOKEN: <token>` (GitLab personal access tokens)
    PrivateToken,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    /// API root, e.g. `https://gitlab.com/api/v4`
    #[serde(default = "default_host_api_url")]
    pub api_url: String,
    #[serde(default)]
    pub project_id: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub auth_style: HostAuthStyle,
    #[serde(default = "default_true")]
    pub remove_source_branch: bool,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_host_api_url() -> String {
    "https://gitlab.com/api/v4".into()
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            api_url: default_host_api_url(),
            project_id: String::new(),
            token: None,
            auth_style: HostAuthStyle::default(),
            remove_source_branch: true,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

// ── Run orchestration ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default = "default_run_timeout_seconds")]
    pub run_timeout_seconds: u64,
    #[serde(default = "default_lock_staleness_seconds")]
    pub lock_staleness_seconds: u64,
    /// Run records kept in the state file
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

fn default_run_timeout_seconds() -> u64 {
    900
}

fn default_lock_staleness_seconds() -> u64 {
    3_600
}

fn default_history_limit() -> usize {
    50
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            run_timeout_seconds: default_run_timeout_seconds(),
            lock_staleness_seconds: default_lock_staleness_seconds(),
            history_limit: default_history_limit(),
        }
    }
}

// ── Watch mode ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    /// Seconds between runs when no cron expression is set
    #[serde(default = "default_watch_interval_secs")]
    pub interval_secs: u64,
    /// Cron expression (5 or 6 fields, UTC); overrides `interval_secs`
    #[serde(default)]
    pub cron: Option<String>,
    #[serde(default = "default_true")]
    pub run_on_startup: bool,
}

fn default_watch_interval_secs() -> u64 {
    3_600
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_watch_interval_secs(),
            cron: None,
            run_on_startup: true,
        }
    }
}

// ── Webhook trigger ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Bind host for `evergreen serve` (default: 127.0.0.1)
    #[serde(default = "default_webhook_host")]
    pub host: String,
    /// Bind port (default: 8080)
    #[serde(default = "default_webhook_port")]
    pub port: u16,
    /// Shared secret expected in `X-Webhook-Secret` on `POST /trigger`
    #[serde(default)]
    pub secret: Option<String>,
    /// Allow binding to a non-loopback address (default: false)
    #[serde(default)]
    pub allow_public_bind: bool,
}

fn default_webhook_host() -> String {
    "127.0.0.1".into()
}

fn default_webhook_port() -> u16 {
    8080
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            host: default_webhook_host(),
            port: default_webhook_port(),
            secret: None,
            allow_public_bind: false,
        }
    }
}

impl WebhookConfig {
    /// The configured secret, ignoring blank values.
    pub fn resolved_secret(&self) -> Option<&str> {
        self.secret
            .as_deref()
            .map(str::trim)
            .filter(|secret| !secret.is_empty())
    }
}

fn expand_path(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    PathBuf::from(shellexpand::tilde(&raw).into_owned())
}

// ── Config impl ────────────────────────────────────────────────────

impl Default for Config {
    fn default() -> Self {
        let home =
            UserDirs::new().map_or_else(|| PathBuf::from("."), |u| u.home_dir().to_path_buf());
        Self {
            config_path: home.join(".evergreen").join("config.toml"),
            log_level: default_log_level(),
            state_path: None,
            scanner: ScannerConfig::default(),
            policy: PolicyConfig::default(),
            registry: RegistryConfig::default(),
            git: GitConfig::default(),
            host: HostConfig::default(),
            run: RunConfig::default(),
            watch: WatchConfig::default(),
            webhook: WebhookConfig::default(),
        }
    }
}

impl Config {
    /// Resolved location of the persisted `RunState`.
    pub fn resolved_state_path(&self) -> PathBuf {
        self.state_path.as_deref().map_or_else(
            || {
                self.config_path
                    .parent()
                    .unwrap_or_else(|| Path::new("."))
                    .join("state.json")
            },
            expand_path,
        )
    }

    /// Scanner root with `~` expanded.
    pub fn resolved_scan_root(&self) -> PathBuf {
        expand_path(&self.scanner.root)
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.scanner.dockerfile_glob_patterns.is_empty() {
            return Err(ConfigError::Validation(
                "scanner.dockerfile_glob_patterns must not be empty".into(),
            ));
        }
        regex::Regex::new(&self.policy.tag_pattern).map_err(|e| {
            ConfigError::Validation(format!("policy.tag_pattern is not a valid regex: {e}"))
        })?;
        for image in &self.policy.images {
            if image.image.trim().is_empty() {
                return Err(ConfigError::Validation(
                    "policy.images entries need an image name".into(),
                ));
            }
            if let Some(pattern) = &image.tag_pattern {
                regex::Regex::new(pattern).map_err(|e| {
                    ConfigError::Validation(format!(
                        "tag_pattern for {} is not a valid regex: {e}",
                        image.image
                    ))
                })?;
            }
        }
        if self.registry.rate_limit_per_minute == 0 {
            return Err(ConfigError::Validation(
                "registry.rate_limit_per_minute must be at least 1".into(),
            ));
        }
        if self.registry.concurrency == 0 {
            return Err(ConfigError::Validation(
                "registry.concurrency must be at least 1".into(),
            ));
        }
        if self.registry.max_attempts == 0 {
            return Err(ConfigError::Validation(
                "registry.max_attempts must be at least 1".into(),
            ));
        }
        if self.registry.max_pages == 0 || self.registry.page_size == 0 {
            return Err(ConfigError::Validation(
                "registry.max_pages and registry.page_size must be at least 1".into(),
            ));
        }
        if let Some(expression) = &self.watch.cron {
            crate::schedule::WatchSchedule::cron(expression)
                .map_err(|e| ConfigError::Validation(format!("watch.cron: {e:#}")))?;
        }
        if self.run.run_timeout_seconds == 0 || self.run.lock_staleness_seconds == 0 {
            return Err(ConfigError::Validation(
                "run.run_timeout_seconds and run.lock_staleness_seconds must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Load `~/.evergreen/config.toml`, writing defaults on first use.
    pub fn load_or_init() -> Result<Self> {
        let home = UserDirs::new()
            .map(|u| u.home_dir().to_path_buf())
            .context("Could not find home directory")?;
        let evergreen_dir = home.join(".evergreen");
        let config_path = evergreen_dir.join("config.toml");

        if !evergreen_dir.exists() {
            fs::create_dir_all(&evergreen_dir).context("Failed to create .evergreen directory")?;
        }

        if config_path.exists() {
            Self::load_from_path(&config_path)
        } else {
            let mut config = Self {
                config_path,
                ..Self::default()
            };
            config.save()?;
            config.apply_env_overrides();
            config.validate()?;
            Ok(config)
        }
    }

    /// Load an explicit config file. The file must exist.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.config_path = path.to_path_buf();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to config.
    pub fn apply_env_overrides(&mut self) {
        // Host token: EVERGREEN_HOST_TOKEN or ACCESS_TOKEN
        if let Ok(token) =
            std::env::var("EVERGREEN_HOST_TOKEN").or_else(|_| std::env::var("ACCESS_TOKEN"))
            && !token.is_empty()
        {
            self.host.token = Some(token);
        }

        if let Ok(token) = std::env::var("EVERGREEN_REGISTRY_TOKEN")
            && !token.is_empty()
        {
            self.registry.token = Some(token);
        }

        // GitLab CI predefined variables
        if let Ok(api_url) = std::env::var("CI_API_V4_URL")
            && !api_url.is_empty()
        {
            self.host.api_url = api_url;
        }

        if let Ok(project_id) = std::env::var("CI_PROJECT_ID")
            && !project_id.is_empty()
        {
            self.host.project_id = project_id;
        }

        if let Ok(branch) = std::env::var("EVERGREEN_BASE_BRANCH")
            && !branch.is_empty()
        {
            self.git.base_branch = branch;
        }

        if let Ok(state_path) = std::env::var("EVERGREEN_STATE_PATH")
            && !state_path.is_empty()
        {
            self.state_path = Some(PathBuf::from(state_path));
        }

        if let Ok(secret) = std::env::var("EVERGREEN_WEBHOOK_SECRET")
            && !secret.is_empty()
        {
            self.webhook.secret = Some(secret);
        }

        if let Ok(level) = std::env::var("EVERGREEN_LOG_LEVEL")
            && !level.is_empty()
        {
            self.log_level = level;
        }
    }

    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }
        let toml_str = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(&self.config_path, toml_str).context("Failed to write config file")?;
        Ok(())
    }
}
