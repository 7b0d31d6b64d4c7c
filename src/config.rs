use crate::retry::RetryPolicy;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Runtime configuration for the orchestrator.
///
/// Values come from three layers, later wins: built-in defaults, an optional
/// `swarmops.toml` next to the data root, and `SWARMOPS_*` environment
/// variables. The data root holds all orchestrator state (§persisted
/// layout); the projects root holds per-project workspaces.
#[derive(Debug, Clone)]
pub struct SwarmConfig {
    pub data_root: PathBuf,
    pub projects_root: PathBuf,
    pub worktree_root: PathBuf,
    /// Base URL of the session gateway.
    pub gateway_url: String,
    pub gateway_token: Option<String>,
    /// Address the webhook server binds to.
    pub bind_addr: String,
    /// Base URL embedded into agent prompts for callbacks. Defaults to
    /// `http://<bind_addr>`.
    pub public_base_url: String,
    /// Gap between consecutive spawns in one dispatch wave.
    pub spawn_delay: Duration,
    /// Per-session gateway timeout.
    pub run_timeout: Duration,
    /// Watcher poll cadence.
    pub watcher_interval: Duration,
    /// Re-trigger cooldowns per project phase.
    pub build_cooldown: Duration,
    pub spec_cooldown: Duration,
    /// Progress watchdog cadence, staleness threshold, and retry cap.
    pub watchdog_interval: Duration,
    pub watchdog_stale_after: Duration,
    pub watchdog_max_retries: u32,
    /// Review chain role ids, run strictly in order.
    pub review_chain: Vec<String>,
    pub max_fix_attempts: u32,
    /// Spawn retry policy applied to every dispatch step.
    pub retry_policy: RetryPolicy,
    pub dev_mode: bool,
}

/// Optional `swarmops.toml` overlay. Every field is optional; unset fields
/// keep their defaults.
#[derive(Debug, Clone, Default, Deserialize)]
struct ConfigFile {
    projects_root: Option<PathBuf>,
    worktree_root: Option<PathBuf>,
    gateway_url: Option<String>,
    gateway_token: Option<String>,
    bind_addr: Option<String>,
    public_base_url: Option<String>,
    spawn_delay_ms: Option<u64>,
    run_timeout_secs: Option<u64>,
    watcher_interval_secs: Option<u64>,
    build_cooldown_secs: Option<u64>,
    spec_cooldown_secs: Option<u64>,
    watchdog_interval_secs: Option<u64>,
    watchdog_stale_secs: Option<u64>,
    watchdog_max_retries: Option<u32>,
    review_chain: Option<Vec<String>>,
    max_fix_attempts: Option<u32>,
    retry_max_attempts: Option<u32>,
    retry_base_delay_ms: Option<u64>,
    retry_max_delay_ms: Option<u64>,
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

impl SwarmConfig {
    /// Load configuration. `data_root` from the CLI wins over
    /// `SWARMOPS_DATA_DIR`, which wins over the platform data dir.
    pub fn load(data_root: Option<PathBuf>) -> Result<Self> {
        let data_root = data_root
            .or_else(|| env_var("SWARMOPS_DATA_DIR").map(PathBuf::from))
            .or_else(|| dirs::data_dir().map(|d| d.join("swarmops")))
            .unwrap_or_else(|| PathBuf::from(".swarmops"));

        let file: ConfigFile = {
            let path = data_root.join("swarmops.toml");
            match std::fs::read_to_string(&path) {
                Ok(text) => toml::from_str(&text)
                    .with_context(|| format!("Failed to parse {}", path.display()))?,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => ConfigFile::default(),
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("Failed to read {}", path.display()));
                }
            }
        };

        let projects_root = env_var("SWARMOPS_PROJECTS_DIR")
            .map(PathBuf::from)
            .or(file.projects_root)
            .unwrap_or_else(|| data_root.join("projects"));
        let worktree_root = env_var("SWARMOPS_WORKTREE_DIR")
            .map(PathBuf::from)
            .or(file.worktree_root)
            .unwrap_or_else(|| std::env::temp_dir().join("swarmops-worktrees"));
        let gateway_url = env_var("SWARMOPS_GATEWAY_URL")
            .or(file.gateway_url)
            .unwrap_or_else(|| "http://127.0.0.1:8787".to_string());
        let gateway_token = env_var("SWARMOPS_GATEWAY_TOKEN").or(file.gateway_token);
        let bind_addr = env_var("SWARMOPS_BIND_ADDR")
            .or(file.bind_addr)
            .unwrap_or_else(|| "127.0.0.1:7700".to_string());
        let public_base_url = env_var("SWARMOPS_PUBLIC_URL")
            .or(file.public_base_url)
            .unwrap_or_else(|| format!("http://{bind_addr}"));

        Ok(Self {
            data_root,
            projects_root,
            worktree_root,
            gateway_url,
            gateway_token,
            bind_addr,
            public_base_url,
            spawn_delay: Duration::from_millis(file.spawn_delay_ms.unwrap_or(3_000)),
            run_timeout: Duration::from_secs(file.run_timeout_secs.unwrap_or(600)),
            watcher_interval: Duration::from_secs(file.watcher_interval_secs.unwrap_or(30)),
            build_cooldown: Duration::from_secs(file.build_cooldown_secs.unwrap_or(30)),
            spec_cooldown: Duration::from_secs(file.spec_cooldown_secs.unwrap_or(300)),
            watchdog_interval: Duration::from_secs(file.watchdog_interval_secs.unwrap_or(300)),
            watchdog_stale_after: Duration::from_secs(file.watchdog_stale_secs.unwrap_or(600)),
            watchdog_max_retries: file.watchdog_max_retries.unwrap_or(3),
            review_chain: file.review_chain.unwrap_or_else(|| {
                vec![
                    "reviewer".to_string(),
                    "security-reviewer".to_string(),
                    "designer".to_string(),
                ]
            }),
            max_fix_attempts: file.max_fix_attempts.unwrap_or(3),
            retry_policy: {
                let defaults = RetryPolicy::default();
                RetryPolicy {
                    max_attempts: file.retry_max_attempts.unwrap_or(defaults.max_attempts),
                    base_delay_ms: file.retry_base_delay_ms.unwrap_or(defaults.base_delay_ms),
                    max_delay_ms: file.retry_max_delay_ms.unwrap_or(defaults.max_delay_ms),
                    backoff_multiplier: defaults.backoff_multiplier,
                }
            },
            dev_mode: env_var("SWARMOPS_DEV").is_some(),
        })
    }

    /// A config rooted at explicit directories, for tests.
    pub fn for_test(data_root: &Path, projects_root: &Path) -> Self {
        Self {
            data_root: data_root.to_path_buf(),
            projects_root: projects_root.to_path_buf(),
            worktree_root: data_root.join("worktrees"),
            gateway_url: "http://127.0.0.1:0".to_string(),
            gateway_token: None,
            bind_addr: "127.0.0.1:0".to_string(),
            public_base_url: "http://127.0.0.1:0".to_string(),
            spawn_delay: Duration::from_millis(0),
            run_timeout: Duration::from_secs(600),
            watcher_interval: Duration::from_millis(50),
            build_cooldown: Duration::from_millis(0),
            spec_cooldown: Duration::from_millis(0),
            watchdog_interval: Duration::from_millis(100),
            watchdog_stale_after: Duration::from_secs(600),
            watchdog_max_retries: 3,
            review_chain: vec![
                "reviewer".to_string(),
                "security-reviewer".to_string(),
                "designer".to_string(),
            ],
            max_fix_attempts: 3,
            retry_policy: RetryPolicy {
                max_attempts: 3,
                base_delay_ms: 10,
                max_delay_ms: 100,
                backoff_multiplier: 2.0,
            },
            dev_mode: false,
        }
    }

    // State layout under the data root.

    pub fn work_dir(&self) -> PathBuf {
        self.data_root.join("work")
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.data_root.join("runs")
    }

    pub fn project_runs_dir(&self) -> PathBuf {
        self.data_root.join("project-runs")
    }

    pub fn phases_dir(&self) -> PathBuf {
        self.data_root.join("phases")
    }

    pub fn reviews_dir(&self) -> PathBuf {
        self.data_root.join("reviews")
    }

    pub fn resolvers_dir(&self) -> PathBuf {
        self.data_root.join("conflict-resolvers")
    }

    pub fn prompts_dir(&self) -> PathBuf {
        self.data_root.join("prompts")
    }

    pub fn registry_path(&self) -> PathBuf {
        self.data_root.join("task-registry.json")
    }

    pub fn retry_path(&self) -> PathBuf {
        self.data_root.join("retry-state.json")
    }

    pub fn escalations_path(&self) -> PathBuf {
        self.data_root.join("escalations.json")
    }

    pub fn roles_path(&self) -> PathBuf {
        self.data_root.join("roles.json")
    }

    pub fn project_dir(&self, project: &str) -> PathBuf {
        self.projects_root.join(project)
    }

    pub fn ensure_directories(&self) -> Result<()> {
        for dir in [
            self.data_root.clone(),
            self.work_dir(),
            self.runs_dir(),
            self.project_runs_dir(),
            self.phases_dir(),
            self.reviews_dir(),
            self.resolvers_dir(),
            self.prompts_dir(),
            self.projects_root.clone(),
            self.worktree_root.clone(),
        ] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_without_file() {
        let dir = tempdir().unwrap();
        let config = SwarmConfig::load(Some(dir.path().to_path_buf())).unwrap();
        assert_eq!(config.data_root, dir.path());
        assert_eq!(config.spawn_delay, Duration::from_millis(3_000));
        assert_eq!(config.watcher_interval, Duration::from_secs(30));
        assert_eq!(
            config.review_chain,
            vec!["reviewer", "security-reviewer", "designer"]
        );
        assert_eq!(config.max_fix_attempts, 3);
    }

    #[test]
    fn toml_overlay_overrides_defaults() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("swarmops.toml"),
            r#"
gateway_url = "http://gateway.internal:9000"
spawn_delay_ms = 250
review_chain = ["reviewer"]
"#,
        )
        .unwrap();
        let config = SwarmConfig::load(Some(dir.path().to_path_buf())).unwrap();
        assert_eq!(config.gateway_url, "http://gateway.internal:9000");
        assert_eq!(config.spawn_delay, Duration::from_millis(250));
        assert_eq!(config.review_chain, vec!["reviewer"]);
        // Untouched fields keep defaults
        assert_eq!(config.run_timeout, Duration::from_secs(600));
    }

    #[test]
    fn malformed_toml_is_an_error() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("swarmops.toml"), "not = [valid").unwrap();
        assert!(SwarmConfig::load(Some(dir.path().to_path_buf())).is_err());
    }

    #[test]
    fn ensure_directories_creates_layout() {
        let dir = tempdir().unwrap();
        let config = SwarmConfig::for_test(&dir.path().join("data"), &dir.path().join("projects"));
        config.ensure_directories().unwrap();
        assert!(config.work_dir().exists());
        assert!(config.runs_dir().exists());
        assert!(config.phases_dir().exists());
        assert!(config.resolvers_dir().exists());
    }
}
