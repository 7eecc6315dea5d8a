//! Runtime configuration.
//!
//! Settings come from process environment variables, optionally seeded from a
//! `.env` file via `dotenvy`. The per-environment registry (folders,
//! workbooks, recipients, legacy jobs) lives in a YAML file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::NaiveTime;
use recon_adapters::JiraCredentials;
use recon_core::JiraMode;
use recon_rules::{DecisionConfig, DEFAULT_NEAR_DUPLICATE_PERCENT};
use recon_storage::HttpClientConfig;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingVar(&'static str),
    #[error("invalid value {value:?} for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
    #[error("reading environment registry {path}: {source}")]
    RegistryRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing environment registry: {0}")]
    RegistryParse(#[from] serde_yaml::Error),
    #[error("environment {0} is declared more than once")]
    DuplicateEnvironment(String),
    #[error("unknown environment {0:?}")]
    UnknownEnvironment(String),
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[derive(Debug, Clone)]
pub struct JiraSettings {
    pub base_url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub verify_ssl: bool,
    pub project_key: String,
    pub issue_type: String,
    pub template_issue: Option<String>,
    pub mode: JiraMode,
    pub assignment_group_qa: String,
    pub assignment_group_prod: String,
}

impl Default for JiraSettings {
    fn default() -> Self {
        Self {
            base_url: None,
            username: None,
            password: None,
            verify_ssl: false,
            project_key: "EVT".to_string(),
            issue_type: "Event".to_string(),
            template_issue: None,
            mode: JiraMode::Qa,
            assignment_group_qa: "CSD Operations".to_string(),
            assignment_group_prod: "CA4U 2nd Level Support".to_string(),
        }
    }
}

impl JiraSettings {
    pub fn credentials(&self) -> Result<JiraCredentials, ConfigError> {
        let base_url = self
            .base_url
            .as_deref()
            .ok_or(ConfigError::MissingVar("JIRA_BASE_URL"))?;
        let username = self
            .username
            .as_deref()
            .ok_or(ConfigError::MissingVar("JIRA_USERNAME"))?;
        let password = self
            .password
            .as_deref()
            .ok_or(ConfigError::MissingVar("JIRA_PASSWORD"))?;
        Ok(JiraCredentials {
            base_url: base_url.trim_end_matches('/').to_string(),
            username: username.to_string(),
            password: password.to_string(),
        })
    }

    pub fn template_issue(&self) -> Result<&str, ConfigError> {
        self.template_issue
            .as_deref()
            .ok_or(ConfigError::MissingVar("JIRA_TEMPLATE_ISSUE"))
    }

    pub fn assignment_group(&self) -> &str {
        match self.mode {
            JiraMode::Prod => &self.assignment_group_prod,
            JiraMode::Qa => &self.assignment_group_qa,
        }
    }

    /// Browser link for an issue, when the server is configured.
    pub fn browse_url(&self, issue_key: &str) -> Option<String> {
        self.base_url
            .as_deref()
            .map(|base| format!("{}/browse/{issue_key}", base.trim_end_matches('/')))
    }
}

#[derive(Debug, Clone)]
pub struct WorkflowConfig {
    pub workspace_root: PathBuf,
    pub environments_file: PathBuf,
    pub state_dir: PathBuf,
    pub artifacts_dir: PathBuf,
    pub outbox_dir: PathBuf,
    pub batch_command: Option<String>,
    pub macro_command: Option<String>,
    pub decision: DecisionConfig,
    pub keep_days: u32,
    pub http_timeout_secs: u64,
    pub mail_from: Option<String>,
    pub mail_signature: String,
    pub jira: JiraSettings,
}

pub const DEFAULT_SIGNATURE: &str = "Kind regards,<br>ES Operations";

impl WorkflowConfig {
    /// Loads `.env` when present, then reads the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary variable source. Blank
    /// values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let workspace_root = get("RECON_WORKSPACE")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let under_root = |key: &str, default: &str| {
            let path = get(key).map(PathBuf::from).unwrap_or_else(|| PathBuf::from(default));
            resolve_path(&workspace_root, &path)
        };

        let near_duplicate_percent = match get("RECON_NEAR_DUPLICATE_PERCENT") {
            Some(v) => {
                let pct: f64 = v.parse().map_err(|_| ConfigError::Invalid {
                    var: "RECON_NEAR_DUPLICATE_PERCENT",
                    value: v.clone(),
                    reason: "expected a number".into(),
                })?;
                if !(0.0..=100.0).contains(&pct) {
                    return Err(ConfigError::Invalid {
                        var: "RECON_NEAR_DUPLICATE_PERCENT",
                        value: v,
                        reason: "expected a percentage between 0 and 100".into(),
                    });
                }
                pct
            }
            None => DEFAULT_NEAR_DUPLICATE_PERCENT,
        };
        let cutoff = match get("RECON_CUTOFF_UTC") {
            Some(v) => NaiveTime::parse_from_str(&v, "%H:%M").map_err(|e| ConfigError::Invalid {
                var: "RECON_CUTOFF_UTC",
                value: v.clone(),
                reason: e.to_string(),
            })?,
            None => DecisionConfig::default().cutoff,
        };
        let keep_days = parse_number(&get, "RECON_KEEP_DAYS", 60)?;
        let http_timeout_secs = parse_number(&get, "RECON_HTTP_TIMEOUT_SECS", 60)?;

        let defaults = JiraSettings::default();
        let mode = match get("JIRA_MODE") {
            Some(v) => v.parse::<JiraMode>().map_err(|e| ConfigError::Invalid {
                var: "JIRA_MODE",
                value: v.clone(),
                reason: e.to_string(),
            })?,
            None => defaults.mode,
        };
        let jira = JiraSettings {
            base_url: get("JIRA_BASE_URL").map(|v| v.trim_end_matches('/').to_string()),
            username: get("JIRA_USERNAME"),
            password: get("JIRA_PASSWORD"),
            verify_ssl: get("JIRA_VERIFY_SSL").map_or(defaults.verify_ssl, |v| parse_bool(&v)),
            project_key: get("JIRA_PROJECT_KEY").unwrap_or(defaults.project_key),
            issue_type: get("JIRA_ISSUE_TYPE").unwrap_or(defaults.issue_type),
            template_issue: get("JIRA_TEMPLATE_ISSUE"),
            mode,
            assignment_group_qa: get("JIRA_ASSIGNMENT_GROUP_QA").unwrap_or(defaults.assignment_group_qa),
            assignment_group_prod: get("JIRA_ASSIGNMENT_GROUP_PROD")
                .unwrap_or(defaults.assignment_group_prod),
        };

        Ok(Self {
            environments_file: under_root("RECON_ENVIRONMENTS_FILE", "environments.yaml"),
            state_dir: under_root("RECON_STATE_DIR", "state"),
            artifacts_dir: under_root("RECON_ARTIFACTS_DIR", "artifacts"),
            outbox_dir: under_root("RECON_OUTBOX_DIR", "outbox"),
            batch_command: get("RECON_BATCH_COMMAND"),
            macro_command: get("RECON_MACRO_COMMAND"),
            decision: DecisionConfig {
                cutoff,
                near_duplicate_percent,
            },
            keep_days,
            http_timeout_secs,
            mail_from: get("RECON_MAIL_FROM"),
            mail_signature: get("RECON_MAIL_SIGNATURE").unwrap_or_else(|| DEFAULT_SIGNATURE.to_string()),
            jira,
            workspace_root,
        })
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            verify_tls: self.jira.verify_ssl,
            ..HttpClientConfig::default()
        }
    }

    pub fn resolve(&self, path: &Path) -> PathBuf {
        resolve_path(&self.workspace_root, path)
    }
}

fn parse_number<T, G>(get: &G, var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(var) {
        Some(v) => v.parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            value: v.clone(),
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

fn resolve_path(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LegacyJob {
    pub job: String,
    pub job_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EnvironmentConfig {
    pub name: String,
    /// Report folder name, also used in email subjects.
    pub folder: String,
    pub workbook: PathBuf,
    #[serde(rename = "macro")]
    pub macro_name: String,
    pub snapshot_csv: PathBuf,
    #[serde(default)]
    pub header_row: usize,
    pub jira_env_label: String,
    #[serde(default)]
    pub jira_env_id: Option<String>,
    #[serde(default)]
    pub to: Vec<String>,
    #[serde(default)]
    pub cc: Vec<String>,
    #[serde(default)]
    pub jobs: Vec<LegacyJob>,
}

impl EnvironmentConfig {
    pub fn job(&self, name: &str) -> Option<&LegacyJob> {
        let name = name.trim();
        self.jobs.iter().find(|j| j.job.eq_ignore_ascii_case(name))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EnvironmentRegistry {
    pub environments: Vec<EnvironmentConfig>,
}

impl EnvironmentRegistry {
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::RegistryRead {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_yaml_str(&text)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let registry: Self = serde_yaml::from_str(text)?;
        for (i, env) in registry.environments.iter().enumerate() {
            if registry.environments[..i]
                .iter()
                .any(|other| other.name.eq_ignore_ascii_case(&env.name))
            {
                return Err(ConfigError::DuplicateEnvironment(env.name.clone()));
            }
        }
        Ok(registry)
    }

    pub fn get(&self, name: &str) -> Result<&EnvironmentConfig, ConfigError> {
        let wanted = name.trim();
        self.environments
            .iter()
            .find(|env| env.name.eq_ignore_ascii_case(wanted))
            .ok_or_else(|| ConfigError::UnknownEnvironment(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.environments.iter().map(|env| env.name.as_str())
    }
}
