//! On-disk state for the daily routine, the evidence archive, and the retry
//! policy shared by network adapters.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use recon_core::{JobRecord, JobStatus};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

pub const JOB_STATE_FILE: &str = "jobs_state.json";
pub const APP_STATE_FILE: &str = "app_state.json";

#[derive(Debug, Error)]
pub enum StateError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("writing {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("serializing state: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Last reported status of one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobEntry {
    pub job_id: String,
    pub status: JobStatus,
    #[serde(default)]
    pub rc: Option<String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl JobEntry {
    pub fn to_record(&self, job: &str) -> JobRecord {
        JobRecord::new(job, self.job_id.clone(), self.status, self.rc.clone())
    }
}

/// Job status keyed by operating date (`YYYY-MM-DD`), then environment, then job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobStateBook {
    days: BTreeMap<String, BTreeMap<String, BTreeMap<String, JobEntry>>>,
}

impl JobStateBook {
    pub fn record(&mut self, date_key: &str, env: &str, job: &str, entry: JobEntry) {
        self.days
            .entry(date_key.to_string())
            .or_default()
            .entry(env.to_string())
            .or_default()
            .insert(job.to_string(), entry);
    }

    pub fn jobs_for(&self, date_key: &str, env: &str) -> Option<&BTreeMap<String, JobEntry>> {
        self.days.get(date_key).and_then(|envs| envs.get(env))
    }

    pub fn date_keys(&self) -> impl Iterator<Item = &str> {
        self.days.keys().map(String::as_str)
    }

    /// Drops days older than `keep_days` before `today`. Keys that are not
    /// `YYYY-MM-DD` are left alone. Returns whether anything was removed.
    pub fn prune(&mut self, today: NaiveDate, keep_days: u32) -> bool {
        let cutoff = today - chrono::Duration::days(i64::from(keep_days));
        let before = self.days.len();
        self.days.retain(|key, _| match NaiveDate::parse_from_str(key, "%Y-%m-%d") {
            Ok(day) => day >= cutoff,
            Err(_) => true,
        });
        self.days.len() != before
    }
}

/// Progress of the current daily round. Missing fields load as defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppState {
    pub run_date_key: Option<String>,
    pub batch_done: bool,
    pub batch_last_run: Option<DateTime<Utc>>,
    pub macro_done: BTreeMap<String, bool>,
    pub validate_done: BTreeMap<String, bool>,
    pub last_issue_key: BTreeMap<String, String>,
    pub operating_date: Option<NaiveDate>,
    /// Job updates captured before the operating date is known.
    pub draft_jobs: BTreeMap<String, BTreeMap<String, JobEntry>>,
}

impl AppState {
    /// Resets the round when the calendar day changed. Returns true on reset.
    pub fn rollover_if_new_day(&mut self, today: NaiveDate) -> bool {
        let today_key = today.format("%Y-%m-%d").to_string();
        if self.run_date_key.as_deref() == Some(today_key.as_str()) {
            return false;
        }
        *self = Self {
            run_date_key: Some(today_key),
            ..Self::default()
        };
        true
    }

    pub fn is_macro_done(&self, env: &str) -> bool {
        self.macro_done.get(env).copied().unwrap_or(false)
    }

    pub fn is_validated(&self, env: &str) -> bool {
        self.validate_done.get(env).copied().unwrap_or(false)
    }

    pub fn last_issue_key(&self, env: &str) -> Option<&str> {
        self.last_issue_key.get(env).map(String::as_str)
    }

    pub fn operating_key(&self) -> Option<String> {
        self.operating_date.map(|d| d.format("%Y-%m-%d").to_string())
    }

    /// Moves draft job updates under the operating date. Returns how many
    /// entries moved; nothing moves while the operating date is unknown.
    pub fn promote_drafts(&mut self, book: &mut JobStateBook) -> usize {
        let Some(date_key) = self.operating_key() else {
            return 0;
        };
        let mut moved = 0;
        for (env, jobs) in std::mem::take(&mut self.draft_jobs) {
            for (job, entry) in jobs {
                book.record(&date_key, &env, &job, entry);
                moved += 1;
            }
        }
        moved
    }
}

/// JSON state files under one directory, written atomically.
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn load_jobs(&self) -> Result<JobStateBook, StateError> {
        read_json_or_default(&self.dir.join(JOB_STATE_FILE)).await
    }

    pub async fn save_jobs(&self, book: &JobStateBook) -> Result<(), StateError> {
        write_json_atomic(&self.dir.join(JOB_STATE_FILE), book).await
    }

    pub async fn load_app(&self) -> Result<AppState, StateError> {
        read_json_or_default(&self.dir.join(APP_STATE_FILE)).await
    }

    pub async fn save_app(&self, state: &AppState) -> Result<(), StateError> {
        write_json_atomic(&self.dir.join(APP_STATE_FILE), state).await
    }
}

async fn read_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> Result<T, StateError> {
    let text = match fs::read_to_string(path).await {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(T::default()),
        Err(source) => {
            return Err(StateError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    serde_json::from_str(&text).map_err(|source| StateError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StateError> {
    let bytes = serde_json::to_vec_pretty(value)?;
    let write_err = |source| StateError::Write {
        path: path.to_path_buf(),
        source,
    };

    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).await.map_err(write_err)?;

    let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
    fs::write(&temp_path, &bytes).await.map_err(write_err)?;
    if let Err(source) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(write_err(source));
    }
    debug!(path = %path.display(), bytes = bytes.len(), "state saved");
    Ok(())
}

#[derive(Debug, Clone)]
pub struct StoredEvidence {
    pub file_name: String,
    pub content_hash: String,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Hash-addressed archive of the files attached to tickets.
#[derive(Debug, Clone)]
pub struct EvidenceStore {
    root: PathBuf,
}

impl EvidenceStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn evidence_relative_path(
        &self,
        operating_date: NaiveDate,
        env: &str,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let stamp = operating_date.format("%Y%m%d").to_string();
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        PathBuf::from(stamp)
            .join(env)
            .join(format!("{content_hash}.{ext}"))
    }

    /// Copy a file into the archive under a hash-addressed path with an
    /// atomic temp-file rename.
    pub async fn archive_file(
        &self,
        operating_date: NaiveDate,
        env: &str,
        source: &Path,
    ) -> anyhow::Result<StoredEvidence> {
        let bytes = fs::read(source)
            .await
            .with_context(|| format!("reading evidence file {}", source.display()))?;
        let file_name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let extension = source
            .extension()
            .map(|e| e.to_string_lossy().into_owned())
            .unwrap_or_default();

        let content_hash = Self::sha256_hex(&bytes);
        let relative_path = self.evidence_relative_path(operating_date, env, &content_hash, &extension);
        let absolute_path = self.root.join(&relative_path);
        let stored = |deduplicated| StoredEvidence {
            file_name: file_name.clone(),
            content_hash: content_hash.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len(),
            deduplicated,
        };

        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating evidence directory {}", parent.display()))?;

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking evidence path {}", absolute_path.display()))?
        {
            debug!(path = %absolute_path.display(), "evidence already archived");
            return Ok(stored(true));
        }

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp evidence file {}", temp_path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("writing temp evidence file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp evidence file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(stored(false)),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(stored(true))
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "atomically renaming temp evidence {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub user_agent: Option<String>,
    pub verify_tls: bool,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            user_agent: Some("Recon-Automation/1.0".to_string()),
            verify_tls: true,
            backoff: BackoffPolicy::default(),
        }
    }
}
