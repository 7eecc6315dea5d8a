//! Daily reconciliation routine: batch run, macro refresh, job tracking,
//! snapshot validation, ticket filing and the status email.

mod config;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Local, NaiveDate, Utc};
use recon_adapters::{
    impacted_ci_field, read_snapshot_csv, resolve_allowed_value_id, template_fields,
    CommandRunner, CommandSpec, IssueRequest, IssueTracker, JiraClient, NotificationSender,
    OutboxSender, ProcessRunner, FIELD_ASSIGNMENT_GROUP, FIELD_ENVIRONMENT, FIELD_IMPACTED_CI,
    ISSUE_LABEL,
};
use recon_core::{EmailType, JobRecord, JobStatus, ReconTable, SnapshotStatus};
use recon_rules::{
    compare_snapshots, compose_email, decide_email_type, format_ddmmyyyy, issue_description,
    issue_summary, operating_date, should_create_issue, validate_date, validate_issue_key,
    EmailContext, RowDifference, SnapshotCheck, ISSUE_WINDOW_COLUMNS,
};
use recon_storage::{AppState, EvidenceStore, JobEntry, JobStateBook, StateStore};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub use config::{
    ConfigError, EnvironmentConfig, EnvironmentRegistry, JiraSettings, LegacyJob, WorkflowConfig,
};

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("{0} is not configured")]
    MissingCommand(&'static str),
    #[error("job {job:?} is not registered for environment {env}")]
    UnknownJob { env: String, job: String },
    #[error("environment {0} has not been validated today")]
    NotValidated(String),
    #[error("no ticket has been filed for environment {0} today")]
    NoIssue(String),
    #[error("{0:?} is not a valid issue key")]
    InvalidIssueKey(String),
    #[error("{0:?} is not a valid DD-MM-YYYY date")]
    InvalidDate(String),
    #[error("operating date unknown: validate a snapshot or pass a date")]
    MissingOperatingDate,
}

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub env: String,
    pub status: SnapshotStatus,
    pub equal_percent: f64,
    pub previous: String,
    pub latest: String,
    pub differences: Vec<RowDifference>,
    pub operating_date: NaiveDate,
    pub promoted_drafts: usize,
    /// Normalized table restricted to the ticket window.
    pub window: ReconTable,
}

#[derive(Debug, Clone, Serialize)]
pub struct AttachmentReceipt {
    pub file_name: String,
    pub attachment_id: String,
    pub evidence_path: PathBuf,
    pub content_hash: String,
    pub byte_size: usize,
    /// The same content was already archived for this day and environment.
    pub deduplicated: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IssueOutcome {
    NotNeeded,
    Created {
        issue_key: String,
        attachments: Vec<AttachmentReceipt>,
    },
}

#[derive(Debug, Clone)]
pub struct EmailRequest<'a> {
    pub env: &'a str,
    pub issue_key: Option<&'a str>,
    /// `DD-MM-YYYY`; falls back to the validated operating date.
    pub date: Option<&'a str>,
    pub override_cutoff: bool,
    pub now: DateTime<Utc>,
    pub send: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EmailOutcome {
    Wait { pending_jobs: Vec<String> },
    Prepared {
        email_type: EmailType,
        subject: String,
        path: PathBuf,
        sent: bool,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct EnvironmentStatus {
    pub name: String,
    pub macro_done: bool,
    pub validated: bool,
    pub last_issue_key: Option<String>,
    pub jobs_ok: usize,
    pub jobs_total: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct DailyStatus {
    pub run_date_key: Option<String>,
    pub batch_done: bool,
    pub batch_last_run: Option<DateTime<Utc>>,
    pub operating_date: Option<NaiveDate>,
    pub environments: Vec<EnvironmentStatus>,
}

pub struct ReconWorkflow {
    config: WorkflowConfig,
    registry: EnvironmentRegistry,
    store: StateStore,
    evidence: EvidenceStore,
    runner: Arc<dyn CommandRunner>,
    sender: Arc<dyn NotificationSender>,
    tracker: OnceCell<Arc<dyn IssueTracker>>,
    clock: Clock,
}

impl ReconWorkflow {
    pub fn new(config: WorkflowConfig, registry: EnvironmentRegistry) -> Self {
        Self {
            store: StateStore::new(config.state_dir.clone()),
            evidence: EvidenceStore::new(config.artifacts_dir.clone()),
            runner: Arc::new(ProcessRunner),
            sender: Arc::new(OutboxSender::new(config.outbox_dir.clone())),
            tracker: OnceCell::new(),
            clock: Arc::new(Utc::now),
            config,
            registry,
        }
    }

    pub async fn from_env() -> Result<Self> {
        let config = WorkflowConfig::from_env().context("loading configuration")?;
        let registry = EnvironmentRegistry::load(&config.environments_file).await?;
        Ok(Self::new(config, registry))
    }

    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_sender(mut self, sender: Arc<dyn NotificationSender>) -> Self {
        self.sender = sender;
        self
    }

    pub fn with_tracker(mut self, tracker: Arc<dyn IssueTracker>) -> Self {
        self.tracker = OnceCell::from(tracker);
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    pub fn registry(&self) -> &EnvironmentRegistry {
        &self.registry
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    fn today(&self) -> NaiveDate {
        self.now().with_timezone(&Local).date_naive()
    }

    /// Jira session, opened on first use.
    async fn tracker(&self) -> Result<&Arc<dyn IssueTracker>> {
        self.tracker
            .get_or_try_init(|| async {
                let credentials = self.config.jira.credentials()?;
                let client = JiraClient::connect(&credentials, self.config.http_client_config())
                    .await
                    .context("opening jira session")?;
                Ok::<Arc<dyn IssueTracker>, anyhow::Error>(Arc::new(client))
            })
            .await
    }

    async fn load_app(&self) -> Result<AppState> {
        let mut state = self.store.load_app().await?;
        if state.rollover_if_new_day(self.today()) {
            info!(run_date = ?state.run_date_key, "new day, daily round reset");
            self.store.save_app(&state).await?;
        }
        Ok(state)
    }

    pub async fn run_batch(&self) -> Result<DateTime<Utc>> {
        let line = self
            .config
            .batch_command
            .as_deref()
            .ok_or(WorkflowError::MissingCommand("RECON_BATCH_COMMAND"))?;
        let command = CommandSpec::parse(line)
            .ok_or(WorkflowError::MissingCommand("RECON_BATCH_COMMAND"))?
            .in_dir(&self.config.workspace_root);

        let span = info_span!("run_batch", run_id = %Uuid::new_v4());
        async {
            let mut state = self.load_app().await?;
            self.runner.run(&command).await.context("batch command failed")?;
            let finished_at = self.now();
            state.batch_done = true;
            state.batch_last_run = Some(finished_at);
            self.store.save_app(&state).await?;
            info!(%finished_at, "batch executed");
            anyhow::Ok(finished_at)
        }
        .instrument(span)
        .await
    }

    pub async fn run_macro(&self, env: &str) -> Result<()> {
        let env_cfg = self.registry.get(env)?;
        let line = self
            .config
            .macro_command
            .as_deref()
            .ok_or(WorkflowError::MissingCommand("RECON_MACRO_COMMAND"))?;
        let workbook = self.config.resolve(&env_cfg.workbook);
        let command = CommandSpec::parse(line)
            .ok_or(WorkflowError::MissingCommand("RECON_MACRO_COMMAND"))?
            .arg(workbook.display().to_string())
            .arg(env_cfg.macro_name.clone())
            .in_dir(&self.config.workspace_root);

        let span = info_span!("run_macro", env = %env_cfg.name, run_id = %Uuid::new_v4());
        async {
            let mut state = self.load_app().await?;
            self.runner
                .run(&command)
                .await
                .with_context(|| format!("macro {} failed on {}", env_cfg.macro_name, workbook.display()))?;
            state.macro_done.insert(env_cfg.name.clone(), true);
            self.store.save_app(&state).await?;
            info!(macro_name = %env_cfg.macro_name, "macro executed");
            anyhow::Ok(())
        }
        .instrument(span)
        .await
    }

    /// Records that the report was refreshed by hand.
    pub async fn mark_macro_done(&self, env: &str) -> Result<()> {
        let env_cfg = self.registry.get(env)?;
        let mut state = self.load_app().await?;
        state.macro_done.insert(env_cfg.name.clone(), true);
        self.store.save_app(&state).await?;
        Ok(())
    }

    pub async fn set_job_status(
        &self,
        env: &str,
        job: &str,
        status: JobStatus,
        rc: Option<&str>,
    ) -> Result<JobRecord> {
        let env_cfg = self.registry.get(env)?;
        let legacy = env_cfg.job(job).ok_or_else(|| WorkflowError::UnknownJob {
            env: env_cfg.name.clone(),
            job: job.to_string(),
        })?;
        let entry = JobEntry {
            job_id: legacy.job_id.clone(),
            status,
            rc: rc.map(str::trim).filter(|rc| !rc.is_empty()).map(str::to_string),
            updated_at: Some(self.now()),
        };
        let record = entry.to_record(&legacy.job);

        let mut state = self.load_app().await?;
        match state.operating_key() {
            Some(date_key) => {
                let mut book = self.store.load_jobs().await?;
                book.record(&date_key, &env_cfg.name, &legacy.job, entry);
                self.store.save_jobs(&book).await?;
            }
            None => {
                state
                    .draft_jobs
                    .entry(env_cfg.name.clone())
                    .or_default()
                    .insert(legacy.job.clone(), entry);
                self.store.save_app(&state).await?;
            }
        }
        info!(env = %env_cfg.name, job = %legacy.job, status = %status, "job status recorded");
        Ok(record)
    }

    async fn check_snapshot(&self, env_cfg: &EnvironmentConfig) -> Result<SnapshotCheck> {
        let path = self.config.resolve(&env_cfg.snapshot_csv);
        let table = read_snapshot_csv(&path, env_cfg.header_row).await?;
        let check = compare_snapshots(&table, self.config.decision.near_duplicate_percent)
            .with_context(|| format!("comparing snapshots in {}", path.display()))?;
        Ok(check)
    }

    pub async fn validate(&self, env: &str) -> Result<ValidationReport> {
        let env_cfg = self.registry.get(env)?;
        let span = info_span!("validate", env = %env_cfg.name);
        async {
            let check = self.check_snapshot(env_cfg).await?;
            let operating = operating_date(&check.table)?;

            match check.status {
                SnapshotStatus::Duplicate => warn!(
                    previous = %check.previous,
                    latest = %check.latest,
                    "latest snapshot is identical to the previous one"
                ),
                SnapshotStatus::NearDuplicate => warn!(
                    previous = %check.previous,
                    latest = %check.latest,
                    equal_percent = check.equal_percent,
                    differing_rows = check.differences.len(),
                    "latest snapshot is nearly identical to the previous one"
                ),
                SnapshotStatus::Ok => {}
            }

            let mut state = self.load_app().await?;
            state.operating_date = Some(operating);
            let mut book = self.store.load_jobs().await?;
            let promoted = state.promote_drafts(&mut book);
            if promoted > 0 {
                self.store.save_jobs(&book).await?;
            }
            state.validate_done.insert(env_cfg.name.clone(), true);
            self.store.save_app(&state).await?;

            info!(
                status = %check.status,
                operating_date = %format_ddmmyyyy(operating),
                promoted,
                "snapshot validated"
            );
            anyhow::Ok(ValidationReport {
                env: env_cfg.name.clone(),
                status: check.status,
                equal_percent: check.equal_percent,
                previous: check.previous,
                latest: check.latest,
                differences: check.differences,
                operating_date: operating,
                promoted_drafts: promoted,
                window: check.table.last_columns(ISSUE_WINDOW_COLUMNS),
            })
        }
        .instrument(span)
        .await
    }

    fn snapshot_from(
        &self,
        env_cfg: &EnvironmentConfig,
        state: &AppState,
        book: &JobStateBook,
    ) -> Vec<JobRecord> {
        let recorded = match state.operating_key() {
            Some(date_key) => book.jobs_for(&date_key, &env_cfg.name),
            None => state.draft_jobs.get(&env_cfg.name),
        };
        env_cfg
            .jobs
            .iter()
            .map(|legacy| match recorded.and_then(|jobs| jobs.get(&legacy.job)) {
                Some(entry) => entry.to_record(&legacy.job),
                None => JobRecord::new(legacy.job.clone(), legacy.job_id.clone(), JobStatus::NotOk, None),
            })
            .collect()
    }

    /// Registry jobs merged with today's recorded status.
    pub async fn job_snapshot(&self, env: &str) -> Result<Vec<JobRecord>> {
        let env_cfg = self.registry.get(env)?;
        let state = self.load_app().await?;
        let book = self.store.load_jobs().await?;
        Ok(self.snapshot_from(env_cfg, &state, &book))
    }

    pub async fn file_issue(&self, env: &str, files: &[PathBuf]) -> Result<IssueOutcome> {
        let env_cfg = self.registry.get(env)?;
        let mut state = self.load_app().await?;
        if !state.is_validated(&env_cfg.name) {
            return Err(WorkflowError::NotValidated(env_cfg.name.clone()).into());
        }
        let operating = state.operating_date.ok_or(WorkflowError::MissingOperatingDate)?;

        let span = info_span!("file_issue", env = %env_cfg.name, run_id = %Uuid::new_v4());
        async {
            let check = self.check_snapshot(env_cfg).await?;
            let window = check.table.last_columns(ISSUE_WINDOW_COLUMNS);
            if !should_create_issue(&window) {
                info!("all metrics are zero, no ticket needed");
                return Ok(IssueOutcome::NotNeeded);
            }

            let tracker = self.tracker().await?;
            let jira = &self.config.jira;
            let template_key = jira.template_issue()?;

            let mut fields = template_fields(tracker.as_ref(), template_key).await?;
            fields.insert(
                FIELD_ASSIGNMENT_GROUP.to_string(),
                json!({ "name": jira.assignment_group() }),
            );
            let env_id = match &env_cfg.jira_env_id {
                Some(id) => id.clone(),
                None => {
                    let meta = tracker
                        .create_meta_fields(&jira.project_key, &jira.issue_type)
                        .await?;
                    resolve_allowed_value_id(&meta, FIELD_ENVIRONMENT, &env_cfg.jira_env_label)?
                }
            };
            fields.insert(FIELD_ENVIRONMENT.to_string(), json!({ "id": env_id }));
            fields.insert(
                FIELD_IMPACTED_CI.to_string(),
                impacted_ci_field(tracker.as_ref(), template_key).await?,
            );

            let request = IssueRequest {
                project_key: jira.project_key.clone(),
                issue_type: jira.issue_type.clone(),
                summary: issue_summary(&env_cfg.jira_env_label),
                description: issue_description(&window, &format_ddmmyyyy(operating)),
                labels: vec![ISSUE_LABEL.to_string()],
                fields,
            };
            let issue_key = tracker.create_issue(&request).await?;

            state.last_issue_key.insert(env_cfg.name.clone(), issue_key.clone());
            self.store.save_app(&state).await?;

            let attachments = self
                .attach_all(tracker.as_ref(), &issue_key, operating, &env_cfg.name, files)
                .await
                .with_context(|| {
                    format!("ticket {issue_key} was created but attaching evidence failed; retry the attachments")
                })?;
            anyhow::Ok(IssueOutcome::Created {
                issue_key,
                attachments,
            })
        }
        .instrument(span)
        .await
    }

    pub async fn retry_attachments(&self, env: &str, files: &[PathBuf]) -> Result<Vec<AttachmentReceipt>> {
        let env_cfg = self.registry.get(env)?;
        let state = self.load_app().await?;
        let issue_key = state
            .last_issue_key(&env_cfg.name)
            .ok_or_else(|| WorkflowError::NoIssue(env_cfg.name.clone()))?
            .to_string();
        let operating = state.operating_date.unwrap_or_else(|| self.today());
        let tracker = self.tracker().await?;
        self.attach_all(tracker.as_ref(), &issue_key, operating, &env_cfg.name, files)
            .await
    }

    async fn attach_all(
        &self,
        tracker: &dyn IssueTracker,
        issue_key: &str,
        operating: NaiveDate,
        env: &str,
        files: &[PathBuf],
    ) -> Result<Vec<AttachmentReceipt>> {
        let mut receipts = Vec::with_capacity(files.len());
        for file in files {
            let is_file = tokio::fs::metadata(file)
                .await
                .map(|meta| meta.is_file())
                .unwrap_or(false);
            if !is_file {
                warn!(file = %file.display(), "evidence file not found, skipped");
                continue;
            }
            let stored = self.evidence.archive_file(operating, env, file).await?;
            let attachment_id = tracker.attach_file(issue_key, file).await?;
            receipts.push(AttachmentReceipt {
                file_name: stored.file_name,
                attachment_id,
                evidence_path: stored.absolute_path,
                content_hash: stored.content_hash,
                byte_size: stored.byte_size,
                deduplicated: stored.deduplicated,
            });
        }
        info!(issue_key, attached = receipts.len(), "evidence attached");
        Ok(receipts)
    }

    pub async fn prepare_email(&self, request: &EmailRequest<'_>) -> Result<EmailOutcome> {
        let env_cfg = self.registry.get(request.env)?;
        let state = self.load_app().await?;
        let book = self.store.load_jobs().await?;
        let jobs = self.snapshot_from(env_cfg, &state, &book);

        let email_type = decide_email_type(
            &jobs,
            request.override_cutoff,
            request.now,
            &self.config.decision,
        );
        if email_type == EmailType::Wait {
            let pending_jobs = jobs
                .iter()
                .filter(|job| !job.is_ok())
                .map(|job| job.job.clone())
                .collect();
            info!(env = %env_cfg.name, "jobs still pending before the cutoff, no email yet");
            return Ok(EmailOutcome::Wait { pending_jobs });
        }

        let operating_date = match request.date {
            Some(raw) => validate_date(raw).ok_or_else(|| WorkflowError::InvalidDate(raw.to_string()))?,
            None => state
                .operating_date
                .map(format_ddmmyyyy)
                .ok_or(WorkflowError::MissingOperatingDate)?,
        };
        let issue_key = match request.issue_key {
            Some(raw) => Some(
                validate_issue_key(raw, &self.config.jira.project_key)
                    .ok_or_else(|| WorkflowError::InvalidIssueKey(raw.to_string()))?,
            ),
            None => state.last_issue_key(&env_cfg.name).map(str::to_string),
        };
        let issue_url = issue_key
            .as_deref()
            .and_then(|key| self.config.jira.browse_url(key));

        let window = if email_type != EmailType::FlowStopped && state.is_validated(&env_cfg.name) {
            Some(self.check_snapshot(env_cfg).await?.table.last_columns(ISSUE_WINDOW_COLUMNS))
        } else {
            None
        };

        let ctx = EmailContext {
            email_type,
            folder: &env_cfg.folder,
            operating_date: &operating_date,
            issue_key: issue_key.as_deref(),
            issue_url: issue_url.as_deref(),
            jobs: &jobs,
            cutoff: self.config.decision.cutoff,
            table: window.as_ref(),
            to: &env_cfg.to,
            cc: &env_cfg.cc,
            from: self.config.mail_from.as_deref(),
            signature: &self.config.mail_signature,
        };
        let Some(draft) = compose_email(&ctx) else {
            return Ok(EmailOutcome::Wait {
                pending_jobs: Vec::new(),
            });
        };

        let path = self.sender.deliver(&draft, request.send).await?;
        info!(env = %env_cfg.name, email_type = %email_type, sent = request.send, "email prepared");
        Ok(EmailOutcome::Prepared {
            email_type,
            subject: draft.subject,
            path,
            sent: request.send,
        })
    }

    pub async fn status(&self) -> Result<DailyStatus> {
        let state = self.load_app().await?;
        let book = self.store.load_jobs().await?;
        let environments = self
            .registry
            .environments
            .iter()
            .map(|env_cfg| {
                let jobs = self.snapshot_from(env_cfg, &state, &book);
                EnvironmentStatus {
                    name: env_cfg.name.clone(),
                    macro_done: state.is_macro_done(&env_cfg.name),
                    validated: state.is_validated(&env_cfg.name),
                    last_issue_key: state.last_issue_key(&env_cfg.name).map(str::to_string),
                    jobs_ok: jobs.iter().filter(|j| j.is_ok()).count(),
                    jobs_total: jobs.len(),
                }
            })
            .collect();
        Ok(DailyStatus {
            run_date_key: state.run_date_key.clone(),
            batch_done: state.batch_done,
            batch_last_run: state.batch_last_run,
            operating_date: state.operating_date,
            environments,
        })
    }

    /// Drops job history older than the retention window.
    pub async fn prune_job_state(&self) -> Result<bool> {
        let mut book = self.store.load_jobs().await?;
        let pruned = book.prune(self.today(), self.config.keep_days);
        if pruned {
            self.store.save_jobs(&book).await?;
            info!(keep_days = self.config.keep_days, "old job state pruned");
        }
        Ok(pruned)
    }
}

/// Evidence paths from a directory listing, in name order.
pub async fn evidence_in_dir(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("listing {}", dir.display()))?;
    let mut files = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("listing {}", dir.display()))?
    {
        let path = entry.path();
        if tokio::fs::metadata(&path).await.is_ok_and(|meta| meta.is_file()) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use recon_adapters::{CommandOutput, TrackerError};
    use recon_rules::EmailDraft;
    use serde_json::{Map, Value as JsonValue};
    use std::sync::Mutex;
    use tempfile::{tempdir, TempDir};

    #[derive(Default)]
    struct RecordingRunner {
        commands: Mutex<Vec<CommandSpec>>,
    }

    #[async_trait]
    impl CommandRunner for RecordingRunner {
        async fn run(&self, command: &CommandSpec) -> Result<CommandOutput> {
            self.commands.lock().expect("lock").push(command.clone());
            Ok(CommandOutput {
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
            })
        }
    }

    #[derive(Default)]
    struct RecordingSender {
        drafts: Mutex<Vec<(EmailDraft, bool)>>,
    }

    #[async_trait]
    impl NotificationSender for RecordingSender {
        async fn deliver(&self, draft: &EmailDraft, send: bool) -> Result<PathBuf> {
            self.drafts.lock().expect("lock").push((draft.clone(), send));
            Ok(PathBuf::from("outbox/draft.html"))
        }
    }

    #[derive(Default)]
    struct FakeTracker {
        created: Mutex<Vec<IssueRequest>>,
        attached: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl IssueTracker for FakeTracker {
        async fn create_issue(&self, request: &IssueRequest) -> Result<String, TrackerError> {
            self.created.lock().expect("lock").push(request.clone());
            Ok("EVT-110442".to_string())
        }

        async fn attach_file(&self, issue_key: &str, path: &Path) -> Result<String, TrackerError> {
            let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
            let mut attached = self.attached.lock().expect("lock");
            attached.push((issue_key.to_string(), name));
            Ok(format!("9000{}", attached.len()))
        }

        async fn issue_fields(
            &self,
            _issue_key: &str,
            _fields: &[&str],
        ) -> Result<Map<String, JsonValue>, TrackerError> {
            let value = json!({
                "customfield_10225": { "id": "14313" },
                "customfield_10218": { "name": "Someone Else" },
                "customfield_10219": { "value": "Reconciliation" },
                "customfield_10333": ["Recon (CI-7685538)"]
            });
            match value {
                JsonValue::Object(map) => Ok(map),
                _ => unreachable!(),
            }
        }

        async fn create_meta_fields(
            &self,
            _project_key: &str,
            _issue_type: &str,
        ) -> Result<Map<String, JsonValue>, TrackerError> {
            let value = json!({
                "customfield_10225": {
                    "allowedValues": [
                        { "id": "10258", "value": "Production" },
                        { "id": "14313", "value": "pEUA" }
                    ]
                }
            });
            match value {
                JsonValue::Object(map) => Ok(map),
                _ => unreachable!(),
            }
        }
    }

    const REGISTRY: &str = r#"
environments:
  - name: PROD
    folder: PROD
    workbook: reports/PROD.xlsm
    macro: RunReconciliation
    snapshot_csv: reports/prod.csv
    header_row: 1
    jira_env_label: PROD
    jira_env_id: "10258"
    to: [ops@example.com]
    cc: [it@example.com]
    jobs:
      - { job: ACCTERR, job_id: P201767A }
      - { job: HOLDERR, job_id: P201769A }
  - name: DEMO
    folder: DEMO
    workbook: reports/DEMO.xlsm
    macro: RunReconciliation
    snapshot_csv: reports/demo.csv
    jira_env_label: pEUA
    jobs:
      - { job: ACCTERR, job_id: X201767A }
"#;

    const NONZERO_CSV: &str = "Overview;;;\n\
        Metric;01-01-2026 08:00;02-01-2026 08:00;03-01-2026 08:00\n\
        Settled;5;0;2\n\
        Pending;1;0;4\n\
        Participants;0;0;0\n\
        ISIN;0;0;0\n\
        Holdings;0;0;0\n\
        Accounts;0;0;0\n";

    const ZERO_CSV: &str = "Metric,03-01-2026,04-01-2026\n\
        Settled,0,0\n\
        Pending,0,0\n\
        Participants,0,0\n\
        ISIN,0,0\n\
        Holdings,0,0\n\
        Accounts,0,0\n";

    struct Harness {
        dir: TempDir,
        workflow: ReconWorkflow,
        runner: Arc<RecordingRunner>,
        sender: Arc<RecordingSender>,
        tracker: Arc<FakeTracker>,
    }

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 5, hour, minute, 0).single().expect("ts")
    }

    fn harness() -> Harness {
        let dir = tempdir().expect("tempdir");
        let root = dir.path().to_path_buf();
        std::fs::create_dir_all(root.join("reports")).expect("reports dir");
        std::fs::write(root.join("reports/prod.csv"), NONZERO_CSV).expect("prod csv");
        std::fs::write(root.join("reports/demo.csv"), ZERO_CSV).expect("demo csv");

        let root_str = root.display().to_string();
        let config = WorkflowConfig::from_lookup(|key| match key {
            "RECON_WORKSPACE" => Some(root_str.clone()),
            "RECON_BATCH_COMMAND" => Some("run_legacy.cmd /wait".to_string()),
            "RECON_MACRO_COMMAND" => Some("cscript //nologo macro.vbs".to_string()),
            "JIRA_BASE_URL" => Some("https://jira.example.com".to_string()),
            "JIRA_TEMPLATE_ISSUE" => Some("EVT-100000".to_string()),
            _ => None,
        })
        .expect("config");
        let registry = EnvironmentRegistry::from_yaml_str(REGISTRY).expect("registry");

        let runner = Arc::new(RecordingRunner::default());
        let sender = Arc::new(RecordingSender::default());
        let tracker = Arc::new(FakeTracker::default());
        let workflow = ReconWorkflow::new(config, registry)
            .with_runner(runner.clone())
            .with_sender(sender.clone())
            .with_tracker(tracker.clone())
            .with_clock(Arc::new(|| at(12, 0)));
        Harness {
            dir,
            workflow,
            runner,
            sender,
            tracker,
        }
    }

    #[tokio::test]
    async fn batch_and_macro_commands_are_built_from_config() {
        let h = harness();
        h.workflow.run_batch().await.expect("batch");
        h.workflow.run_macro("prod").await.expect("macro");

        let commands = h.runner.commands.lock().expect("lock").clone();
        assert_eq!(commands[0].program, "run_legacy.cmd");
        assert_eq!(commands[0].args, ["/wait"]);
        assert_eq!(commands[1].program, "cscript");
        assert_eq!(commands[1].args[1], "macro.vbs");
        assert!(commands[1].args[2].ends_with("PROD.xlsm"));
        assert_eq!(commands[1].args[3], "RunReconciliation");

        let status = h.workflow.status().await.expect("status");
        assert!(status.batch_done);
        assert_eq!(status.batch_last_run, Some(at(12, 0)));
        assert!(status.environments[0].macro_done);
        assert!(!status.environments[1].macro_done);
    }

    #[tokio::test]
    async fn unknown_environment_and_job_are_rejected() {
        let h = harness();
        let err = h.workflow.run_macro("STAGING").await.expect_err("unknown env");
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::UnknownEnvironment(_))
        ));

        let err = h
            .workflow
            .set_job_status("PROD", "NOPEERR", JobStatus::Ok, None)
            .await
            .expect_err("unknown job");
        assert!(matches!(
            err.downcast_ref::<WorkflowError>(),
            Some(WorkflowError::UnknownJob { .. })
        ));
    }

    #[tokio::test]
    async fn drafts_are_promoted_on_validation() {
        let h = harness();
        h.workflow
            .set_job_status("PROD", "accterr", JobStatus::Ok, Some("0"))
            .await
            .expect("set job");

        let jobs = h.workflow.job_snapshot("PROD").await.expect("snapshot");
        assert_eq!(jobs[0].status, JobStatus::Ok);
        assert_eq!(jobs[1].status, JobStatus::NotOk);
        assert_eq!(jobs[1].rc_display(), "Not Run");

        let report = h.workflow.validate("PROD").await.expect("validate");
        assert_eq!(report.promoted_drafts, 1);
        assert_eq!(report.operating_date, NaiveDate::from_ymd_opt(2026, 1, 3).expect("date"));
        assert_eq!(report.status, SnapshotStatus::Ok);

        let book = StateStore::new(h.dir.path().join("state"))
            .load_jobs()
            .await
            .expect("jobs");
        let promoted = book.jobs_for("2026-01-03", "PROD").expect("promoted jobs");
        assert_eq!(promoted["ACCTERR"].rc.as_deref(), Some("0"));

        // After validation updates go straight to the book.
        h.workflow
            .set_job_status("PROD", "HOLDERR", JobStatus::Ok, None)
            .await
            .expect("set job");
        let jobs = h.workflow.job_snapshot("PROD").await.expect("snapshot");
        assert!(jobs.iter().all(JobRecord::is_ok));
    }

    #[tokio::test]
    async fn identical_snapshots_are_flagged() {
        let h = harness();
        let report = h.workflow.validate("DEMO").await.expect("validate");
        assert_eq!(report.status, SnapshotStatus::Duplicate);
        assert_eq!(report.equal_percent, 100.0);
        assert_eq!(report.latest, "04-01-2026");
    }

    #[tokio::test]
    async fn filing_requires_validation() {
        let h = harness();
        let err = h.workflow.file_issue("PROD", &[]).await.expect_err("not validated");
        assert!(matches!(
            err.downcast_ref::<WorkflowError>(),
            Some(WorkflowError::NotValidated(_))
        ));
    }

    #[tokio::test]
    async fn all_zero_report_needs_no_ticket() {
        let h = harness();
        h.workflow.validate("DEMO").await.expect("validate");
        let outcome = h.workflow.file_issue("DEMO", &[]).await.expect("file");
        assert!(matches!(outcome, IssueOutcome::NotNeeded));
        assert!(h.tracker.created.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn nonzero_report_files_ticket_with_evidence() {
        let h = harness();
        h.workflow.validate("PROD").await.expect("validate");

        let evidence = h.dir.path().join("SETTERR_P201773A.CSV");
        std::fs::write(&evidence, "ISIN;QTY\nDK0010274414;5\n").expect("evidence");
        let missing = h.dir.path().join("missing.csv");

        let outcome = h
            .workflow
            .file_issue("PROD", &[evidence.clone(), missing])
            .await
            .expect("file");
        let IssueOutcome::Created {
            issue_key,
            attachments,
        } = outcome
        else {
            panic!("expected a ticket");
        };
        assert_eq!(issue_key, "EVT-110442");
        assert_eq!(attachments.len(), 1);
        assert_eq!(attachments[0].file_name, "SETTERR_P201773A.CSV");
        assert!(attachments[0].evidence_path.exists());

        let created = h.tracker.created.lock().expect("lock").clone();
        let request = &created[0];
        assert_eq!(request.labels, [ISSUE_LABEL]);
        assert_eq!(request.fields[FIELD_ENVIRONMENT], json!({ "id": "10258" }));
        assert_eq!(request.fields[FIELD_ASSIGNMENT_GROUP], json!({ "name": "CSD Operations" }));
        assert_eq!(request.fields[FIELD_IMPACTED_CI], json!([{ "key": "CI-7685538" }]));
        assert!(request.summary.starts_with("PROD | CSD"));
        assert!(request.description.contains("03-01-2026"));

        let status = h.workflow.status().await.expect("status");
        assert_eq!(status.environments[0].last_issue_key.as_deref(), Some("EVT-110442"));

        let receipts = h
            .workflow
            .retry_attachments("PROD", &[evidence])
            .await
            .expect("retry");
        assert_eq!(receipts.len(), 1);
        assert!(!attachments[0].deduplicated);
        assert!(receipts[0].deduplicated);
        assert_eq!(receipts[0].content_hash, attachments[0].content_hash);
        assert_eq!(receipts[0].byte_size, 24);
        assert_eq!(h.tracker.attached.lock().expect("lock").len(), 2);
    }

    #[tokio::test]
    async fn environment_option_is_resolved_when_not_configured() {
        let h = harness();
        std::fs::write(h.dir.path().join("reports/demo.csv"), NONZERO_CSV.replacen("Overview;;;\n", "", 1))
            .expect("demo csv");
        h.workflow.validate("DEMO").await.expect("validate");
        h.workflow.file_issue("DEMO", &[]).await.expect("file");

        let created = h.tracker.created.lock().expect("lock").clone();
        assert_eq!(created[0].fields[FIELD_ENVIRONMENT], json!({ "id": "14313" }));
    }

    #[tokio::test]
    async fn retry_without_ticket_fails() {
        let h = harness();
        let err = h.workflow.retry_attachments("PROD", &[]).await.expect_err("no issue");
        assert!(matches!(err.downcast_ref::<WorkflowError>(), Some(WorkflowError::NoIssue(_))));
    }

    #[tokio::test]
    async fn email_waits_before_cutoff_then_goes_partial() {
        let h = harness();
        h.workflow
            .set_job_status("PROD", "ACCTERR", JobStatus::Ok, None)
            .await
            .expect("set job");
        h.workflow.validate("PROD").await.expect("validate");

        let early = EmailRequest {
            env: "PROD",
            issue_key: None,
            date: None,
            override_cutoff: false,
            now: at(5, 30),
            send: false,
        };
        let outcome = h.workflow.prepare_email(&early).await.expect("early");
        match outcome {
            EmailOutcome::Wait { pending_jobs } => assert_eq!(pending_jobs, ["HOLDERR"]),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(h.sender.drafts.lock().expect("lock").is_empty());

        let late = EmailRequest {
            issue_key: Some("evt-110442"),
            now: at(6, 0),
            send: true,
            ..early
        };
        let outcome = h.workflow.prepare_email(&late).await.expect("late");
        assert!(matches!(
            outcome,
            EmailOutcome::Prepared {
                email_type: EmailType::Partial,
                sent: true,
                ..
            }
        ));

        let drafts = h.sender.drafts.lock().expect("lock").clone();
        let (draft, send) = &drafts[0];
        assert!(*send);
        assert_eq!(
            draft.subject,
            "[ES Operations] Reconciliation (Partial) PROD CPH Report - 03-01-2026"
        );
        assert_eq!(draft.to, ["ops@example.com"]);
        assert!(draft.html_body.contains("https://jira.example.com/browse/EVT-110442"));
        assert!(draft.html_body.contains("HOLDERR (P201769A)"));
    }

    #[tokio::test]
    async fn flow_stopped_email_needs_a_date() {
        let h = harness();
        let request = EmailRequest {
            env: "PROD",
            issue_key: None,
            date: None,
            override_cutoff: true,
            now: at(5, 0),
            send: false,
        };
        let err = h.workflow.prepare_email(&request).await.expect_err("no date");
        assert!(matches!(
            err.downcast_ref::<WorkflowError>(),
            Some(WorkflowError::MissingOperatingDate)
        ));

        let request = EmailRequest {
            date: Some("04-01-2026"),
            ..request
        };
        let outcome = h.workflow.prepare_email(&request).await.expect("email");
        assert!(matches!(
            outcome,
            EmailOutcome::Prepared {
                email_type: EmailType::FlowStopped,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn invalid_issue_key_is_rejected() {
        let h = harness();
        let request = EmailRequest {
            env: "PROD",
            issue_key: Some("EVT-12"),
            date: Some("04-01-2026"),
            override_cutoff: true,
            now: at(7, 0),
            send: false,
        };
        let err = h.workflow.prepare_email(&request).await.expect_err("bad key");
        assert!(matches!(
            err.downcast_ref::<WorkflowError>(),
            Some(WorkflowError::InvalidIssueKey(_))
        ));
    }

    #[tokio::test]
    async fn stale_round_is_reset_and_old_history_pruned() {
        let h = harness();
        let store = StateStore::new(h.dir.path().join("state"));
        let mut stale = AppState {
            run_date_key: Some("2025-12-31".into()),
            batch_done: true,
            ..AppState::default()
        };
        stale.validate_done.insert("PROD".into(), true);
        store.save_app(&stale).await.expect("save app");

        let mut book = JobStateBook::default();
        let entry = JobEntry {
            job_id: "P201767A".into(),
            status: JobStatus::Ok,
            rc: None,
            updated_at: None,
        };
        book.record("2025-09-01", "PROD", "ACCTERR", entry.clone());
        book.record("2026-01-02", "PROD", "ACCTERR", entry);
        store.save_jobs(&book).await.expect("save jobs");

        let status = h.workflow.status().await.expect("status");
        assert!(!status.batch_done);
        assert!(!status.environments[0].validated);

        assert!(h.workflow.prune_job_state().await.expect("prune"));
        let book = store.load_jobs().await.expect("jobs");
        assert_eq!(book.date_keys().collect::<Vec<_>>(), ["2026-01-02"]);
    }

    #[tokio::test]
    async fn evidence_listing_is_sorted() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(dir.path().join("b.csv"), "").expect("b");
        std::fs::write(dir.path().join("a.csv"), "").expect("a");
        std::fs::create_dir(dir.path().join("nested")).expect("nested");
        let files = evidence_in_dir(dir.path()).await.expect("list");
        let names: Vec<_> = files
            .iter()
            .filter_map(|p| p.file_name().and_then(|n| n.to_str()))
            .collect();
        assert_eq!(names, ["a.csv", "b.csv"]);
    }
}
