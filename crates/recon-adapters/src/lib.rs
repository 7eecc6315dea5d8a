//! External collaborators of the daily routine: the Jira REST client, the
//! outbox mail sender, the batch/macro process runner and the snapshot
//! CSV reader.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use recon_core::{CellValue, ReconTable};
use recon_rules::EmailDraft;
use recon_storage::{
    classify_reqwest_error, classify_status, BackoffPolicy, HttpClientConfig, RetryDisposition,
};
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use reqwest::multipart::{Form, Part};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Serialize;
use serde_json::{json, Map, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};

pub const FIELD_ENVIRONMENT: &str = "customfield_10225";
pub const FIELD_ASSIGNMENT_GROUP: &str = "customfield_10218";
pub const FIELD_CATEGORY_SUBCATEGORY: &str = "customfield_10219";
pub const FIELD_IMPACTED_CI: &str = "customfield_10333";

/// Fields every reconciliation event copies from the template issue.
pub const REQUIRED_FIELDS: [&str; 4] = [
    FIELD_ENVIRONMENT,
    FIELD_ASSIGNMENT_GROUP,
    FIELD_CATEGORY_SUBCATEGORY,
    FIELD_IMPACTED_CI,
];

pub const ISSUE_LABEL: &str = "CPH_Reconciliation";

const BODY_HEAD_CHARS: usize = 500;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("{action} failed: http {status} for {url}: {body_head}")]
    Http {
        action: &'static str,
        status: u16,
        url: String,
        body_head: String,
    },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("template issue {key} is missing required fields: {missing:?}")]
    TemplateIncomplete { key: String, missing: Vec<String> },
    #[error("template issue {0} has an empty impacted CI field")]
    MissingImpactedCi(String),
    #[error("could not extract a CI key from {0:?}")]
    UnparsableImpactedCi(String),
    #[error("no allowed value of {field} matches {label:?}")]
    UnknownOption { field: String, label: String },
    #[error("unexpected response from {url}: {detail}")]
    UnexpectedResponse { url: String, detail: String },
    #[error("reading attachment {path}: {source}")]
    Attachment {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IssueRequest {
    pub project_key: String,
    pub issue_type: String,
    pub summary: String,
    pub description: String,
    pub labels: Vec<String>,
    /// Custom fields merged into the payload as-is.
    pub fields: Map<String, JsonValue>,
}

impl IssueRequest {
    pub fn to_payload(&self) -> JsonValue {
        let mut fields = Map::new();
        fields.insert("project".into(), json!({ "key": self.project_key }));
        fields.insert("issuetype".into(), json!({ "name": self.issue_type }));
        fields.insert("summary".into(), json!(self.summary));
        fields.insert("description".into(), json!(self.description));
        for (id, value) in &self.fields {
            fields.insert(id.clone(), value.clone());
        }
        if !self.labels.is_empty() {
            fields.insert("labels".into(), json!(self.labels));
        }
        json!({ "fields": fields })
    }
}

#[async_trait]
pub trait IssueTracker: Send + Sync {
    async fn create_issue(&self, request: &IssueRequest) -> Result<String, TrackerError>;

    /// Uploads one file and returns the attachment id.
    async fn attach_file(&self, issue_key: &str, path: &Path) -> Result<String, TrackerError>;

    async fn issue_fields(
        &self,
        issue_key: &str,
        fields: &[&str],
    ) -> Result<Map<String, JsonValue>, TrackerError>;

    async fn create_meta_fields(
        &self,
        project_key: &str,
        issue_type: &str,
    ) -> Result<Map<String, JsonValue>, TrackerError>;
}

#[derive(Debug, Clone)]
pub struct JiraCredentials {
    pub base_url: String,
    pub username: String,
    pub password: String,
}

/// Jira Server/DC client holding a cookie session.
#[derive(Debug)]
pub struct JiraClient {
    client: reqwest::Client,
    base_url: String,
    backoff: BackoffPolicy,
}

impl JiraClient {
    /// Builds the HTTP client and opens a session. Fails when login is refused.
    pub async fn connect(
        credentials: &JiraCredentials,
        config: HttpClientConfig,
    ) -> Result<Self, TrackerError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .cookie_store(true)
            .default_headers(headers)
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .danger_accept_invalid_certs(!config.verify_tls);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = Self {
            client: builder.build()?,
            base_url: credentials.base_url.trim_end_matches('/').to_string(),
            backoff: config.backoff,
        };
        client.login(&credentials.username, &credentials.password).await?;
        Ok(client)
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    async fn login(&self, username: &str, password: &str) -> Result<(), TrackerError> {
        let url = self.url("/rest/auth/1/session");
        let body = json!({ "username": username, "password": password });
        let span = info_span!("jira_login", url = %url);
        async {
            let resp = self
                .send_with_retry("session login", || {
                    self.client
                        .post(&url)
                        .header("X-Atlassian-Token", "no-check")
                        .json(&body)
                })
                .await?;
            debug!(status = resp.status().as_u16(), "jira session opened");
            Ok::<(), TrackerError>(())
        }
        .instrument(span)
        .await
    }

    async fn get_json(
        &self,
        action: &'static str,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<JsonValue, TrackerError> {
        let url = self.url(path);
        let resp = self
            .send_with_retry(action, || self.client.get(&url).query(query))
            .await?;
        Ok(resp.json().await?)
    }

    /// Sends an idempotent request, retrying transient failures.
    async fn send_with_retry<F>(&self, action: &'static str, build: F) -> Result<Response, TrackerError>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut attempt = 0;
        loop {
            match build().send().await {
                Ok(resp) if resp.status().is_success() => return Ok(resp),
                Ok(resp) => {
                    let status = resp.status();
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(action, status = status.as_u16(), attempt, "retrying jira request");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(http_error(action, resp).await);
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(action, error = %err, attempt, "retrying jira request");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(TrackerError::Request(err));
                }
            }
        }
    }
}

async fn http_error(action: &'static str, resp: Response) -> TrackerError {
    let status = resp.status().as_u16();
    let url = resp.url().to_string();
    let body = resp.text().await.unwrap_or_default();
    TrackerError::Http {
        action,
        status,
        url,
        body_head: body.chars().take(BODY_HEAD_CHARS).collect(),
    }
}

async fn expect_created(action: &'static str, resp: Response) -> Result<Response, TrackerError> {
    match resp.status() {
        StatusCode::OK | StatusCode::CREATED => Ok(resp),
        _ => Err(http_error(action, resp).await),
    }
}

fn object_field(value: JsonValue, field: &str) -> Map<String, JsonValue> {
    match value {
        JsonValue::Object(mut obj) => match obj.remove(field) {
            Some(JsonValue::Object(inner)) => inner,
            _ => Map::new(),
        },
        _ => Map::new(),
    }
}

#[async_trait]
impl IssueTracker for JiraClient {
    async fn create_issue(&self, request: &IssueRequest) -> Result<String, TrackerError> {
        let url = self.url("/rest/api/2/issue");
        let span = info_span!("jira_create_issue", project = %request.project_key);
        async {
            let resp = self
                .client
                .post(&url)
                .header("X-Atlassian-Token", "no-check")
                .json(&request.to_payload())
                .send()
                .await?;
            let body: JsonValue = expect_created("create issue", resp).await?.json().await?;
            let key = body
                .get("key")
                .and_then(JsonValue::as_str)
                .ok_or_else(|| TrackerError::UnexpectedResponse {
                    url: url.clone(),
                    detail: "created issue has no key".into(),
                })?;
            info!(issue_key = key, "jira issue created");
            Ok::<String, TrackerError>(key.to_string())
        }
        .instrument(span)
        .await
    }

    async fn attach_file(&self, issue_key: &str, path: &Path) -> Result<String, TrackerError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|source| TrackerError::Attachment {
                path: path.to_path_buf(),
                source,
            })?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "attachment".to_string());
        let url = self.url(&format!("/rest/api/2/issue/{issue_key}/attachments"));

        let span = info_span!("jira_attach", issue_key, file = %file_name);
        async {
            let form = Form::new().part("file", Part::bytes(bytes).file_name(file_name.clone()));
            let resp = self
                .client
                .post(&url)
                .header("X-Atlassian-Token", "no-check")
                .multipart(form)
                .send()
                .await?;
            let body: JsonValue = expect_created("attach file", resp).await?.json().await?;
            let id = body
                .as_array()
                .and_then(|items| items.first())
                .and_then(|item| item.get("id"))
                .map(|id| match id {
                    JsonValue::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .ok_or_else(|| TrackerError::UnexpectedResponse {
                    url: url.clone(),
                    detail: "attachment response has no id".into(),
                })?;
            info!(attachment_id = %id, "file attached");
            Ok::<String, TrackerError>(id)
        }
        .instrument(span)
        .await
    }

    async fn issue_fields(
        &self,
        issue_key: &str,
        fields: &[&str],
    ) -> Result<Map<String, JsonValue>, TrackerError> {
        let body = self
            .get_json(
                "read issue",
                &format!("/rest/api/2/issue/{issue_key}"),
                &[("fields", fields.join(","))],
            )
            .await?;
        Ok(object_field(body, "fields"))
    }

    async fn create_meta_fields(
        &self,
        project_key: &str,
        issue_type: &str,
    ) -> Result<Map<String, JsonValue>, TrackerError> {
        let body = self
            .get_json(
                "createmeta",
                "/rest/api/2/issue/createmeta",
                &[
                    ("projectKeys", project_key.to_string()),
                    ("issuetypeNames", issue_type.to_string()),
                    ("expand", "projects.issuetypes.fields".to_string()),
                ],
            )
            .await?;
        let issue_type_meta = body
            .pointer("/projects/0/issuetypes/0")
            .cloned()
            .unwrap_or(JsonValue::Null);
        Ok(object_field(issue_type_meta, "fields"))
    }
}

fn is_blank(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => true,
        JsonValue::String(s) => s.is_empty(),
        JsonValue::Array(items) => items.is_empty(),
        JsonValue::Object(obj) => obj.is_empty(),
        _ => false,
    }
}

/// Reads the required fields of the template issue; all must be filled.
pub async fn template_fields(
    tracker: &dyn IssueTracker,
    template_key: &str,
) -> Result<Map<String, JsonValue>, TrackerError> {
    let mut fields = tracker.issue_fields(template_key, &REQUIRED_FIELDS).await?;
    let missing: Vec<String> = REQUIRED_FIELDS
        .iter()
        .filter(|id| fields.get(**id).map_or(true, is_blank))
        .map(|id| id.to_string())
        .collect();
    if !missing.is_empty() {
        return Err(TrackerError::TemplateIncomplete {
            key: template_key.to_string(),
            missing,
        });
    }
    fields.retain(|id, _| REQUIRED_FIELDS.contains(&id.as_str()));
    Ok(fields)
}

/// Pulls the first `CI-<digits>` key out of a raw impacted-CI value.
pub fn extract_ci_key(raw: &JsonValue) -> Option<String> {
    let first = match raw {
        JsonValue::Array(items) => items.first()?,
        other => other,
    };
    let text = match first {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    };
    let re = Regex::new(r"CI-\d+").ok()?;
    re.find(&text).map(|m| m.as_str().to_string())
}

/// Impacted CI in the shape the create endpoint accepts: `[{"key": "CI-…"}]`.
pub async fn impacted_ci_field(
    tracker: &dyn IssueTracker,
    template_key: &str,
) -> Result<JsonValue, TrackerError> {
    let fields = tracker.issue_fields(template_key, &[FIELD_IMPACTED_CI]).await?;
    let raw = fields.get(FIELD_IMPACTED_CI).cloned().unwrap_or(JsonValue::Null);
    if is_blank(&raw) {
        return Err(TrackerError::MissingImpactedCi(template_key.to_string()));
    }
    let key = extract_ci_key(&raw).ok_or_else(|| TrackerError::UnparsableImpactedCi(raw.to_string()))?;
    Ok(json!([{ "key": key }]))
}

pub fn resolve_allowed_value_id(
    meta: &Map<String, JsonValue>,
    field_id: &str,
    label: &str,
) -> Result<String, TrackerError> {
    let wanted = label.trim().to_lowercase();
    let allowed = meta
        .get(field_id)
        .and_then(|f| f.get("allowedValues"))
        .and_then(JsonValue::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    for option in allowed {
        let option_label = option
            .get("value")
            .or_else(|| option.get("name"))
            .and_then(JsonValue::as_str)
            .unwrap_or_default();
        if option_label.trim().to_lowercase() == wanted {
            if let Some(id) = option.get("id") {
                return Ok(match id {
                    JsonValue::String(s) => s.clone(),
                    other => other.to_string(),
                });
            }
        }
    }
    Err(TrackerError::UnknownOption {
        field: field_id.to_string(),
        label: label.to_string(),
    })
}

#[async_trait]
pub trait NotificationSender: Send + Sync {
    /// Hands the message over; `send = false` leaves it as a draft.
    async fn deliver(&self, draft: &EmailDraft, send: bool) -> Result<PathBuf>;
}

#[derive(Debug, Serialize)]
struct Envelope<'a> {
    email_type: &'a str,
    to: &'a [String],
    cc: &'a [String],
    from: Option<&'a str>,
    subject: &'a str,
    draft: bool,
    html_file: String,
    created_at: chrono::DateTime<Utc>,
}

/// Writes each message as an HTML body plus a JSON envelope.
#[derive(Debug, Clone)]
pub struct OutboxSender {
    dir: PathBuf,
}

impl OutboxSender {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

pub fn subject_slug(subject: &str) -> String {
    let mut slug = String::with_capacity(subject.len());
    for ch in subject.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }
    slug.trim_matches('-').to_string()
}

#[async_trait]
impl NotificationSender for OutboxSender {
    async fn deliver(&self, draft: &EmailDraft, send: bool) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("creating outbox {}", self.dir.display()))?;

        let created_at = Utc::now();
        let stem = format!(
            "{}-{}",
            created_at.format("%Y%m%dT%H%M%S%3f"),
            subject_slug(&draft.subject)
        );
        let html_path = self.dir.join(format!("{stem}.html"));
        let envelope_path = self.dir.join(format!("{stem}.json"));

        tokio::fs::write(&html_path, draft.html_body.as_bytes())
            .await
            .with_context(|| format!("writing {}", html_path.display()))?;

        let envelope = Envelope {
            email_type: draft.email_type.as_str(),
            to: &draft.to,
            cc: &draft.cc,
            from: draft.from.as_deref(),
            subject: &draft.subject,
            draft: !send,
            html_file: format!("{stem}.html"),
            created_at,
        };
        tokio::fs::write(&envelope_path, serde_json::to_vec_pretty(&envelope)?)
            .await
            .with_context(|| format!("writing {}", envelope_path.display()))?;

        info!(path = %html_path.display(), draft = !send, "email written to outbox");
        Ok(html_path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

impl CommandSpec {
    /// Splits a whitespace-separated command line. `None` when blank.
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
            working_dir: None,
        })
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, command: &CommandSpec) -> Result<CommandOutput>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, command: &CommandSpec) -> Result<CommandOutput> {
        let mut process = tokio::process::Command::new(&command.program);
        process.args(&command.args);
        if let Some(dir) = &command.working_dir {
            process.current_dir(dir);
        }

        debug!(program = %command.program, args = ?command.args, "spawning command");
        let output = process
            .output()
            .await
            .with_context(|| format!("spawning {}", command.program))?;

        let exit_code = output.status.code().unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if !output.status.success() {
            let trimmed = stderr.trim();
            let tail = trimmed
                .char_indices()
                .rev()
                .nth(399)
                .map_or(trimmed, |(i, _)| &trimmed[i..]);
            bail!("{} failed with code {exit_code}: {tail}", command.program);
        }
        Ok(CommandOutput {
            exit_code,
            stdout,
            stderr,
        })
    }
}

fn sniff_delimiter(header_line: &str) -> u8 {
    if header_line.matches(';').count() > header_line.matches(',').count() {
        b';'
    } else {
        b','
    }
}

/// Reads the overview sheet exported as CSV.
///
/// `header_row` lines are skipped before the header record. The first column
/// holds the metric names; rows without one are dropped, as are columns that
/// are empty throughout.
pub async fn read_snapshot_csv(path: impl AsRef<Path>, header_row: usize) -> Result<ReconTable> {
    let path = path.as_ref();
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading snapshot export {}", path.display()))?;
    parse_snapshot_csv(&text, header_row, path)
}

fn parse_snapshot_csv(text: &str, header_row: usize, path: &Path) -> Result<ReconTable> {
    let text = text.trim_start_matches('\u{feff}');
    let body: Vec<&str> = text.lines().skip(header_row).collect();
    let Some(header_line) = body.first() else {
        bail!("snapshot export {} has no header row", path.display());
    };

    let delimiter = sniff_delimiter(header_line);
    let joined = body.join("\n");
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .delimiter(delimiter)
        .from_reader(joined.as_bytes());

    let mut records = reader.records();
    let header = match records.next() {
        Some(record) => record.with_context(|| format!("parsing header of {}", path.display()))?,
        None => bail!("snapshot export {} has no header row", path.display()),
    };
    let columns: Vec<String> = header.iter().skip(1).map(|s| s.trim().to_string()).collect();

    let mut index = Vec::new();
    let mut rows = Vec::new();
    for record in records {
        let record = record.with_context(|| format!("parsing {}", path.display()))?;
        let name = record.get(0).unwrap_or_default().trim();
        if name.is_empty() {
            continue;
        }
        let mut row: Vec<CellValue> = record
            .iter()
            .skip(1)
            .take(columns.len())
            .map(CellValue::parse)
            .collect();
        row.resize(columns.len(), CellValue::Empty);
        index.push(name.to_string());
        rows.push(row);
    }

    let table = ReconTable::new(index, columns, rows)
        .with_context(|| format!("building table from {}", path.display()))?;
    Ok(table.drop_empty_columns())
}
