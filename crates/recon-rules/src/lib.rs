//! Decision engine for the reconciliation routine.
//!
//! Everything here is a pure function over in-memory values: column label
//! normalization, comparison of the two latest snapshots, the email-type and
//! issue-creation rules, and the text the notification and ticket carry.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use recon_core::{CellValue, ColumnLabel, EmailType, JobRecord, Metric, ReconTable, SnapshotStatus, TableError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_NEAR_DUPLICATE_PERCENT: f64 = 80.0;
pub const DEFAULT_CUTOFF_HOUR_UTC: u32 = 6;
/// Number of trailing dated columns the ticket rule and description look at.
pub const ISSUE_WINDOW_COLUMNS: usize = 4;

const DATE_FORMATS: &[&str] = &[
    "%d-%m-%Y", "%d/%m/%Y", "%d.%m.%Y", "%Y-%m-%d", "%Y/%m/%d", "%d-%m-%y", "%d/%m/%y", "%d.%m.%y",
];
const DATETIME_FORMATS: &[&str] = &[
    "%d-%m-%Y %H:%M:%S",
    "%d-%m-%Y %H:%M",
    "%d/%m/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M",
    "%d.%m.%Y %H:%M:%S",
    "%d.%m.%Y %H:%M",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%d-%m-%y %H:%M:%S",
    "%d-%m-%y %H:%M",
    "%d/%m/%y %H:%M:%S",
    "%d/%m/%y %H:%M",
    "%d.%m.%y %H:%M:%S",
    "%d.%m.%y %H:%M",
];
/// `%Y` also takes short years literally (`25` as year 25); such matches are
/// discarded so the `%y` formats can read them as 2025.
const MIN_YEAR: i32 = 1000;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RulesError {
    #[error("snapshot comparison needs at least two columns, found {0}")]
    NotEnoughColumns(usize),
    #[error("cannot determine operating date from last column `{0}`")]
    OperatingDate(String),
    #[error(transparent)]
    Table(#[from] TableError),
}

/// Explicit knobs for the decision rules, built once from configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecisionConfig {
    pub cutoff: NaiveTime,
    pub near_duplicate_percent: f64,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            cutoff: NaiveTime::from_hms_opt(DEFAULT_CUTOFF_HOUR_UTC, 0, 0)
                .unwrap_or(NaiveTime::MIN),
            near_duplicate_percent: DEFAULT_NEAR_DUPLICATE_PERCENT,
        }
    }
}

// ---------------------------------------------------------------------------
// Column labels
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LabelPolicy {
    /// Keep only the first whitespace-separated token of non-date labels.
    pub strip_after_space: bool,
}

impl LabelPolicy {
    pub fn strip_time() -> Self {
        Self {
            strip_after_space: true,
        }
    }
}

/// Day-first date parse; accepts a trailing time of day.
pub fn parse_day_first(text: &str) -> Option<NaiveDate> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    let plausible = |date: &NaiveDate| date.year() >= MIN_YEAR;
    DATE_FORMATS
        .iter()
        .filter_map(|fmt| NaiveDate::parse_from_str(text, fmt).ok())
        .find(plausible)
        .or_else(|| {
            DATETIME_FORMATS
                .iter()
                .filter_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
                .map(|dt| dt.date())
                .find(plausible)
        })
}

pub fn format_ddmmyyyy(date: NaiveDate) -> String {
    date.format("%d-%m-%Y").to_string()
}

/// `YYYY-MM-DD`, the key format of the on-disk state.
pub fn date_key(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

fn canonical_label(label: &ColumnLabel, policy: LabelPolicy) -> String {
    match label {
        ColumnLabel::Date(date) => format_ddmmyyyy(*date),
        ColumnLabel::DateTime(dt) => format_ddmmyyyy(dt.date()),
        ColumnLabel::Text(text) => {
            let text = text.trim();
            if let Some(date) = parse_day_first(text) {
                return format_ddmmyyyy(date);
            }
            if !policy.strip_after_space {
                return text.to_string();
            }
            let first = text.split_whitespace().next().unwrap_or_default();
            parse_day_first(first)
                .map(format_ddmmyyyy)
                .unwrap_or_else(|| first.to_string())
        }
    }
}

/// Appends `.1`, `.2`, ... to repeated labels. A suffixed label that is
/// already taken moves on to the next counter value.
fn make_unique(bases: Vec<String>) -> Vec<String> {
    let mut counters: HashMap<String, usize> = HashMap::new();
    let mut taken: HashSet<String> = HashSet::with_capacity(bases.len());
    let mut out = Vec::with_capacity(bases.len());

    for base in bases {
        let label = if taken.contains(&base) {
            let counter = counters.entry(base.clone()).or_insert(0);
            loop {
                *counter += 1;
                let candidate = format!("{base}.{counter}");
                if !taken.contains(&candidate) {
                    break candidate;
                }
            }
        } else {
            base
        };
        taken.insert(label.clone());
        out.push(label);
    }

    out
}

/// Canonicalizes column labels to `DD-MM-YYYY` where they parse as dates and
/// keeps them pairwise distinct. Output order and length match the input.
pub fn normalize_column_labels(labels: &[ColumnLabel], policy: LabelPolicy) -> Vec<String> {
    make_unique(labels.iter().map(|l| canonical_label(l, policy)).collect())
}

/// Splits a trailing `.N` uniqueness suffix off a label.
fn strip_copy_suffix(label: &str) -> &str {
    match label.rsplit_once('.') {
        Some((head, tail)) if !tail.is_empty() && tail.bytes().all(|b| b.is_ascii_digit()) => head,
        _ => label,
    }
}

/// Human display form of a normalized label: dates as `DD-MM-YYYY`, copy
/// suffixes removed.
pub fn display_label(label: &str) -> String {
    let label = label.trim();
    if let Some(date) = parse_day_first(label) {
        return format_ddmmyyyy(date);
    }
    let base = strip_copy_suffix(label);
    parse_day_first(base)
        .map(format_ddmmyyyy)
        .unwrap_or_else(|| base.to_string())
}

/// Operating date of a report: the date of its last column.
pub fn operating_date(table: &ReconTable) -> Result<NaiveDate, RulesError> {
    let last = table
        .columns()
        .last()
        .ok_or_else(|| RulesError::OperatingDate(String::new()))?;
    parse_day_first(last)
        .or_else(|| parse_day_first(strip_copy_suffix(last.trim())))
        .ok_or_else(|| RulesError::OperatingDate(last.clone()))
}

// ---------------------------------------------------------------------------
// Snapshot comparison
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowDifference {
    pub metric: String,
    pub previous: CellValue,
    pub latest: CellValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotCheck {
    pub status: SnapshotStatus,
    pub equal_percent: f64,
    pub previous: String,
    pub latest: String,
    pub differences: Vec<RowDifference>,
    /// Input table with normalized column labels.
    pub table: ReconTable,
}

/// Compares the two latest columns row by row on a numeric basis. Missing or
/// non-numeric cells never compare equal.
pub fn compare_snapshots(table: &ReconTable, threshold_percent: f64) -> Result<SnapshotCheck, RulesError> {
    let n_columns = table.n_columns();
    if n_columns < 2 {
        return Err(RulesError::NotEnoughColumns(n_columns));
    }
    let (prev_idx, last_idx) = (n_columns - 2, n_columns - 1);

    let mut equal = 0usize;
    let mut differences = Vec::new();
    for (name, row) in table.index().iter().zip(table.rows()) {
        let (previous, latest) = (&row[prev_idx], &row[last_idx]);
        match (previous.to_numeric(), latest.to_numeric()) {
            (Some(a), Some(b)) if a == b => equal += 1,
            _ => differences.push(RowDifference {
                metric: name.clone(),
                previous: previous.clone(),
                latest: latest.clone(),
            }),
        }
    }

    let rows = table.n_rows();
    let equal_percent = if rows == 0 {
        0.0
    } else {
        equal as f64 * 100.0 / rows as f64
    };
    let status = if rows > 0 && equal == rows {
        SnapshotStatus::Duplicate
    } else if rows > 0 && equal as f64 * 100.0 >= threshold_percent * rows as f64 {
        SnapshotStatus::NearDuplicate
    } else {
        SnapshotStatus::Ok
    };

    let labels: Vec<ColumnLabel> = table.columns().iter().map(|c| ColumnLabel::from(c.as_str())).collect();
    let normalized = normalize_column_labels(&labels, LabelPolicy::strip_time());
    let table = table.clone().with_columns(normalized)?;

    Ok(SnapshotCheck {
        status,
        equal_percent,
        previous: table.columns()[prev_idx].clone(),
        latest: table.columns()[last_idx].clone(),
        differences,
        table,
    })
}

// ---------------------------------------------------------------------------
// Decisions
// ---------------------------------------------------------------------------

/// Classifies the run from per-job status and the time of day.
///
/// An empty job list counts as "every job is OK" and yields `Full`.
pub fn decide_email_type(
    jobs: &[JobRecord],
    override_cutoff: bool,
    now: DateTime<Utc>,
    config: &DecisionConfig,
) -> EmailType {
    if jobs.iter().all(JobRecord::is_ok) {
        return EmailType::Full;
    }
    let before_cutoff = now.time() < config.cutoff;
    if before_cutoff && !override_cutoff {
        return EmailType::Wait;
    }
    if jobs.iter().all(|job| !job.is_ok()) {
        return EmailType::FlowStopped;
    }
    EmailType::Partial
}

/// True when a ticket must be filed for the report. Any doubt about the data
/// (no data, a missing metric, a non-numeric value) files one.
pub fn should_create_issue(table: &ReconTable) -> bool {
    let window = table.last_columns(ISSUE_WINDOW_COLUMNS);
    if window.is_empty() {
        return true;
    }
    let last = window.n_columns() - 1;

    let mut any_nonzero = false;
    for metric in Metric::ALL {
        let mut seen = false;
        for row in window.rows_named(metric.as_str()) {
            seen = true;
            let Some(value) = row.get(last).and_then(CellValue::to_numeric) else {
                return true;
            };
            any_nonzero |= value != 0.0;
        }
        if !seen {
            return true;
        }
    }
    any_nonzero
}

// ---------------------------------------------------------------------------
// Input validation
// ---------------------------------------------------------------------------

/// Canonical `PROJECT-NNNNNN` key when the input matches the project prefix
/// followed by six digits.
pub fn validate_issue_key(input: &str, project: &str) -> Option<String> {
    let (prefix, digits) = input.trim().split_once('-')?;
    if !prefix.eq_ignore_ascii_case(project.trim())
        || digits.len() != 6
        || !digits.bytes().all(|b| b.is_ascii_digit())
    {
        return None;
    }
    Some(format!("{}-{digits}", project.trim().to_ascii_uppercase()))
}

pub fn validate_date(input: &str) -> Option<String> {
    NaiveDate::parse_from_str(input.trim(), "%d-%m-%Y")
        .ok()
        .map(format_ddmmyyyy)
}

// ---------------------------------------------------------------------------
// Ticket and notification text
// ---------------------------------------------------------------------------

pub fn issue_summary(env_label: &str) -> String {
    format!("{env_label} | CSD | ES-CPH | Reconciliation | Detected errors on Reconciliation at 08:00 CET")
}

/// Ticket description in wiki markup: a grand-totals table over the last
/// four columns, one row per metric row of the report (a repeated metric is
/// listed once per occurrence). Missing values render as 0.
pub fn issue_description(table: &ReconTable, operating_date: &str) -> String {
    let window = table.last_columns(ISSUE_WINDOW_COLUMNS);
    let mut lines = vec![
        "Hello everyone,".to_string(),
        String::new(),
        format!(
            "In attachment is the excel with the report for the reconciliation CPH for {operating_date} and the raw files."
        ),
        String::new(),
        "*Grand Totals*".to_string(),
        String::new(),
        format!("|| ||{}||", window.columns().join("||")),
    ];

    for metric in Metric::ALL {
        let mut rows: Vec<Vec<String>> = window
            .rows_named(metric.as_str())
            .map(|cells| {
                cells
                    .iter()
                    .map(|cell| (cell.to_numeric().unwrap_or(0.0) as i64).to_string())
                    .collect()
            })
            .collect();
        if rows.is_empty() {
            rows.push(vec!["0".to_string(); window.n_columns()]);
        }
        for values in rows {
            lines.push(format!("|{}|{}|", metric.jira_label(), values.join("|")));
        }
    }

    lines.push(String::new());
    lines.join("\n")
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

/// `<ul>` of every job that is not OK, or an empty string when all are.
pub fn missing_jobs_html(jobs: &[JobRecord]) -> String {
    let items: Vec<String> = jobs
        .iter()
        .filter(|job| !job.is_ok())
        .map(|job| {
            format!(
                "<li>{} ({}) – RC: {}</li>",
                escape_html(&job.job),
                escape_html(&job.job_id),
                escape_html(job.rc_display())
            )
        })
        .collect();
    if items.is_empty() {
        return String::new();
    }
    format!("<ul>{}</ul>", items.concat())
}

pub fn table_html(table: &ReconTable) -> String {
    let mut html = String::from("<table border=\"1\">\n<thead><tr><th></th>");
    for column in table.columns() {
        html.push_str(&format!("<th>{}</th>", escape_html(column)));
    }
    html.push_str("</tr></thead>\n<tbody>\n");
    for (name, row) in table.index().iter().zip(table.rows()) {
        html.push_str(&format!("<tr><th>{}</th>", escape_html(name)));
        for cell in row {
            html.push_str(&format!("<td>{}</td>", escape_html(&cell.to_string())));
        }
        html.push_str("</tr>\n");
    }
    html.push_str("</tbody>\n</table>");
    html
}

const EMAIL_CSS: &str = "<style>\ntable {border-collapse: collapse;}\ntable th, table td {border: 1px solid #555; padding: 4px 8px; text-align: center;}\n</style>";

pub fn email_subject(email_type: EmailType, folder: &str, operating_date: &str) -> String {
    let title = match email_type {
        EmailType::Partial => "Reconciliation (Partial)",
        EmailType::FlowStopped => "Reconciliation NOT Executed",
        EmailType::Full | EmailType::Wait => "Reconciliation",
    };
    format!("[ES Operations] {title} {folder} CPH Report - {operating_date}")
}

#[derive(Debug, Clone)]
pub struct EmailContext<'a> {
    pub email_type: EmailType,
    pub folder: &'a str,
    pub operating_date: &'a str,
    pub issue_key: Option<&'a str>,
    pub issue_url: Option<&'a str>,
    pub jobs: &'a [JobRecord],
    pub cutoff: NaiveTime,
    pub table: Option<&'a ReconTable>,
    pub to: &'a [String],
    pub cc: &'a [String],
    pub from: Option<&'a str>,
    pub signature: &'a str,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailDraft {
    pub email_type: EmailType,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub from: Option<String>,
    pub subject: String,
    pub html_body: String,
}

fn issue_reference(ctx: &EmailContext<'_>) -> String {
    match (ctx.issue_key, ctx.issue_url) {
        (Some(key), Some(url)) => format!("<a href=\"{}\">{}</a>", escape_html(url), escape_html(key)),
        (Some(key), None) => escape_html(key),
        _ => "the reconciliation ticket".to_string(),
    }
}

/// Builds the status notification. `Wait` means nothing is sent yet.
pub fn compose_email(ctx: &EmailContext<'_>) -> Option<EmailDraft> {
    let date = escape_html(ctx.operating_date);
    let report_line = format!(
        "<p>Please find in {} the report for the reconciliation CPH for {date} and the raw files.</p>",
        issue_reference(ctx)
    );

    let intro = match ctx.email_type {
        EmailType::Wait => return None,
        EmailType::Full => format!("<p>All legacy jobs executed successfully.</p>\n{report_line}"),
        EmailType::Partial => format!(
            "<p>Some legacy jobs did not run before {} GMT.</p>\n\
             <p>The reconciliation was executed with partial data.</p>\n\
             <p>Missing jobs:</p>\n{}\n\
             <p>An update will be sent as soon as the flow is completed.</p>\n{report_line}",
            ctx.cutoff.format("%H:%M"),
            missing_jobs_html(ctx.jobs)
        ),
        EmailType::FlowStopped => format!(
            "<p>The reconciliation could not be executed as the legacy flow is stopped.</p>\n\
             <p>Jobs not executed:</p>\n{}\n\
             <p>An update will be sent as soon as the flow is restored.</p>",
            missing_jobs_html(ctx.jobs)
        ),
    };

    let table = ctx.table.map(table_html).unwrap_or_default();
    let html_body = format!(
        "{EMAIL_CSS}\n<p>Hello everyone,</p>\n{intro}\n{table}\n<p>{}</p>\n",
        ctx.signature
    );

    Some(EmailDraft {
        email_type: ctx.email_type,
        to: ctx.to.to_vec(),
        cc: ctx.cc.to_vec(),
        from: ctx.from.map(str::to_string),
        subject: email_subject(ctx.email_type, ctx.folder, ctx.operating_date),
        html_body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use recon_core::JobStatus;

    fn text_labels(labels: &[&str]) -> Vec<ColumnLabel> {
        labels.iter().map(|l| ColumnLabel::from(*l)).collect()
    }

    fn metric_table(columns: &[&str], values: &[&[f64]]) -> ReconTable {
        ReconTable::new(
            Metric::ALL.iter().map(|m| m.as_str().to_string()).collect(),
            columns.iter().map(|c| c.to_string()).collect(),
            values
                .iter()
                .map(|row| row.iter().map(|v| CellValue::Number(*v)).collect())
                .collect(),
        )
        .expect("metric table")
    }

    fn two_column_table(previous: &[f64], latest: &[f64]) -> ReconTable {
        let index = (0..previous.len()).map(|i| format!("row{i}")).collect();
        let rows = previous
            .iter()
            .zip(latest)
            .map(|(a, b)| vec![CellValue::Number(*a), CellValue::Number(*b)])
            .collect();
        ReconTable::new(index, vec!["17-11-2025".into(), "18-11-2025 08:00".into()], rows)
            .expect("two column table")
    }

    fn job(status: JobStatus) -> JobRecord {
        JobRecord::new("SETTERR", "P201773A", status, None)
    }

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 5, hour, 0, 0).single().expect("ts")
    }

    #[test]
    fn dates_are_canonicalized_and_repeats_suffixed() {
        let labels = vec![
            ColumnLabel::from("17/11/2025"),
            ColumnLabel::from("2025-11-17 00:00:00"),
            ColumnLabel::from(" Notes "),
            ColumnLabel::from("Notes"),
            ColumnLabel::Date(NaiveDate::from_ymd_opt(2025, 11, 18).expect("date")),
            ColumnLabel::from("18.11.2025"),
        ];
        let out = normalize_column_labels(&labels, LabelPolicy::default());
        assert_eq!(
            out,
            ["17-11-2025", "17-11-2025.1", "Notes", "Notes.1", "18-11-2025", "18-11-2025.1"]
        );
    }

    #[test]
    fn strip_variant_drops_trailing_text() {
        let labels = text_labels(&["18-11-2025 rerun", "Total amount", "Total"]);
        assert_eq!(
            normalize_column_labels(&labels, LabelPolicy::strip_time()),
            ["18-11-2025", "Total", "Total.1"]
        );
        assert_eq!(
            normalize_column_labels(&labels, LabelPolicy::default()),
            ["18-11-2025 rerun", "Total amount", "Total"]
        );
    }

    #[test]
    fn normalized_labels_stay_distinct() {
        let cases: &[&[&str]] = &[
            &["a", "a", "a.1"],
            &["a.1", "a", "a"],
            &["x", "x", "x", "x.2", "x.1"],
            &["01-02-2025", "1/2/2025", "2025-02-01", "01-02-2025.1"],
            &[],
        ];
        for labels in cases {
            let out = normalize_column_labels(&text_labels(labels), LabelPolicy::strip_time());
            assert_eq!(out.len(), labels.len(), "{labels:?}");
            let unique: HashSet<_> = out.iter().collect();
            assert_eq!(unique.len(), out.len(), "{labels:?} -> {out:?}");
        }
        let out = normalize_column_labels(&text_labels(&["a", "a", "a.1"]), LabelPolicy::default());
        assert_eq!(out, ["a", "a.1", "a.1.1"]);
    }

    #[test]
    fn two_digit_years_read_as_current_century() {
        assert_eq!(parse_day_first("17-11-25"), NaiveDate::from_ymd_opt(2025, 11, 17));
        assert_eq!(parse_day_first("17.11.25 08:00"), NaiveDate::from_ymd_opt(2025, 11, 17));
        assert_eq!(parse_day_first("2025-11-17"), NaiveDate::from_ymd_opt(2025, 11, 17));
        let out = normalize_column_labels(
            &text_labels(&["17-11-25", "17/11/2025 08:00"]),
            LabelPolicy::strip_time(),
        );
        assert_eq!(out, ["17-11-2025", "17-11-2025.1"]);
    }

    #[test]
    fn unparseable_dates_stay_opaque() {
        assert_eq!(parse_day_first("31-02-2025"), None);
        assert_eq!(parse_day_first("17-11-2025.1"), None);
        assert_eq!(
            parse_day_first("05/01/2026"),
            NaiveDate::from_ymd_opt(2026, 1, 5)
        );
        assert_eq!(display_label("17-11-2025.1"), "17-11-2025");
        assert_eq!(display_label("Total.2"), "Total");
    }

    #[test]
    fn identical_columns_are_duplicates() {
        let check = compare_snapshots(&two_column_table(&[1.0, 2.0, 3.0], &[1.0, 2.0, 3.0]), 80.0)
            .expect("check");
        assert_eq!(check.status, SnapshotStatus::Duplicate);
        assert_eq!(check.equal_percent, 100.0);
        assert!(check.differences.is_empty());
        assert_eq!(check.table.columns(), ["17-11-2025", "18-11-2025"]);
        assert_eq!(check.latest, "18-11-2025");
    }

    #[test]
    fn eighty_percent_equal_is_near_duplicate() {
        let check = compare_snapshots(
            &two_column_table(&[1.0, 2.0, 3.0, 4.0, 5.0], &[1.0, 2.0, 3.0, 4.0, 9.0]),
            80.0,
        )
        .expect("check");
        assert_eq!(check.status, SnapshotStatus::NearDuplicate);
        assert_eq!(check.differences.len(), 1);
        assert_eq!(check.differences[0].metric, "row4");
        assert_eq!(check.differences[0].latest, CellValue::Number(9.0));
    }

    #[test]
    fn disjoint_columns_are_ok() {
        let check = compare_snapshots(&two_column_table(&[1.0, 2.0], &[3.0, 4.0]), 80.0).expect("check");
        assert_eq!(check.status, SnapshotStatus::Ok);
        assert_eq!(check.differences.len(), 2);
    }

    #[test]
    fn missing_values_never_match() {
        let table = ReconTable::new(
            vec!["Settled".into(), "Pending".into()],
            vec!["a".into(), "b".into()],
            vec![
                vec![CellValue::Empty, CellValue::Empty],
                vec![CellValue::Text("n/a".into()), CellValue::Text("n/a".into())],
            ],
        )
        .expect("table");
        let check = compare_snapshots(&table, 80.0).expect("check");
        assert_eq!(check.status, SnapshotStatus::Ok);
        assert_eq!(check.equal_percent, 0.0);
    }

    #[test]
    fn comparison_needs_two_columns() {
        let table = metric_table(&["a"], &[&[0.0], &[0.0], &[0.0], &[0.0], &[0.0], &[0.0]]);
        assert_eq!(compare_snapshots(&table, 80.0), Err(RulesError::NotEnoughColumns(1)));
    }

    #[test]
    fn email_type_decision_table() {
        use EmailType::*;
        use JobStatus::{NotOk, Ok as Good};

        let config = DecisionConfig::default();
        let cases: &[(&[JobStatus], bool, u32, EmailType)] = &[
            (&[Good, Good], false, 5, Full),
            (&[Good, Good], false, 7, Full),
            (&[NotOk, NotOk], false, 5, Wait),
            (&[NotOk, NotOk], false, 7, FlowStopped),
            (&[NotOk, NotOk], true, 5, FlowStopped),
            (&[Good, NotOk], false, 5, Wait),
            (&[Good, NotOk], false, 7, Partial),
            (&[Good, NotOk], true, 5, Partial),
            (&[NotOk], false, 6, FlowStopped),
            (&[], false, 5, Full),
        ];
        for (statuses, override_cutoff, hour, expected) in cases {
            let jobs: Vec<_> = statuses.iter().map(|s| job(*s)).collect();
            assert_eq!(
                decide_email_type(&jobs, *override_cutoff, at(*hour), &config),
                *expected,
                "{statuses:?} override={override_cutoff} hour={hour}"
            );
        }
    }

    #[test]
    fn issue_rule_all_zero_means_no_ticket() {
        let row: &[f64] = &[5.0, 0.0];
        let table = metric_table(&["01-01-2026", "02-01-2026"], &[row; 6]);
        assert!(!should_create_issue(&table));
    }

    #[test]
    fn issue_rule_any_nonzero_files_ticket() {
        let zero: &[f64] = &[0.0, 0.0];
        let table = metric_table(
            &["01-01-2026", "02-01-2026"],
            &[zero, zero, zero, zero, &[0.0, 3.0], zero],
        );
        assert!(should_create_issue(&table));
    }

    #[test]
    fn issue_rule_is_fail_safe() {
        assert!(should_create_issue(&ReconTable::default()));

        let missing_metric = ReconTable::new(
            vec!["Settled".into()],
            vec!["01-01-2026".into()],
            vec![vec![CellValue::Number(0.0)]],
        )
        .expect("table");
        assert!(should_create_issue(&missing_metric));

        let mut rows: Vec<Vec<CellValue>> = (0..6).map(|_| vec![CellValue::Number(0.0)]).collect();
        rows[3] = vec![CellValue::Text("#REF!".into())];
        let non_numeric = ReconTable::new(
            Metric::ALL.iter().map(|m| m.as_str().to_string()).collect(),
            vec!["01-01-2026".into()],
            rows,
        )
        .expect("table");
        assert!(should_create_issue(&non_numeric));
    }

    #[test]
    fn repeated_metric_row_is_checked_too() {
        let mut index: Vec<String> = Metric::ALL.iter().map(|m| m.as_str().to_string()).collect();
        index.push("Settled".into());
        let mut rows: Vec<Vec<CellValue>> = (0..6).map(|_| vec![CellValue::Number(0.0)]).collect();
        rows.push(vec![CellValue::Number(7.0)]);
        let table = ReconTable::new(index, vec!["01-01-2026".into()], rows).expect("table");
        assert!(should_create_issue(&table));

        let text = issue_description(&table, "01-01-2026");
        let settled: Vec<&str> = text.lines().filter(|l| l.starts_with("|Settled Events|")).collect();
        assert_eq!(settled, ["|Settled Events|0|", "|Settled Events|7|"]);
    }

    #[test]
    fn operating_date_comes_from_last_column() {
        let zero: &[f64] = &[0.0, 0.0];
        let table = metric_table(&["16-11-2025", "17-11-2025.1"], &[zero; 6]);
        let date = operating_date(&table).expect("date");
        assert_eq!(format_ddmmyyyy(date), "17-11-2025");
        assert_eq!(date_key(date), "2025-11-17");

        let bad = metric_table(&["16-11-2025", "Total"], &[zero; 6]);
        assert!(matches!(operating_date(&bad), Err(RulesError::OperatingDate(label)) if label == "Total"));
    }

    #[test]
    fn input_validators() {
        assert_eq!(validate_issue_key(" evt-071315 ", "EVT"), Some("EVT-071315".into()));
        assert_eq!(validate_issue_key("EVT-71315", "EVT"), None);
        assert_eq!(validate_issue_key("ABC-071315", "EVT"), None);
        assert_eq!(validate_date("4-1-2026"), Some("04-01-2026".into()));
        assert_eq!(validate_date("2026-01-04"), None);
    }

    #[test]
    fn description_renders_last_four_columns() {
        let row: Vec<CellValue> = [9.0, 0.0, 0.0, 0.0, 1.0].into_iter().map(CellValue::Number).collect();
        let index: Vec<String> = Metric::ALL
            .iter()
            .filter(|m| **m != Metric::Holdings)
            .map(|m| m.as_str().to_string())
            .collect();
        let table = ReconTable::new(
            index,
            ["01-01-2026", "02-01-2026", "03-01-2026", "04-01-2026", "05-01-2026"]
                .iter()
                .map(|c| c.to_string())
                .collect(),
            vec![row; 5],
        )
        .expect("table");

        let text = issue_description(&table, "05-01-2026");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "Hello everyone,");
        assert!(lines[2].contains("for 05-01-2026 and the raw files"));
        assert_eq!(lines[4], "*Grand Totals*");
        assert_eq!(lines[6], "|| ||02-01-2026||03-01-2026||04-01-2026||05-01-2026||");
        assert_eq!(lines[7], "|Settled Events|0|0|0|1|");
        assert_eq!(lines[11], "|Holdings|0|0|0|0|");
        assert!(text.ends_with('\n'));
    }

    #[test]
    fn summary_carries_environment_label() {
        assert_eq!(
            issue_summary("PROD"),
            "PROD | CSD | ES-CPH | Reconciliation | Detected errors on Reconciliation at 08:00 CET"
        );
    }

    #[test]
    fn missing_jobs_list_only_failed_jobs() {
        let jobs = vec![
            JobRecord::new("ACCTERR", "P201767A", JobStatus::Ok, Some("0".into())),
            JobRecord::new("HOLDERR", "P201769A", JobStatus::NotOk, None),
            JobRecord::new("ISINERR", "P201766A", JobStatus::NotOk, Some("12".into())),
        ];
        assert_eq!(
            missing_jobs_html(&jobs),
            "<ul><li>HOLDERR (P201769A) – RC: Not Run</li><li>ISINERR (P201766A) – RC: 12</li></ul>"
        );
        assert_eq!(missing_jobs_html(&jobs[..1]), "");
    }

    #[test]
    fn email_composition_follows_email_type() {
        let jobs = vec![job(JobStatus::NotOk)];
        let to = vec!["ops@example.com".to_string()];
        let mut ctx = EmailContext {
            email_type: EmailType::Partial,
            folder: "PROD",
            operating_date: "05-01-2026",
            issue_key: Some("EVT-110442"),
            issue_url: Some("https://jira.example.com/browse/EVT-110442"),
            jobs: &jobs,
            cutoff: DecisionConfig::default().cutoff,
            table: None,
            to: &to,
            cc: &[],
            from: None,
            signature: "Kind regards,<br>ES Operations",
        };

        let draft = compose_email(&ctx).expect("partial draft");
        assert_eq!(draft.subject, "[ES Operations] Reconciliation (Partial) PROD CPH Report - 05-01-2026");
        assert!(draft.html_body.contains("SETTERR (P201773A) – RC: Not Run"));
        assert!(draft.html_body.contains("did not run before 06:00 GMT"));
        assert!(draft.html_body.contains("href=\"https://jira.example.com/browse/EVT-110442\""));

        ctx.email_type = EmailType::FlowStopped;
        let draft = compose_email(&ctx).expect("flow stopped draft");
        assert_eq!(draft.subject, "[ES Operations] Reconciliation NOT Executed PROD CPH Report - 05-01-2026");
        assert!(!draft.html_body.contains("EVT-110442"));

        ctx.email_type = EmailType::Wait;
        assert!(compose_email(&ctx).is_none());
    }
}
