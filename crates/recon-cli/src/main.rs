use std::path::PathBuf;

use anyhow::Result;
use chrono::Utc;
use clap::{ArgGroup, Parser, Subcommand};
use recon_core::JobStatus;
use recon_workflow::{evidence_in_dir, AttachmentReceipt, EmailOutcome, EmailRequest, IssueOutcome, ReconWorkflow};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "recon")]
#[command(about = "CPH securities reconciliation automation")]
#[command(group(ArgGroup::new("verbosity").args(["quiet", "verbose"])))]
struct Cli {
    /// Only log errors.
    #[arg(long, short, global = true)]
    quiet: bool,
    /// Log debug detail.
    #[arg(long, short, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the legacy batch command.
    RunBatch,
    /// Run the report macro for an environment.
    RunMacro {
        #[arg(long)]
        env: String,
    },
    /// Record that the report was refreshed by hand.
    MarkMacroDone {
        #[arg(long)]
        env: String,
    },
    /// Record the outcome of one legacy job.
    SetJob {
        #[arg(long)]
        env: String,
        #[arg(long)]
        job: String,
        #[arg(long)]
        status: JobStatus,
        #[arg(long)]
        rc: Option<String>,
    },
    /// Show the legacy jobs of an environment.
    Jobs {
        #[arg(long)]
        env: String,
    },
    /// Compare the two latest report snapshots.
    Validate {
        #[arg(long)]
        env: String,
    },
    /// File a ticket when the report shows errors, attaching evidence.
    FileIssue {
        #[arg(long)]
        env: String,
        #[arg(long = "file")]
        files: Vec<PathBuf>,
        /// Attach every file in this directory.
        #[arg(long)]
        evidence_dir: Option<PathBuf>,
    },
    /// Attach evidence again to today's ticket.
    RetryAttachments {
        #[arg(long)]
        env: String,
        #[arg(long = "file")]
        files: Vec<PathBuf>,
        #[arg(long)]
        evidence_dir: Option<PathBuf>,
    },
    /// Decide and write the status email.
    PrepareEmail {
        #[arg(long)]
        env: String,
        #[arg(long)]
        issue: Option<String>,
        /// Operating date as DD-MM-YYYY.
        #[arg(long)]
        date: Option<String>,
        #[arg(long)]
        override_cutoff: bool,
        /// Mark the message for sending instead of leaving a draft.
        #[arg(long)]
        send: bool,
    },
    /// Summarize today's progress.
    Status,
    /// Drop job history past the retention window.
    Prune,
}

fn init_tracing(cli: &Cli) {
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else if cli.quiet {
        EnvFilter::new("error")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn collect_files(mut files: Vec<PathBuf>, dir: Option<PathBuf>) -> Result<Vec<PathBuf>> {
    if let Some(dir) = dir {
        files.extend(evidence_in_dir(&dir).await?);
    }
    Ok(files)
}

fn print_receipts(receipts: &[AttachmentReceipt]) {
    for receipt in receipts {
        println!(
            "  {} -> attachment {} ({} bytes, sha256 {}{})",
            receipt.file_name,
            receipt.attachment_id,
            receipt.byte_size,
            &receipt.content_hash[..receipt.content_hash.len().min(12)],
            if receipt.deduplicated { ", already archived" } else { "" }
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);

    let workflow = ReconWorkflow::from_env().await?;
    tracing::debug!(command = ?cli.command, "dispatching");

    match cli.command {
        Commands::RunBatch => {
            let finished_at = workflow.run_batch().await?;
            println!("batch complete at {finished_at}");
        }
        Commands::RunMacro { env } => {
            workflow.run_macro(&env).await?;
            println!("macro complete for {env}");
        }
        Commands::MarkMacroDone { env } => {
            workflow.mark_macro_done(&env).await?;
            println!("macro marked done for {env}");
        }
        Commands::SetJob {
            env,
            job,
            status,
            rc,
        } => {
            let record = workflow.set_job_status(&env, &job, status, rc.as_deref()).await?;
            println!(
                "{} ({}) -> {} rc={}",
                record.job,
                record.job_id,
                record.status,
                record.rc_display()
            );
        }
        Commands::Jobs { env } => {
            for job in workflow.job_snapshot(&env).await? {
                println!(
                    "{:<10} {:<10} {:<7} {}",
                    job.job,
                    job.job_id,
                    job.status.as_str(),
                    job.rc_display()
                );
            }
        }
        Commands::Validate { env } => {
            let report = workflow.validate(&env).await?;
            println!(
                "{env}: {} ({:.1}% equal, {} vs {}), operating date {}",
                report.status,
                report.equal_percent,
                report.previous,
                report.latest,
                report.operating_date.format("%d-%m-%Y")
            );
            for diff in &report.differences {
                println!("  {}: {} -> {}", diff.metric, diff.previous, diff.latest);
            }
        }
        Commands::FileIssue {
            env,
            files,
            evidence_dir,
        } => {
            let files = collect_files(files, evidence_dir).await?;
            match workflow.file_issue(&env, &files).await? {
                IssueOutcome::NotNeeded => println!("{env}: all metrics are zero, no ticket filed"),
                IssueOutcome::Created {
                    issue_key,
                    attachments,
                } => {
                    println!("{env}: created {issue_key} with {} attachment(s)", attachments.len());
                    print_receipts(&attachments);
                    if let Some(url) = workflow.config().jira.browse_url(&issue_key) {
                        println!("{url}");
                    }
                }
            }
        }
        Commands::RetryAttachments {
            env,
            files,
            evidence_dir,
        } => {
            let files = collect_files(files, evidence_dir).await?;
            let receipts = workflow.retry_attachments(&env, &files).await?;
            println!("{env}: attached {} file(s)", receipts.len());
            print_receipts(&receipts);
        }
        Commands::PrepareEmail {
            env,
            issue,
            date,
            override_cutoff,
            send,
        } => {
            let request = EmailRequest {
                env: &env,
                issue_key: issue.as_deref(),
                date: date.as_deref(),
                override_cutoff,
                now: Utc::now(),
                send,
            };
            match workflow.prepare_email(&request).await? {
                EmailOutcome::Wait { pending_jobs } => {
                    println!("{env}: waiting for {} before the cutoff", pending_jobs.join(", "));
                }
                EmailOutcome::Prepared {
                    email_type,
                    subject,
                    path,
                    sent,
                } => {
                    let mode = if sent { "queued" } else { "drafted" };
                    println!("{env}: {email_type} email {mode}: {subject}");
                    println!("{}", path.display());
                }
            }
        }
        Commands::Status => {
            let status = workflow.status().await?;
            println!(
                "day {} batch={} operating_date={}",
                status.run_date_key.as_deref().unwrap_or("-"),
                if status.batch_done { "done" } else { "pending" },
                status
                    .operating_date
                    .map(|d| d.format("%d-%m-%Y").to_string())
                    .unwrap_or_else(|| "-".to_string())
            );
            for env in status.environments {
                println!(
                    "  {:<6} macro={:<5} validated={:<5} jobs={}/{} issue={}",
                    env.name,
                    env.macro_done,
                    env.validated,
                    env.jobs_ok,
                    env.jobs_total,
                    env.last_issue_key.as_deref().unwrap_or("-")
                );
            }
        }
        Commands::Prune => {
            let pruned = workflow.prune_job_state().await?;
            println!("{}", if pruned { "old job state pruned" } else { "nothing to prune" });
        }
    }

    Ok(())
}
