use anyhow::Result;
use clap::Subcommand;
use windlass::{scheduler, Job, Store, Task};

use super::format_ts;

#[derive(Subcommand)]
pub enum JobCommand {
    /// Show a job and its tasks
    Status { id: String },
    /// List jobs, newest first
    List {
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Cancel a job: tasks fail, awakeables cancel, leases release
    Cancel {
        id: String,
        #[arg(long, default_value = "cancelled by operator")]
        reason: String,
    },
    /// Re-open a failed job with a fresh attempt for its failed tasks
    Retry { id: String },
}

pub async fn run(command: JobCommand, store: &Store) -> Result<()> {
    match command {
        JobCommand::Status { id } => {
            let job = Job::find_by_id(&id, store).await?;
            println!("job:     {} ({})", job.id, job.name);
            println!("status:  {}", job.status);
            if let Some(result) = job.completion_result {
                println!("result:  {result:?}");
            }
            if let Some(failure) = &job.completion_failure {
                println!("failure: {failure}");
            }
            println!("created: {}", format_ts(job.created_at));
            println!();
            for task in Task::list_for_job(&id, store).await? {
                let mut line = format!(
                    "  {:<12} {:<20} attempt {}",
                    task.status.to_string(),
                    task.name,
                    task.attempt
                );
                if let Some(failure) = &task.failure_message {
                    line.push_str(&format!("  [{failure}]"));
                }
                println!("{line}");
            }
        }
        JobCommand::List { limit } => {
            let jobs = Job::list(limit, store).await?;
            if jobs.is_empty() {
                println!("no jobs");
                return Ok(());
            }
            for job in jobs {
                println!(
                    "{:<12} {:<20} {}  created {}",
                    job.status.to_string(),
                    job.id,
                    job.name,
                    format_ts(job.created_at),
                );
            }
        }
        JobCommand::Cancel { id, reason } => {
            scheduler::cancel_job(&id, &reason, store).await?;
            println!("cancelled {id}");
        }
        JobCommand::Retry { id } => {
            scheduler::retry_job(&id, store).await?;
            println!("reopened {id}; failed tasks will run a fresh attempt");
        }
    }
    Ok(())
}
