use anyhow::Result;
use clap::Subcommand;
use windlass::{awakeable, Awakeable, Store};

use super::format_ts;

#[derive(Subcommand)]
pub enum AwakeableCommand {
    /// Resolve a PENDING awakeable with a JSON payload
    Resolve {
        id: String,
        /// JSON payload (defaults to null)
        #[arg(long)]
        payload: Option<String>,
    },
    /// Reject a PENDING awakeable with an error message
    Reject {
        id: String,
        #[arg(long)]
        error: String,
    },
    /// List awakeables, newest first
    List {
        #[arg(long)]
        job: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Show one awakeable in full
    Show { id: String },
}

pub async fn run(command: AwakeableCommand, store: &Store) -> Result<()> {
    match command {
        AwakeableCommand::Resolve { id, payload } => {
            let payload = match payload {
                Some(raw) => serde_json::from_str(&raw)
                    .map_err(|e| anyhow::anyhow!("payload is not valid JSON: {e}"))?,
                None => serde_json::Value::Null,
            };
            let row = awakeable::resolve(&id, payload, store).await?;
            println!("resolved {id}");
            println!("  job:   {} / {}", row.job_id, row.task_name);
            println!("  payload: {}", row.payload.unwrap_or_default());
        }
        AwakeableCommand::Reject { id, error } => {
            let row = awakeable::reject(&id, &error, store).await?;
            println!("rejected {id}");
            println!("  job:   {} / {}", row.job_id, row.task_name);
        }
        AwakeableCommand::List { job, limit } => {
            let rows = Awakeable::list(job.as_deref(), limit, store).await?;
            if rows.is_empty() {
                println!("no awakeables");
                return Ok(());
            }
            for row in rows {
                println!(
                    "{:<10} {}  {} / {}  created {}",
                    row.status.to_string(),
                    row.id,
                    row.job_id,
                    row.task_name,
                    format_ts(row.created_at),
                );
            }
        }
        AwakeableCommand::Show { id } => {
            let row = Awakeable::find_by_id(&id, store).await?;
            print_awakeable(&row);
        }
    }
    Ok(())
}

fn print_awakeable(row: &Awakeable) {
    println!("id:          {}", row.id);
    println!("status:      {}", row.status);
    println!("job:         {}", row.job_id);
    println!("task:        {}", row.task_name);
    println!("entry index: {}", row.entry_index);
    println!("created:     {}", format_ts(row.created_at));
    if let Some(timeout_at) = row.timeout_at {
        println!("timeout at:  {}", format_ts(timeout_at));
    }
    if let Some(resolved_at) = row.resolved_at {
        println!("resolved:    {}", format_ts(resolved_at));
    }
    if let Some(payload) = &row.payload {
        println!("payload:     {payload}");
    }
}
