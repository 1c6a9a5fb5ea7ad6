use anyhow::Result;
use clap::Args;
use windlass::{events, Store};

use super::format_ts;

#[derive(Args)]
pub struct EventsArgs {
    /// Only events for this job
    #[arg(long)]
    pub job: Option<String>,
    #[arg(long, default_value_t = 50)]
    pub limit: i64,
}

pub async fn run(args: EventsArgs, store: &Store) -> Result<()> {
    let rows = events::list(args.job.as_deref(), args.limit, store).await?;
    if rows.is_empty() {
        println!("no events");
        return Ok(());
    }
    // Oldest first reads like a history.
    for event in rows.into_iter().rev() {
        let scope = match &event.task_name {
            Some(task) => format!("{}/{}", event.job_id, task),
            None => event.job_id.clone(),
        };
        let change = match (&event.old_state, &event.new_state) {
            (Some(old), Some(new)) => format!("{old} -> {new}"),
            _ => "-".to_string(),
        };
        println!(
            "{}  {:<18} {:<28} {:<24} {}",
            format_ts(event.ts),
            event.event_type,
            scope,
            change,
            event.reason,
        );
    }
    Ok(())
}
