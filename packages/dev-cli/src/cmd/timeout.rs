use anyhow::Result;
use clap::Subcommand;
use windlass::{awakeable, Store};

#[derive(Subcommand)]
pub enum TimeoutCommand {
    /// Run the timer sweep once: expire due awakeables, wake due sleeps
    Check,
}

pub async fn run(command: TimeoutCommand, store: &Store) -> Result<()> {
    match command {
        TimeoutCommand::Check => {
            let report = awakeable::sweep_timers(store).await?;
            println!(
                "swept timers: {} awakeable(s) timed out, {} sleep(s) woken",
                report.timed_out, report.sleeps_woken
            );
        }
    }
    Ok(())
}
