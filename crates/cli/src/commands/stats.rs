// Queue statistics

use anyhow::{Context, Result};
use deferq_broker::Broker;

use crate::output::{print_field, OutputFormat};

pub async fn run(broker: &Broker, output: OutputFormat, queue: &str) -> Result<()> {
    let stats = broker
        .queue_stats(queue)
        .await
        .with_context(|| format!("Failed to read stats for queue {}", queue))?;

    if output.is_text() {
        print_field("Queue", &stats.queue);
        print_field("Pending", &stats.pending.to_string());
        print_field("Leased", &stats.leased.to_string());
        print_field("Retry scheduled", &stats.retry_scheduled.to_string());
        print_field("Dead-lettered", &stats.dead_lettered.to_string());
        Ok(())
    } else {
        output.print_value(&stats)
    }
}
