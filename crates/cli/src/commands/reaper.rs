// Lease reaper daemon

use anyhow::{Context, Result};
use deferq_broker::Broker;
use serde::Serialize;

use crate::output::{print_field, OutputFormat};

#[derive(Serialize)]
struct PassSummary {
    reclaimed: usize,
    dead_lettered: usize,
}

pub async fn run(broker: &Broker, output: OutputFormat, once: bool) -> Result<()> {
    let reaper = broker.reaper();

    if once {
        let report = reaper.run_once().await.context("Lease reaping failed")?;
        let summary = PassSummary {
            reclaimed: report.reclaimed,
            dead_lettered: report.dead_lettered,
        };
        if output.is_text() {
            print_field("Reclaimed", &summary.reclaimed.to_string());
            print_field("Dead-lettered", &summary.dead_lettered.to_string());
            return Ok(());
        }
        return output.print_value(&summary);
    }

    tracing::info!(
        interval_ms = reaper.interval().as_millis() as u64,
        "Reaper running, press Ctrl-C to stop"
    );
    let handle = reaper.spawn();

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Received shutdown signal");

    handle.shutdown().await;
    tracing::info!("Reaper shutdown complete");
    Ok(())
}
