// Dead-letter queue commands

use anyhow::{Context, Result};
use clap::Subcommand;
use deferq_broker::persistence::{DeadLetterEntry, DeadLetterFilter, Pagination};
use deferq_broker::Broker;
use serde::Serialize;
use uuid::Uuid;

use crate::output::{print_field, print_table_header, print_table_row, OutputFormat};

#[derive(Subcommand)]
pub enum DlqCommand {
    /// List dead letters of a queue, most recent first
    List {
        /// Queue name
        queue: String,

        /// Maximum entries to show
        #[arg(long, default_value = "50")]
        limit: u32,

        /// Entries to skip
        #[arg(long, default_value = "0")]
        offset: u32,

        /// Include archived entries
        #[arg(long)]
        include_archived: bool,
    },

    /// Show one dead letter with its failure history
    Get {
        /// Dead letter ID
        id: Uuid,
    },

    /// Move a dead letter back to its queue with a fresh attempt budget
    Requeue {
        /// Dead letter ID
        id: Uuid,
    },

    /// Hide a dead letter permanently, keeping it for audit
    Archive {
        /// Dead letter ID
        id: Uuid,
    },

    /// Remove a dead letter
    Delete {
        /// Dead letter ID
        id: Uuid,
    },
}

#[derive(Serialize)]
struct ActionResult {
    dlq_id: Uuid,
    action: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    task_id: Option<Uuid>,
}

pub async fn run(command: DlqCommand, broker: &Broker, output: OutputFormat) -> Result<()> {
    match command {
        DlqCommand::List {
            queue,
            limit,
            offset,
            include_archived,
        } => list(broker, output, queue, limit, offset, include_archived).await,
        DlqCommand::Get { id } => get(broker, output, id).await,
        DlqCommand::Requeue { id } => {
            let task_id = broker
                .requeue(id)
                .await
                .with_context(|| format!("Failed to requeue dead letter {}", id))?;
            report(output, id, "requeued", Some(task_id))
        }
        DlqCommand::Archive { id } => {
            broker
                .archive(id)
                .await
                .with_context(|| format!("Failed to archive dead letter {}", id))?;
            report(output, id, "archived", None)
        }
        DlqCommand::Delete { id } => {
            broker
                .delete_dead_letter(id)
                .await
                .with_context(|| format!("Failed to delete dead letter {}", id))?;
            report(output, id, "deleted", None)
        }
    }
}

async fn list(
    broker: &Broker,
    output: OutputFormat,
    queue: String,
    limit: u32,
    offset: u32,
    include_archived: bool,
) -> Result<()> {
    let filter = DeadLetterFilter {
        queue: Some(queue.clone()),
        include_archived,
    };
    let entries = broker
        .dead_letters()
        .list_filtered(filter, Pagination { offset, limit })
        .await
        .with_context(|| format!("Failed to list dead letters of {}", queue))?;

    if !output.is_text() {
        return output.print_value(&entries);
    }

    if entries.is_empty() {
        println!("No dead letters in {}", queue);
        return Ok(());
    }

    let columns = [
        ("ID", 36),
        ("REASON", 18),
        ("ATTEMPTS", 8),
        ("DEAD AT", 20),
        ("LAST ERROR", 40),
    ];
    print_table_header(&columns);
    for entry in &entries {
        let id = entry.id.to_string();
        let attempts = entry.attempts.to_string();
        let dead_at = entry.dead_at.format("%Y-%m-%d %H:%M:%S").to_string();
        print_table_row(&[
            (&id, 36),
            (entry.reason.as_str(), 18),
            (&attempts, 8),
            (&dead_at, 20),
            (entry.last_error().unwrap_or("-"), 40),
        ]);
    }
    Ok(())
}

async fn get(broker: &Broker, output: OutputFormat, id: Uuid) -> Result<()> {
    let entry = broker
        .get_dead_letter(id)
        .await
        .with_context(|| format!("Failed to load dead letter {}", id))?
        .with_context(|| format!("Dead letter not found: {}", id))?;

    if !output.is_text() {
        return output.print_value(&entry);
    }

    print_entry(&entry);
    Ok(())
}

fn print_entry(entry: &DeadLetterEntry) {
    print_field("ID", &entry.id.to_string());
    print_field("Task ID", &entry.task_id.to_string());
    print_field("Queue", &entry.queue);
    print_field("Reason", entry.reason.as_str());
    print_field(
        "Attempts",
        &format!("{}/{}", entry.attempts, entry.max_attempts),
    );
    print_field("Created", &entry.created_at.to_rfc3339());
    print_field("Dead-lettered", &entry.dead_at.to_rfc3339());
    if let Some(archived_at) = entry.archived_at {
        print_field("Archived", &archived_at.to_rfc3339());
    }
    if let Some(key) = &entry.dedupe_key {
        print_field("Dedupe key", &key.key);
    }
    print_field("Payload", &String::from_utf8_lossy(&entry.payload));

    if !entry.failure_history.is_empty() {
        println!();
        print_table_header(&[("ATTEMPT", 8), ("AT", 25), ("ERROR", 60)]);
        for failure in &entry.failure_history {
            let attempt = failure.attempt.to_string();
            let at = failure.at.to_rfc3339();
            print_table_row(&[(&attempt, 8), (&at, 25), (&failure.error_summary, 60)]);
        }
    }
}

fn report(
    output: OutputFormat,
    dlq_id: Uuid,
    action: &'static str,
    task_id: Option<Uuid>,
) -> Result<()> {
    if !output.is_text() {
        return output.print_value(&ActionResult {
            dlq_id,
            action,
            task_id,
        });
    }

    match task_id {
        Some(task_id) => println!("Dead letter {} {} as task {}", dlq_id, action, task_id),
        None => println!("Dead letter {} {}", dlq_id, action),
    }
    Ok(())
}
