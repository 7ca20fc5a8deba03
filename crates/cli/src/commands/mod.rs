// CLI subcommands

pub mod dlq;
pub mod reaper;
pub mod stats;
