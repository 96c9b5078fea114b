use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

use conveyor::{
    Kit, KitConfig, MemoryBackend, RegularSchedule, RetryDecision, ScheduleEntries, ScheduleEntry,
    Task, TaskHandler,
};

#[derive(Parser, Debug)]
#[command(name = "conveyor")]
#[command(about = "Demo task-runner fleet over the in-memory backend")]
struct Args {
    /// Worker groups (comma-separated, format: "group:count")
    /// Example: "default:4,reports:2"
    #[arg(long, default_value = "default:4")]
    groups: String,

    /// Number of service instances to run
    #[arg(long, default_value = "1")]
    services: usize,

    /// Skip the demo heartbeat schedule entry
    #[arg(long)]
    no_heartbeat: bool,
}

/// Demo handler: `echo` returns its data, `heartbeat` logs the occurrence.
struct DemoHandler;

#[async_trait]
impl TaskHandler for DemoHandler {
    async fn handle(&self, task: &Task) -> Result<Value, conveyor::HandlerError> {
        match task.name.as_str() {
            "heartbeat" => {
                tracing::info!(task_id = %task.id, scheduled_at = ?task.scheduled_at, "heartbeat");
                Ok(json!("ok"))
            }
            _ => {
                let value: Value = serde_json::from_slice(&task.data).unwrap_or(Value::Null);
                Ok(value)
            }
        }
    }

    fn retry_interval(&self, _task: &Task, _error: &conveyor::ErrorInfo) -> RetryDecision {
        RetryDecision::After(Duration::from_secs(5))
    }
}

fn parse_groups(groups_str: &str) -> Vec<(String, usize)> {
    groups_str
        .split(',')
        .filter_map(|entry| {
            let (group, count) = entry.trim().split_once(':')?;
            match count.parse() {
                Ok(count) => Some((group.to_string(), count)),
                Err(_) => {
                    tracing::warn!(entry, "invalid group format, expected group:count");
                    None
                }
            }
        })
        .collect()
}

#[tokio::main]
async fn main() -> conveyor::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = KitConfig::new().with_num_services(args.services);
    for (group, count) in parse_groups(&args.groups) {
        config = config.with_group(group, count);
    }

    let mut schedule_entries = ScheduleEntries::new();
    if !args.no_heartbeat {
        schedule_entries.insert(
            "demo".to_string(),
            vec![ScheduleEntry::new(
                "heartbeat",
                "default",
                "heartbeat",
                b"{}".to_vec(),
                RegularSchedule::default().at_seconds([0, 15, 30, 45]),
            )],
        );
    }

    tracing::info!(groups = %args.groups, services = args.services, "starting conveyor demo fleet");

    let kit = Kit::new(Arc::new(MemoryBackend::new()), Arc::new(DemoHandler), config);
    kit.run(schedule_entries).await
}
