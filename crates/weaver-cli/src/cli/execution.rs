//! Execution commands: run, resume, checkpoints.
//!
//! Runs use the echo activity behind the expression switch router, so any
//! definition can be exercised end to end without external services. Ctrl+C
//! pauses the run (its checkpoint stays resumable); a second Ctrl+C cancels.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use comfy_table::{presets, Cell, Color, ContentArrangement, Table};
use console::style;
use futures_util::{FutureExt, StreamExt};
use serde_json::Value;
use uuid::Uuid;
use weaver_core::activity::box_activity::BoxNodeActivity;
use weaver_core::activity::echo::EchoActivity;
use weaver_core::activity::switch_router::SwitchRouter;
use weaver_core::credit::coordinator::CreditCoordinator;
use weaver_core::credit::store::{BoxCreditStore, CreditStore, InMemoryCreditStore};
use weaver_core::event::bus::EventBus;
use weaver_core::telemetry::emitter::Telemetry;
use weaver_core::telemetry::sink::BoxTelemetrySink;
use weaver_core::workflow::checkpoint::{BoxExecutionStore, ExecutionStore, FileExecutionStore};
use weaver_core::workflow::engine::{EngineError, ExecutionRequest, ExecutionResult, WorkflowEngine};
use weaver_observe::OtelSink;
use weaver_types::config::EngineConfig;
use weaver_types::event::ExecutionEvent;
use weaver_types::execution::ExecutionStatus;

use super::workflow::load;

/// Settings shared by every execution command.
pub struct Runtime {
    pub config: EngineConfig,
    pub checkpoints: FileExecutionStore,
    pub otel: bool,
    /// Suppress live progress lines.
    pub silent: bool,
    pub json: bool,
}

/// Checkpoint directory used when none is given: `<data dir>/weaver/checkpoints`.
pub fn default_checkpoint_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("weaver")
        .join("checkpoints")
}

fn build_engine(runtime: &Runtime, credits: InMemoryCreditStore) -> WorkflowEngine {
    let coordinator = CreditCoordinator::new(BoxCreditStore::new(credits), runtime.config.credits.clone());
    let mut telemetry = Telemetry::new(EventBus::new(runtime.config.event_buffer));
    if runtime.otel {
        telemetry = telemetry.with_sink(BoxTelemetrySink::new("otel", OtelSink::new()));
    }
    WorkflowEngine::new(
        BoxNodeActivity::new(SwitchRouter::new(EchoActivity)),
        Arc::new(coordinator),
        telemetry,
        runtime.config.clone(),
    )
    .with_store(BoxExecutionStore::new(runtime.checkpoints.clone()))
}

/// Parse inputs from an inline JSON document or a file. Absent means `{}`.
pub async fn read_inputs(inline: Option<&str>, file: Option<&Path>) -> anyhow::Result<Value> {
    let raw = match (inline, file) {
        (Some(json), _) => json.to_string(),
        (None, Some(path)) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?,
        (None, None) => return Ok(Value::Object(Default::default())),
    };
    serde_json::from_str(&raw).context("inputs are not valid JSON")
}

pub async fn run(
    runtime: &Runtime,
    file: &Path,
    inputs: Value,
    account: String,
    balance: u64,
) -> anyhow::Result<()> {
    let definition = load(file)?;
    let engine = build_engine(runtime, InMemoryCreditStore::with_balance(&account, balance));
    let request = ExecutionRequest::new(definition, inputs).with_account(account);
    let execution_id = request.execution_id;

    if !runtime.silent {
        println!();
        println!(
            "  {} Running '{}' ({})",
            style("▶").green().bold(),
            style(&request.definition.name).cyan(),
            style(execution_id).dim()
        );
        println!();
    }

    let result = watch(runtime, &engine, execution_id, engine.execute(request)).await;
    report(runtime, result)
}

pub async fn resume(runtime: &Runtime, execution_id: Uuid, balance: u64) -> anyhow::Result<()> {
    let snapshot = runtime
        .checkpoints
        .load_snapshot(execution_id)
        .await?
        .with_context(|| {
            format!(
                "no checkpoint for {execution_id} in {}",
                runtime.checkpoints.dir().display()
            )
        })?;

    // Credit holds live in this process only; re-create the checkpoint's hold.
    let credits = InMemoryCreditStore::new();
    if let Some(ledger) = snapshot.credits.as_ref() {
        credits.deposit(&ledger.account, balance);
        if runtime.config.credits.enabled && !credits.hold(&ledger.account, execution_id, ledger.reserved).await? {
            anyhow::bail!(
                "balance {balance} cannot cover the {} credits reserved by {execution_id}",
                ledger.reserved
            );
        }
    }

    if !runtime.silent {
        println!();
        println!(
            "  {} Resuming '{}' ({})",
            style("▶").green().bold(),
            style(&snapshot.definition.name).cyan(),
            style(execution_id).dim()
        );
        println!();
    }

    let engine = build_engine(runtime, credits);
    let result = watch(runtime, &engine, execution_id, engine.resume(snapshot)).await;
    report(runtime, result)
}

/// Drive `run` to completion, printing its events as they arrive.
async fn watch(
    runtime: &Runtime,
    engine: &WorkflowEngine,
    execution_id: Uuid,
    run: impl Future<Output = Result<ExecutionResult, EngineError>>,
) -> Result<ExecutionResult, EngineError> {
    let events = engine.telemetry().bus().execution_stream(execution_id);
    tokio::pin!(events);
    tokio::pin!(run);

    let mut interrupts = 0u8;
    let result = loop {
        tokio::select! {
            biased;
            Some(event) = events.next() => {
                if !runtime.silent {
                    print_event(&event);
                }
            }
            _ = tokio::signal::ctrl_c(), if interrupts < 2 => {
                interrupts += 1;
                let requested = if interrupts == 1 {
                    if !runtime.silent {
                        println!("  {} Pausing after in-flight nodes (Ctrl+C again to cancel)", style("||").yellow().bold());
                    }
                    engine.pause(execution_id)
                } else {
                    engine.cancel(execution_id)
                };
                if let Err(e) = requested {
                    tracing::debug!(%execution_id, error = %e, "interrupt arrived outside the run");
                }
            }
            result = &mut run => break result,
        }
    };

    // Events published just before the run returned are still buffered.
    while let Some(Some(event)) = events.next().now_or_never() {
        if !runtime.silent {
            print_event(&event);
        }
    }
    result
}

fn print_event(event: &ExecutionEvent) {
    match event {
        ExecutionEvent::NodeCompleted {
            node_id,
            duration_ms,
            credits,
            iteration,
            ..
        } => {
            println!(
                "  {} {}{}  {}",
                style("✓").green(),
                node_id,
                iteration_suffix(*iteration),
                style(format!("{duration_ms}ms, {credits} credits")).dim()
            );
        }
        ExecutionEvent::NodeFailed {
            node_id,
            error,
            will_retry,
            iteration,
            ..
        } => {
            let note = if *will_retry { " (retrying)" } else { "" };
            println!(
                "  {} {}{}: {}{}",
                style("✗").red(),
                node_id,
                iteration_suffix(*iteration),
                error,
                style(note).yellow()
            );
        }
        ExecutionEvent::NodeSkipped { node_id, reason, .. } => {
            println!("  {} {} {}", style("-").dim(), style(node_id).dim(), style(format!("({reason})")).dim());
        }
        _ => {}
    }
}

fn iteration_suffix(iteration: Option<usize>) -> String {
    iteration.map(|i| format!("[{i}]")).unwrap_or_default()
}

fn report(runtime: &Runtime, result: Result<ExecutionResult, EngineError>) -> anyhow::Result<()> {
    let result = result.map_err(|e| anyhow::anyhow!("[{}] {e}", e.code()))?;

    if runtime.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else if !runtime.silent {
        print_summary(&result)?;
    }

    match result.status {
        ExecutionStatus::Completed | ExecutionStatus::Paused | ExecutionStatus::Running => Ok(()),
        ExecutionStatus::Cancelled => anyhow::bail!("execution {} was cancelled", result.execution_id),
        ExecutionStatus::Failed => {
            let node = result.failed_node.as_deref().unwrap_or("<engine>");
            let message = result.error.as_ref().map(|e| e.message.as_str()).unwrap_or("unknown error");
            anyhow::bail!("execution failed at node '{node}': {message}")
        }
    }
}

fn print_summary(result: &ExecutionResult) -> anyhow::Result<()> {
    println!();
    let headline = match result.status {
        ExecutionStatus::Completed => style("✓ Execution completed").green().bold(),
        ExecutionStatus::Failed => style("✗ Execution failed").red().bold(),
        ExecutionStatus::Cancelled => style("✗ Execution cancelled").red().bold(),
        ExecutionStatus::Paused | ExecutionStatus::Running => style("|| Execution paused").yellow().bold(),
    };
    println!("  {headline} in {}ms", result.duration_ms);

    if let Some(credits) = result.credits {
        println!(
            "    credits: {} spent of {} reserved ({} released)",
            credits.spent, credits.reserved, credits.released
        );
    }

    if result.status == ExecutionStatus::Paused {
        println!(
            "    resume with: {}",
            style(format!("weaver resume {}", result.execution_id)).cyan()
        );
    }

    if !result.final_outputs.outputs.is_empty() {
        println!();
        println!("  {}", style("Outputs").bold());
        let pretty = serde_json::to_string_pretty(&result.final_outputs.outputs)?;
        for line in pretty.lines() {
            println!("    {line}");
        }
    }
    if !result.final_outputs.missing.is_empty() {
        println!(
            "    {} no output from: {}",
            style("!").yellow(),
            result.final_outputs.missing.join(", ")
        );
    }
    println!();
    Ok(())
}

pub async fn checkpoints(runtime: &Runtime) -> anyhow::Result<()> {
    let snapshots = runtime.checkpoints.list().await?;

    if runtime.json {
        let rows: Vec<_> = snapshots
            .iter()
            .map(|s| {
                serde_json::json!({
                    "execution_id": s.execution_id,
                    "workflow": s.definition.name,
                    "status": s.status,
                    "finished_nodes": s.queue.finished_count(),
                    "saved_at": s.saved_at,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    if snapshots.is_empty() {
        println!();
        println!("  No checkpoints in {}.", runtime.checkpoints.dir().display());
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Execution").fg(Color::Cyan),
            Cell::new("Workflow").fg(Color::Cyan),
            Cell::new("Status").fg(Color::Cyan),
            Cell::new("Finished").fg(Color::Cyan),
            Cell::new("Saved").fg(Color::Cyan),
        ]);

    for snapshot in &snapshots {
        let status = match snapshot.status {
            ExecutionStatus::Completed => Cell::new(snapshot.status).fg(Color::Green),
            ExecutionStatus::Failed | ExecutionStatus::Cancelled => Cell::new(snapshot.status).fg(Color::Red),
            ExecutionStatus::Paused | ExecutionStatus::Running => Cell::new(snapshot.status).fg(Color::Yellow),
        };
        table.add_row(vec![
            Cell::new(snapshot.execution_id),
            Cell::new(&snapshot.definition.name),
            status,
            Cell::new(snapshot.queue.finished_count()),
            Cell::new(snapshot.saved_at.format("%Y-%m-%d %H:%M:%S")),
        ]);
    }

    println!("{table}");
    println!();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn runtime(dir: &Path) -> Runtime {
        Runtime {
            config: EngineConfig::default(),
            checkpoints: FileExecutionStore::new(dir),
            otel: false,
            silent: true,
            json: false,
        }
    }

    fn write_definition(dir: &Path) -> PathBuf {
        let path = dir.join("greet.yaml");
        std::fs::write(
            &path,
            r#"
name: greet
entryPoint: start
nodes:
  start: { type: input, name: Start }
  shape: { type: transform, name: Shape, config: { greeting: "hello {{inputs.who}}" } }
  done: { type: output, name: Done }
edges:
  - { id: e1, source: start, target: shape }
  - { id: e2, source: shape, target: done }
"#,
        )
        .unwrap();
        path
    }

    #[tokio::test]
    async fn inputs_default_to_empty_object() {
        assert_eq!(read_inputs(None, None).await.unwrap(), json!({}));
        assert_eq!(read_inputs(Some(r#"{"a":1}"#), None).await.unwrap(), json!({ "a": 1 }));
        assert!(read_inputs(Some("not json"), None).await.is_err());
    }

    #[tokio::test]
    async fn run_writes_a_terminal_checkpoint() {
        let tmp = tempfile::TempDir::new().unwrap();
        let runtime = runtime(&tmp.path().join("checkpoints"));
        let file = write_definition(tmp.path());

        run(&runtime, &file, json!({ "who": "ada" }), "default".to_string(), 1_000)
            .await
            .unwrap();

        let saved = runtime.checkpoints.list().await.unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].status, ExecutionStatus::Completed);
        assert_eq!(saved[0].definition.name, "greet");
    }

    #[tokio::test]
    async fn run_without_balance_is_denied() {
        let tmp = tempfile::TempDir::new().unwrap();
        let runtime = runtime(&tmp.path().join("checkpoints"));
        let file = write_definition(tmp.path());

        let err = run(&runtime, &file, json!({}), "default".to_string(), 0)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("ADMISSION_DENIED"));
    }

    #[tokio::test]
    async fn resume_rejects_completed_runs() {
        let tmp = tempfile::TempDir::new().unwrap();
        let runtime = runtime(&tmp.path().join("checkpoints"));
        let file = write_definition(tmp.path());
        run(&runtime, &file, json!({ "who": "ada" }), "default".to_string(), 1_000)
            .await
            .unwrap();
        let execution_id = runtime.checkpoints.list().await.unwrap()[0].execution_id;

        let err = resume(&runtime, execution_id, 1_000).await.unwrap_err();
        assert!(err.to_string().contains("NOT_RESUMABLE"));
        assert!(resume(&runtime, Uuid::now_v7(), 1_000).await.is_err());
    }
}
