//! Definition commands: validate, plan, list, schema.

use std::path::Path;

use anyhow::Context;
use comfy_table::{presets, Cell, Color, ContentArrangement, Table};
use console::style;
use weaver_core::credit::coordinator::CreditCoordinator;
use weaver_core::credit::store::{BoxCreditStore, InMemoryCreditStore};
use weaver_core::workflow::compiler::{compile, CompiledPlan, PlanNode};
use weaver_core::workflow::definition::{definition_hash, discover_definitions, load_definition_file};
use weaver_types::config::EngineConfig;
use weaver_types::workflow::{ErrorPolicy, WorkflowDefinition};

/// Load a definition file, attaching the path to any error.
pub fn load(file: &Path) -> anyhow::Result<WorkflowDefinition> {
    load_definition_file(file).with_context(|| format!("failed to load {}", file.display()))
}

pub fn validate(file: &Path, json: bool) -> anyhow::Result<()> {
    let definition = load(file)?;
    let plan = match compile(&definition) {
        Ok(plan) => plan,
        Err(err) => {
            if json {
                let report = serde_json::json!({
                    "valid": false,
                    "code": err.code(),
                    "error": err.to_string(),
                });
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
            anyhow::bail!("{} is invalid [{}]: {err}", file.display(), err.code());
        }
    };

    if json {
        let report = serde_json::json!({
            "valid": true,
            "name": definition.name,
            "hash": definition_hash(&definition),
            "nodes": definition.nodes.len(),
            "edges": definition.edges.len(),
            "levels": plan.execution_levels.len(),
            "loops": plan.loop_contexts.len(),
            "unreachable": plan.unreachable,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} Workflow '{}' is valid",
        style("✓").green().bold(),
        style(&definition.name).cyan()
    );
    println!(
        "    {} nodes, {} edges, {} levels, {} loops",
        definition.nodes.len(),
        definition.edges.len(),
        plan.execution_levels.len(),
        plan.loop_contexts.len()
    );
    if !plan.unreachable.is_empty() {
        println!(
            "  {} Unreachable nodes (never scheduled): {}",
            style("!").yellow().bold(),
            plan.unreachable.join(", ")
        );
    }
    println!();
    Ok(())
}

/// Credit estimate and reservation for a run with empty inputs.
fn credit_estimate(plan: &CompiledPlan, config: &EngineConfig) -> (u64, u64) {
    let coordinator = CreditCoordinator::new(BoxCreditStore::new(InMemoryCreditStore::new()), config.credits.clone());
    let estimate = coordinator.estimate_workflow_credits(plan, &serde_json::json!({}));
    (estimate, coordinator.reservation_for(estimate))
}

pub fn plan(file: &Path, config: &EngineConfig, json: bool) -> anyhow::Result<()> {
    let definition = load(file)?;
    let plan = compile(&definition).map_err(|e| anyhow::anyhow!("[{}] {e}", e.code()))?;
    let (estimate, reservation) = credit_estimate(&plan, config);

    if json {
        let report = serde_json::json!({
            "plan": plan,
            "estimated_credits": estimate,
            "reservation": reservation,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!();
    println!(
        "  Plan for {} (entry: {})",
        style(&plan.name).cyan().bold(),
        style(&definition.entry_point).dim()
    );
    print_scope(&plan, 0);
    println!();
    if config.credits.enabled {
        println!("  Estimated credits: {estimate} (reserves {reservation})");
    } else {
        println!("  Credit metering disabled");
    }
    println!();
    Ok(())
}

fn print_scope(plan: &CompiledPlan, indent: usize) {
    let pad = " ".repeat(indent + 2);
    println!();
    for line in plan_table(plan).to_string().lines() {
        println!("{pad}{line}");
    }

    for (loop_id, context) in &plan.loop_contexts {
        println!();
        println!(
            "{pad}{} body of '{}' (max {}, {}{})",
            style("Loop").magenta().bold(),
            style(loop_id).cyan(),
            context.max_iterations,
            if context.allow_parallel { "parallel" } else { "sequential" },
            if context.enable_replanning { ", replanning" } else { "" }
        );
        print_scope(&context.body, indent + 4);
    }
}

fn plan_table(plan: &CompiledPlan) -> Table {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Level").fg(Color::Cyan),
            Cell::new("Node").fg(Color::Cyan),
            Cell::new("Type").fg(Color::Cyan),
            Cell::new("Depends on").fg(Color::Cyan),
            Cell::new("On error").fg(Color::Cyan),
        ]);

    for (level, ids) in plan.execution_levels.iter().enumerate() {
        for id in ids {
            let Some(node) = plan.node(id) else { continue };
            table.add_row(vec![
                Cell::new(level),
                Cell::new(&node.id),
                Cell::new(node.node_type),
                Cell::new(dependency_label(node)),
                Cell::new(policy_label(node)),
            ]);
        }
    }
    for id in &plan.unreachable {
        table.add_row(vec![
            Cell::new("-").fg(Color::DarkGrey),
            Cell::new(id).fg(Color::DarkGrey),
            Cell::new("unreachable").fg(Color::DarkGrey),
            Cell::new(""),
            Cell::new(""),
        ]);
    }
    table
}

fn dependency_label(node: &PlanNode) -> String {
    if node.dependencies.is_empty() {
        "-".to_string()
    } else {
        node.dependencies.join(", ")
    }
}

fn policy_label(node: &PlanNode) -> String {
    let policy = match &node.on_error {
        None | Some(ErrorPolicy::Fail) => "fail".to_string(),
        Some(ErrorPolicy::Continue { .. }) => "continue".to_string(),
        Some(ErrorPolicy::Goto { goto }) => format!("goto {goto}"),
    };
    match node.retry.as_ref() {
        Some(retry) if retry.max_attempts > 1 => format!("{policy} (x{})", retry.max_attempts),
        _ => policy,
    }
}

pub fn list(dir: &Path, json: bool) -> anyhow::Result<()> {
    let definitions = discover_definitions(dir).with_context(|| format!("failed to scan {}", dir.display()))?;

    if json {
        let rows: Vec<_> = definitions
            .iter()
            .map(|(path, def)| {
                serde_json::json!({
                    "name": def.name,
                    "file": path.display().to_string(),
                    "nodes": def.nodes.len(),
                    "entry_point": def.entry_point,
                    "valid": compile(def).is_ok(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    if definitions.is_empty() {
        println!();
        println!("  No workflow files in {}.", dir.display());
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Name").fg(Color::Cyan),
            Cell::new("File").fg(Color::Cyan),
            Cell::new("Nodes").fg(Color::Cyan),
            Cell::new("Valid").fg(Color::Cyan),
        ]);

    for (path, def) in &definitions {
        let valid = match compile(def) {
            Ok(_) => Cell::new("yes").fg(Color::Green),
            Err(e) => Cell::new(e.code()).fg(Color::Red),
        };
        let file = path.file_name().map(|f| f.to_string_lossy().into_owned()).unwrap_or_default();
        table.add_row(vec![Cell::new(&def.name), Cell::new(file), Cell::new(def.nodes.len()), valid]);
    }

    println!("{table}");
    println!();
    println!("  {} workflow(s)", definitions.len());
    println!();
    Ok(())
}

pub fn schema() -> anyhow::Result<()> {
    let schema = schemars::schema_for!(WorkflowDefinition);
    println!("{}", serde_json::to_string_pretty(&schema)?);
    Ok(())
}
