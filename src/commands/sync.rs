//! `forge check sync`: last synchronization of every repository.

use crate::Context;
use crate::commands::Session;
use crate::ui;
use anyhow::{Context as _, Result};
use reconcile::{
    Backend, Endpoint, EntityKind, Filter, OwnerScope, Reconciler, RetryPolicy, SystemClock, Task,
};
use serde_json::Value;
use std::collections::HashMap;

const COLUMNS: [&str; 7] = [
    "Repo Label",
    "Product Label",
    "Sync State",
    "Result",
    "Time",
    "Duration",
    "Task ID",
];

/// One table row: the repository, its product and its last sync task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRow {
    pub result: String,
    pub cells: [String; 7],
}

pub fn run(ctx: &Context) -> Result<()> {
    let session = Session::open(ctx)?;
    let server = session.server();
    let clock = SystemClock;
    let reconciler = Reconciler::new(&session.backend, &clock, RetryPolicy::default());

    let org_name = server.default_org.as_deref().with_context(|| {
        format!("Server {} has no default_org, nothing to check", session.server_name)
    })?;
    let org = reconciler
        .find(EntityKind::Organization, org_name)?
        .with_context(|| format!("Organization {org_name} not found"))?;
    let org_id = org
        .id()
        .with_context(|| format!("Organization {org_name} has no id"))?;
    let owner = OwnerScope::Organization(org_id);

    let products = list(&session.backend, EntityKind::Product, &owner)?;
    let repositories = list(&session.backend, EntityKind::Repository, &owner)?;
    log::debug!("{} repositories in {} products", repositories.len(), products.len());
    let labels = product_labels(&products);

    let mut rows = Vec::new();
    for repo in &repositories {
        let Some(task_id) = last_sync_id(repo) else {
            log::debug!("Repository {} was never synced", text(&repo["label"]));
            continue;
        };
        // The repository only embeds a summary; the tasks API has the timings.
        let Some(task) = reconciler
            .tasks()
            .get_first("id", &task_id)?
            .or_else(|| Task::lossy(&repo["last_sync"]))
        else {
            continue;
        };
        rows.push(sync_row(repo, &labels, &task));
    }

    if rows.is_empty() {
        ui::warn("No synchronized repository found");
        return Ok(());
    }
    ui::header(&format!("Repository sync status for {org_name}"));
    print_table(&rows);
    Ok(())
}

fn list(backend: &dyn Backend, kind: EntityKind, owner: &OwnerScope) -> Result<Vec<Value>> {
    let endpoint = Endpoint::for_kind(kind, owner);
    backend
        .search(&endpoint, &Filter::new().build())
        .with_context(|| format!("Could not list {endpoint}"))
}

/// Product labels by id.
fn product_labels(products: &[Value]) -> HashMap<u64, String> {
    products
        .iter()
        .filter_map(|p| Some((p["id"].as_u64()?, p["label"].as_str()?.to_string())))
        .collect()
}

fn last_sync_id(repo: &Value) -> Option<String> {
    match &repo["last_sync"]["id"] {
        Value::String(id) if !id.is_empty() => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

/// Row for a repository. The product label falls back to what the
/// repository embeds when the product list does not know the id.
pub fn sync_row(repo: &Value, labels: &HashMap<u64, String>, task: &Task) -> SyncRow {
    let product = &repo["product"];
    let product_label = product["id"]
        .as_u64()
        .and_then(|id| labels.get(&id).cloned())
        .unwrap_or_else(|| text(product.get("label").unwrap_or(&product["name"])));

    SyncRow {
        result: task.result.to_string(),
        cells: [
            text(&repo["label"]),
            product_label,
            task.state.to_string(),
            task.result.to_string(),
            task.started_at.clone().unwrap_or_else(|| "-".into()),
            task.duration().map_or_else(|| "-".into(), ui::format_duration),
            task.id.clone(),
        ],
    }
}

fn print_table(rows: &[SyncRow]) {
    let mut widths = COLUMNS.map(str::len);
    for row in rows {
        for (width, cell) in widths.iter_mut().zip(&row.cells) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let header: Vec<String> = COLUMNS
        .iter()
        .zip(widths)
        .map(|(name, width)| format!("{name:<width$}"))
        .collect();
    println!("  {}", header.join("  "));
    for row in rows {
        let cells: Vec<String> = row
            .cells
            .iter()
            .zip(widths)
            .map(|(cell, width)| {
                ui::colored_by(&row.result, &format!("{cell:<width$}")).to_string()
            })
            .collect();
        println!("  {}", cells.join("  "));
    }
}

fn text(value: &Value) -> String {
    match value {
        Value::Null => "-".to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ============================================================================
// Tests
// ============================================================================
