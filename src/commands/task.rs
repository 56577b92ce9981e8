//! `forge check task`: inspect remote tasks and unstick paused syncs.

use crate::Context;
use crate::cli::TaskArgs;
use crate::commands::Session;
use crate::ui;
use anyhow::{Context as _, Result, bail};
use reconcile::{RetryPolicy, SystemClock, Task, TaskTracker};
use regex::Regex;
use serde_json::Value;
use std::io::Write;
use std::sync::LazyLock;
use supervisor::{StepPolicy, Supervisor};

const REPOSITORY_SYNC: &str = "Actions::Katello::Repository::Sync";

const RESET_PULP_STEP: &str = "reset-pulp-task";

static TASK_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9A-Za-z][0-9A-Za-z-]*$").expect("task id pattern is valid")
});

/// Resumes a paused execution plan after dropping the pulp task records
/// of its active steps.
const RESET_PULP_SCRIPT: &str = r##"@world = ForemanTasks.dynflow.world
@persistence = @world.persistence

def reset_pulp_task(foreman_uuid)
  uuid = ForemanTasks::Task.find(foreman_uuid).external_id
  execution_plan = @persistence.load_execution_plan(uuid)
  raise "execution plan #{execution_plan} is not paused" unless execution_plan.state == :paused
  active_steps = execution_plan.steps_in_state(:running, :suspended, :error)
  active_steps.each do |step|
    action = step.action(execution_plan)
    if action.output['pulp_tasks']
      action.output.delete('pulp_tasks')
      puts "updating execution plan #{uuid} step #{step.id} action #{action.id}"
      @persistence.save_action(execution_plan.id, action)
    end
  end
  puts "resuming execution plan #{execution_plan.id}"
  @world.execute(execution_plan.id)
end

reset_pulp_task('{task_id}')
"##;

pub fn run(ctx: &Context, args: &TaskArgs) -> Result<()> {
    if let Some(id) = &args.reset_pulp {
        return reset_pulp(ctx, id);
    }

    let session = Session::open(ctx)?;
    let clock = SystemClock;
    let tracker = TaskTracker::new(&session.backend, &clock, &RetryPolicy::default());

    if args.wait_idle {
        let waits = tracker.wait_for_idle()?;
        ui::success(&format!("No running tasks (waited {waits} times)"));
        return Ok(());
    }

    let tasks = if let Some(id) = &args.id {
        log::debug!("Searching for task {id}");
        tracker.get_first("id", id)?.into_iter().collect()
    } else if args.incomplete {
        log::debug!("Searching for incomplete tasks");
        tracker.incomplete()?
    } else if args.bad {
        log::debug!("Searching for failed tasks");
        tracker.failed()?
    } else {
        bail!("Nothing to check, pass one of --id, --incomplete, --bad, --wait-idle or --reset-pulp");
    };

    if tasks.is_empty() {
        ui::warn("No task found");
        return Ok(());
    }
    for task in &tasks {
        show_task(task);
        if ctx.verbose > 1 {
            println!("{}", serde_json::to_string_pretty(task)?);
        }
    }
    Ok(())
}

fn show_task(task: &Task) {
    let rows = task_rows(task);
    let width = rows.iter().map(|(k, _)| k.len()).max().unwrap_or(0);

    ui::header(&format!("{} {}", task.label(), task.id));
    for (key, value) in &rows {
        match key.as_str() {
            "State" | "Result" => ui::kv(key, &ui::by_status(value).to_string(), width),
            _ => ui::kv(key, value, width),
        }
    }
}

/// Key/value rows describing a task. Repository syncs get their product,
/// repository and pulp task details appended.
pub fn task_rows(task: &Task) -> Vec<(String, String)> {
    let mut rows: Vec<(String, String)> = Vec::new();
    let mut row = |key: &str, value: String| rows.push((key.to_string(), value));

    row("State", task.state.to_string());
    row("Pending", task.pending.to_string());
    row("Result", task.result.to_string());
    row("Started", task.started_at.clone().unwrap_or_else(|| "-".into()));
    row("Ended", task.ended_at.clone().unwrap_or_else(|| "-".into()));
    row("Action", task.humanized.action.clone().unwrap_or_else(|| "-".into()));
    row("Output", task.humanized.output.clone().unwrap_or_default());
    row("Errors", task.humanized.errors.join("; "));
    row("Duration", task.duration().map_or_else(|| "-".into(), ui::format_duration));
    row("Task ID", task.id.clone());
    row("Progress", task.progress_percent());

    if task.label.as_deref() == Some(REPOSITORY_SYNC) {
        let input = &task.input;
        row("Product", text(&input["product"]["label"]));
        row("Repository", text(&input["repository"]["label"]));
        row("Content Changed", text(&input["contents_changed"]));

        let sync = &input["sync_result"];
        if let Some(polls) = sync.get("poll_attempts") {
            row(
                "Poll Attempts",
                format!("{} / {} failed", text(&polls["failed"]), text(&polls["total"])),
            );
        }
        for pulp in sync["pulp_tasks"].as_array().into_iter().flatten() {
            row("Pulp Task", text(&pulp["task_id"]));
            row("Started", text(&pulp["start_time"]));
            row("Ended", text(&pulp["finish_time"]));
            row("Error", text(&pulp["error"]));
            row("State", text(&pulp["state"]));
            row("Type", text(&pulp["task_type"]));
        }
    }
    rows
}

fn text(value: &Value) -> String {
    match value {
        Value::Null => "-".to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ============================================================================
// Pulp reset
// ============================================================================

/// The reset script for one task. Ids are interpolated into Ruby source, so
/// anything but letters, digits and dashes is refused.
pub fn reset_pulp_script(task_id: &str) -> Result<String> {
    if !TASK_ID.is_match(task_id) {
        bail!("Invalid task id '{task_id}'");
    }
    Ok(RESET_PULP_SCRIPT.replace("{task_id}", task_id))
}

fn reset_pulp(ctx: &Context, task_id: &str) -> Result<()> {
    let script = reset_pulp_script(task_id)?;
    let config = ctx.load_config()?;
    log::debug!("{script}");

    let mut file = tempfile::Builder::new()
        .prefix("forge-reset-pulp-")
        .suffix(".rb")
        .tempfile()
        .context("Could not create the reset script")?;
    file.write_all(script.as_bytes())?;
    file.flush()?;
    let path = file.path().to_string_lossy().into_owned();
    log::info!("Reset script written to {path}");

    let command = vec!["foreman-rake".to_string(), path, "--trace".to_string()];
    let mut supervisor =
        Supervisor::new(StepPolicy::all()).with_path_marker(&config.install.path_marker);
    supervisor
        .run_step(&command, RESET_PULP_STEP, None)
        .with_context(|| format!("Step {RESET_PULP_STEP} could not run"))?;

    ui::success(&format!("Task {task_id} resumed"));
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
