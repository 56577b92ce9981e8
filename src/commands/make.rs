//! `forge make init`: bring a fresh Satellite in line with the configuration.
//!
//! Order matters: the organization comes first since everything else is
//! scoped to it, then settings, sync plans, lifecycle environments, domains
//! and subnets.

use crate::Context;
use crate::commands::Session;
use crate::config::{EnvironmentConfig, SubnetConfig, SyncPlanConfig, to_json};
use crate::ui;
use anyhow::{Context as _, Result, anyhow, bail};
use chrono::{Datelike, Days, Local, NaiveDate, NaiveDateTime, Weekday};
use colored::Colorize;
use reconcile::{
    Entity, EntityKind, Outcome, OwnerScope, Reconciler, Reconciliation, RetryPolicy, SystemClock,
    Task,
};
use serde_json::Value;
use std::collections::BTreeMap;
use std::net::IpAddr;

const SYNC_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Hourly plans a `daily` sync plan expands into.
const DAILY_PLANS: u32 = 5;

// ============================================================================
// Summary
// ============================================================================

/// Tally of what `make init` did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Summary {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub deferred: usize,
    pub aborted: usize,
    pub skipped: usize,
}

impl Summary {
    /// Record a reconciliation, naming the task that held its lock when the
    /// tracker still has it.
    fn settle(&mut self, reconciler: &Reconciler<'_>, reconciliation: &Reconciliation) {
        let blocker = reconciliation
            .state
            .blocking_task
            .as_deref()
            .and_then(|id| reconciler.tasks().cached(id));
        self.record(reconciliation, blocker.as_ref());
    }

    fn record(&mut self, reconciliation: &Reconciliation, blocker: Option<&Task>) {
        let entity = &reconciliation.entity;
        let label = format!("{} {}", entity.kind, entity.display_key());
        match &reconciliation.outcome {
            Outcome::Created => {
                self.created += 1;
                ui::success(&format!("Created {label}"));
            }
            Outcome::Updated => {
                self.updated += 1;
                ui::success(&format!("Updated {label}"));
            }
            Outcome::Deferred => {
                self.deferred += 1;
                ui::warn(&format!("{label}: server task timed out, change will land later"));
            }
            Outcome::Aborted { reason } => {
                self.aborted += 1;
                ui::error(&format!("{label}: {reason}"));
            }
        }
        if reconciliation.state.lock_waits > 0 {
            log::info!("{label} waited {} times on a lock", reconciliation.state.lock_waits);
        }
        if let Some(note) = blocker_note(reconciliation, blocker) {
            ui::warn(&format!("{label}: {note}"));
        }
    }

    pub fn total_changes(&self) -> usize {
        self.created + self.updated
    }

    fn print(&self) {
        ui::section("Summary");
        let width = 9;
        ui::kv("Created", &self.created.to_string(), width);
        ui::kv("Updated", &self.updated.to_string(), width);
        ui::kv("Unchanged", &self.unchanged.to_string(), width);
        ui::kv("Deferred", &self.deferred.to_string(), width);
        ui::kv("Skipped", &self.skipped.to_string(), width);
        let aborted = if self.aborted > 0 {
            self.aborted.to_string().red().to_string()
        } else {
            self.aborted.to_string()
        };
        ui::kv("Aborted", &aborted, width);
    }
}

// ============================================================================
// Command
// ============================================================================

pub fn init(ctx: &Context) -> Result<()> {
    let session = Session::open(ctx)?;
    let server = session.server();
    let clock = SystemClock;
    let reconciler = Reconciler::new(&session.backend, &clock, RetryPolicy::default());

    let org_name = server.default_org.as_deref().with_context(|| {
        format!("Server {} has no default_org, nothing to scope to", session.server_name)
    })?;
    ui::header(&format!("Initializing {} for {org_name}", session.server_name));

    let org_id = id_of(&reconciler.find_or_create(EntityKind::Organization, org_name)?)?;
    let owner = OwnerScope::Organization(org_id);
    let config = &session.config;
    let mut summary = Summary::default();

    ui::section("Settings");
    for (name, value) in &server.settings {
        apply_setting(&reconciler, name, &to_json(value), &mut summary)?;
    }

    ui::section("Sync plans");
    let today = Local::now().date_naive();
    for (name, plan) in &config.syncplans {
        for entity in sync_plan_entities(name, plan, today)? {
            let reconciliation = reconciler.reconcile(&entity.owned_by(owner.clone()))?;
            summary.settle(&reconciler, &reconciliation);
        }
    }

    ui::section("Lifecycle environments");
    for (label, env) in promotion_order(&config.environments) {
        let Some(prior) = reconciler.find_by(EntityKind::LifecycleEnvironment, &owner, "name", &env.prior)?
        else {
            ui::error(&format!("Prior environment {} of {label} not found, skipping", env.prior));
            summary.skipped += 1;
            continue;
        };
        let desired = Entity::new(EntityKind::LifecycleEnvironment)
            .with("label", label.as_str())
            .with("name", env.name.as_str())
            .with("prior_id", id_of(&prior)?)
            .owned_by(owner.clone());
        summary.settle(&reconciler, &reconciler.reconcile(&desired)?);
    }

    ui::section("Domains");
    for (name, domain) in &config.domains {
        let mut desired = with_attributes(Entity::named(EntityKind::Domain, name), &domain.attributes);
        if !domain.locations.is_empty() {
            desired.set("location_ids", ids_of(&reconciler, EntityKind::Location, &domain.locations)?);
        }
        let orgs = organization_ids(&reconciler, &domain.organizations, org_id)?;
        summary.settle(
            &reconciler,
            &reconciler.reconcile(&desired.owned_by(OwnerScope::Organizations(orgs)))?,
        );
    }

    ui::section("Subnets");
    for (name, subnet) in &config.subnets {
        let mut desired = subnet_entity(name, subnet)?;
        if !subnet.locations.is_empty() {
            desired.set("location_ids", ids_of(&reconciler, EntityKind::Location, &subnet.locations)?);
        }
        if !subnet.domains.is_empty() {
            desired.set("domain_ids", ids_of(&reconciler, EntityKind::Domain, &subnet.domains)?);
        }
        let orgs = organization_ids(&reconciler, &subnet.organizations, org_id)?;
        summary.settle(
            &reconciler,
            &reconciler.reconcile(&desired.owned_by(OwnerScope::Organizations(orgs)))?,
        );
    }

    summary.print();
    if summary.aborted > 0 {
        bail!("{} entities could not be reconciled", summary.aborted);
    }
    if summary.total_changes() == 0 && !ctx.quiet {
        ui::info("Everything already up to date");
    }
    Ok(())
}

/// Update a server setting when its value differs. Settings can't be
/// created, so unknown names are reported and skipped.
fn apply_setting(
    reconciler: &Reconciler<'_>,
    name: &str,
    desired: &Value,
    summary: &mut Summary,
) -> Result<()> {
    let Some(current) = reconciler.find(EntityKind::Setting, name)? else {
        ui::warn(&format!("Invalid setting {name}"));
        summary.skipped += 1;
        return Ok(());
    };

    if current.get("value").is_some_and(|v| same_value(v, desired)) {
        log::debug!("Setting {name} already set");
        summary.unchanged += 1;
        return Ok(());
    }

    log::info!(
        "Updating setting {name}: {} -> {}",
        current.get("value").map_or_else(|| "-".into(), value_text),
        value_text(desired)
    );
    let update = Entity::new(EntityKind::Setting)
        .with("id", id_of(&current)?)
        .with("name", name)
        .with("value", desired.clone());
    summary.settle(reconciler, &reconciler.update_existing(&update)?);
    Ok(())
}

/// Which task held the lock of a reconciliation that did not land.
fn blocker_note(reconciliation: &Reconciliation, blocker: Option<&Task>) -> Option<String> {
    if reconciliation.outcome.is_applied() {
        return None;
    }
    let id = reconciliation.state.blocking_task.as_deref()?;
    Some(blocker.map_or_else(
        || format!("blocked by task {id}"),
        |task| format!("blocked by {}", task.summary()),
    ))
}

// ============================================================================
// Desired entities
// ============================================================================

/// Sync plans declared by one `[syncplans.<name>]` section.
///
/// `daily` plans expand into five plans `<name>-1` to `<name>-5` starting
/// tomorrow at 01:00 to 05:00. Other intervals start on the next occurrence
/// of `day` (today included) at midnight.
pub fn sync_plan_entities(name: &str, plan: &SyncPlanConfig, today: NaiveDate) -> Result<Vec<Entity>> {
    let entity = |name: String, at: NaiveDateTime| {
        Entity::named(EntityKind::SyncPlan, name)
            .with("interval", plan.interval.as_str())
            .with("sync_date", at.format(SYNC_DATE_FORMAT).to_string())
            .with("enabled", true)
    };

    if plan.interval == "daily" {
        let tomorrow = today.succ_opt().context("Date out of range")?;
        return (1..=DAILY_PLANS)
            .map(|hour| -> Result<Entity> {
                let at = tomorrow
                    .and_hms_opt(hour, 0, 0)
                    .context("Invalid sync hour")?;
                Ok(entity(format!("{name}-{hour}"), at))
            })
            .collect();
    }

    let day = plan.day.as_deref().with_context(|| {
        format!("Sync plan {name} has interval {} but no day", plan.interval)
    })?;
    let weekday: Weekday = day
        .parse()
        .map_err(|_| anyhow!("Unknown weekday '{day}' in sync plan {name}"))?;
    let at = next_weekday(today, weekday)
        .and_hms_opt(0, 0, 0)
        .context("Invalid sync time")?;
    Ok(vec![entity(name.to_string(), at)])
}

/// `today` when it already is `weekday`, otherwise the next one.
fn next_weekday(today: NaiveDate, weekday: Weekday) -> NaiveDate {
    let shift = (7 + weekday.num_days_from_monday() - today.weekday().num_days_from_monday()) % 7;
    today + Days::new(u64::from(shift))
}

/// Environments ordered so each comes after the one it is promoted from.
///
/// Environments whose prior is not declared here (usually `Library`) go
/// first. Anything left in a cycle keeps its key order at the end, and
/// fails on the prior lookup.
pub fn promotion_order(
    environments: &BTreeMap<String, EnvironmentConfig>,
) -> Vec<(&String, &EnvironmentConfig)> {
    let mut ordered: Vec<(&String, &EnvironmentConfig)> = Vec::with_capacity(environments.len());
    let mut pending: Vec<(&String, &EnvironmentConfig)> = environments.iter().collect();

    loop {
        let (ready, blocked): (Vec<_>, Vec<_>) = pending.into_iter().partition(|(_, env)| {
            ordered.iter().any(|(_, done)| done.name == env.prior)
                || !environments.values().any(|other| other.name == env.prior)
        });
        if ready.is_empty() {
            ordered.extend(blocked);
            return ordered;
        }
        ordered.extend(ready);
        pending = blocked;
    }
}

pub fn subnet_entity(name: &str, subnet: &SubnetConfig) -> Result<Entity> {
    Ok(with_attributes(Entity::named(EntityKind::Subnet, name), &subnet.attributes)
        .with("network", subnet.network.as_str())
        .with("network_type", network_type(&subnet.network)?))
}

/// `IPv4` or `IPv6`, as Foreman spells them. A `/prefix` suffix is ignored.
pub fn network_type(network: &str) -> Result<&'static str> {
    let address = network.split('/').next().unwrap_or(network);
    let address: IpAddr = address
        .parse()
        .with_context(|| format!("Invalid network address '{network}'"))?;
    Ok(if address.is_ipv4() { "IPv4" } else { "IPv6" })
}

fn with_attributes(entity: Entity, attributes: &BTreeMap<String, toml::Value>) -> Entity {
    attributes
        .iter()
        .fold(entity, |entity, (field, value)| entity.with(field.as_str(), to_json(value)))
}

// ============================================================================
// Helpers
// ============================================================================

fn id_of(entity: &Entity) -> Result<u64> {
    entity
        .id()
        .with_context(|| format!("{} {} has no id", entity.kind, entity.display_key()))
}

fn ids_of(reconciler: &Reconciler<'_>, kind: EntityKind, names: &[String]) -> Result<Vec<u64>> {
    names
        .iter()
        .map(|name| id_of(&reconciler.find_or_create(kind, name)?))
        .collect()
}

/// Organization ids for `names`, or just the default organization.
fn organization_ids(reconciler: &Reconciler<'_>, names: &[String], default: u64) -> Result<Vec<u64>> {
    if names.is_empty() {
        return Ok(vec![default]);
    }
    ids_of(reconciler, EntityKind::Organization, names)
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// The API returns some settings as strings regardless of their type.
fn same_value(current: &Value, desired: &Value) -> bool {
    current == desired || value_text(current) == value_text(desired)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn plan(interval: &str, day: Option<&str>) -> SyncPlanConfig {
        SyncPlanConfig {
            interval: interval.into(),
            day: day.map(Into::into),
        }
    }

    fn env(name: &str, prior: &str) -> EnvironmentConfig {
        EnvironmentConfig {
            name: name.into(),
            prior: prior.into(),
        }
    }

    #[test]
    fn test_daily_plan_expands_to_hourly_plans() {
        // 2024-03-06 is a Wednesday
        let plans = sync_plan_entities("nightly", &plan("daily", None), date(2024, 3, 6)).unwrap();
        assert_eq!(plans.len(), 5);
        assert_eq!(plans[0].name(), Some("nightly-1"));
        assert_eq!(plans[0].get_str("sync_date"), Some("2024-03-07 01:00:00"));
        assert_eq!(plans[4].name(), Some("nightly-5"));
        assert_eq!(plans[4].get_str("sync_date"), Some("2024-03-07 05:00:00"));
        assert!(plans.iter().all(|p| p.get_str("interval") == Some("daily")));
    }

    #[test]
    fn test_daily_plan_crosses_month() {
        let plans = sync_plan_entities("n", &plan("daily", None), date(2024, 2, 29)).unwrap();
        assert_eq!(plans[0].get_str("sync_date"), Some("2024-03-01 01:00:00"));
    }

    #[test]
    fn test_weekly_plan_next_weekday() {
        let plans =
            sync_plan_entities("weekend", &plan("weekly", Some("saturday")), date(2024, 3, 6)).unwrap();
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].name(), Some("weekend"));
        assert_eq!(plans[0].get_str("sync_date"), Some("2024-03-09 00:00:00"));
        assert_eq!(plans[0].get("enabled"), Some(&json!(true)));
    }

    #[test]
    fn test_weekly_plan_same_day_is_today() {
        let plans =
            sync_plan_entities("mid", &plan("weekly", Some("Wednesday")), date(2024, 3, 6)).unwrap();
        assert_eq!(plans[0].get_str("sync_date"), Some("2024-03-06 00:00:00"));
    }

    #[test]
    fn test_weekly_plan_wraps_week() {
        let plans =
            sync_plan_entities("mon", &plan("weekly", Some("monday")), date(2024, 3, 6)).unwrap();
        assert_eq!(plans[0].get_str("sync_date"), Some("2024-03-11 00:00:00"));
    }

    #[test]
    fn test_weekly_plan_requires_valid_day() {
        assert!(sync_plan_entities("x", &plan("weekly", None), date(2024, 3, 6)).is_err());
        let err = sync_plan_entities("x", &plan("weekly", Some("funday")), date(2024, 3, 6)).unwrap_err();
        assert!(err.to_string().contains("funday"));
    }

    #[test]
    fn test_promotion_order_follows_priors() {
        let mut envs = BTreeMap::new();
        envs.insert("a-prod".to_string(), env("Production", "Test"));
        envs.insert("b-test".to_string(), env("Test", "Development"));
        envs.insert("c-dev".to_string(), env("Development", "Library"));

        let order: Vec<&str> = promotion_order(&envs).iter().map(|(l, _)| l.as_str()).collect();
        assert_eq!(order, vec!["c-dev", "b-test", "a-prod"]);
    }

    #[test]
    fn test_promotion_order_keeps_cycles() {
        let mut envs = BTreeMap::new();
        envs.insert("x".to_string(), env("X", "Y"));
        envs.insert("y".to_string(), env("Y", "X"));
        envs.insert("z".to_string(), env("Z", "Library"));

        let order: Vec<&str> = promotion_order(&envs).iter().map(|(l, _)| l.as_str()).collect();
        assert_eq!(order, vec!["z", "x", "y"]);
    }

    #[test]
    fn test_network_type() {
        assert_eq!(network_type("10.0.0.0").unwrap(), "IPv4");
        assert_eq!(network_type("192.168.1.0/24").unwrap(), "IPv4");
        assert_eq!(network_type("fd00::").unwrap(), "IPv6");
        assert!(network_type("not-a-network").is_err());
    }

    #[test]
    fn test_subnet_entity_carries_attributes() {
        let mut attributes = BTreeMap::new();
        attributes.insert("mask".to_string(), toml::Value::from("255.255.255.0"));
        attributes.insert("vlanid".to_string(), toml::Value::from(12));
        let subnet = SubnetConfig {
            network: "10.0.0.0".into(),
            organizations: vec![],
            locations: vec![],
            domains: vec![],
            attributes,
        };

        let entity = subnet_entity("provisioning", &subnet).unwrap();
        assert_eq!(entity.name(), Some("provisioning"));
        assert_eq!(entity.get_str("network_type"), Some("IPv4"));
        assert_eq!(entity.get_str("mask"), Some("255.255.255.0"));
        assert_eq!(entity.get("vlanid"), Some(&json!(12)));
    }

    #[test]
    fn test_same_value_compares_text() {
        assert!(same_value(&json!("120"), &json!(120)));
        assert!(same_value(&json!(true), &json!(true)));
        assert!(!same_value(&json!("60"), &json!(120)));
        assert!(same_value(&json!(""), &json!("")));
    }

    #[test]
    fn test_summary_record() {
        let mut summary = Summary::default();
        let entity = Entity::named(EntityKind::Domain, "lab.example.com");
        for outcome in [
            Outcome::Created,
            Outcome::Updated,
            Outcome::Deferred,
            Outcome::Aborted { reason: "HTTP 422".into() },
        ] {
            summary.record(
                &Reconciliation {
                    entity: entity.clone(),
                    outcome,
                    state: reconcile::RetryState::default(),
                },
                None,
            );
        }
        assert_eq!(summary.created, 1);
        assert_eq!(summary.updated, 1);
        assert_eq!(summary.deferred, 1);
        assert_eq!(summary.aborted, 1);
        assert_eq!(summary.total_changes(), 2);
    }

    #[test]
    fn test_blocker_note_names_the_locking_task() {
        let task: Task = serde_json::from_value(json!({
            "id": "t-9",
            "label": "Actions::Katello::Repository::Sync",
            "state": "paused",
            "result": "error",
            "progress": 0.5
        }))
        .unwrap();
        let mut state = reconcile::RetryState::default();
        state.blocking_task = Some("t-9".into());
        let deferred = Reconciliation {
            entity: Entity::named(EntityKind::Domain, "lab.example.com"),
            outcome: Outcome::Aborted { reason: "locked".into() },
            state,
        };

        let note = blocker_note(&deferred, Some(&task)).unwrap();
        assert_eq!(note, format!("blocked by {}", task.summary()));
        assert_eq!(blocker_note(&deferred, None).as_deref(), Some("blocked by task t-9"));

        let landed = Reconciliation { outcome: Outcome::Updated, ..deferred.clone() };
        assert_eq!(blocker_note(&landed, Some(&task)), None);
    }
}
