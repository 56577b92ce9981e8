//! Create-or-update reconciliation of desired entities.
//!
//! [`Reconciler::reconcile`] runs an explicit loop:
//!
//! 1. search the remote collection on the kind's key field
//! 2. update the first match (desired attributes merged over remote ones),
//!    or create when nothing matches
//! 3. classify the mutation response once into a [`Classified`] outcome and
//!    act on it: return, retry as update, wait for a lock, or give up
//!
//! Failures that only concern the current entity are logged and reported in
//! the returned [`Reconciliation`]. Anything outside the known error classes
//! is returned as `Err` and is expected to stop the run.

use crate::backend::Backend;
use crate::clock::Clock;
use crate::error::{Error, ErrorCategory, Result};
use crate::query::{Filter, FilterValue};
use crate::retry::{FailureKind, RetryPolicy, RetryState};
use crate::tasks::TaskTracker;
use crate::types::{DESCRIPTION_TAG, Endpoint, Entity, EntityKind, OwnerScope, Task};
use serde_json::Value;
use std::cell::RefCell;
use std::collections::HashMap;

/// Mutation issued for one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Create,
    Update,
}

impl Operation {
    fn verb(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
        }
    }
}

/// A mutation response, classified once.
#[derive(Debug)]
pub enum Classified {
    Success(Value),
    /// A create was rejected because the key already exists.
    Conflict,
    Locked { task_id: Option<String>, body: String },
    SoftTimeout(String),
    OtherError { status: u16, body: String },
    Fatal(Error),
}

impl Classified {
    pub fn from_response(operation: Operation, response: Result<Value>) -> Self {
        let err = match response {
            Ok(value) => return Self::Success(value),
            Err(err) => err,
        };
        match (err.category(), err) {
            (ErrorCategory::Conflict, _) if operation == Operation::Create => Self::Conflict,
            (ErrorCategory::Locked, err) => Self::Locked {
                task_id: err.lock_owner(),
                body: err.to_string(),
            },
            (ErrorCategory::SoftTimeout, err) => Self::SoftTimeout(err.to_string()),
            (_, Error::Http { status, body }) => Self::OtherError { status, body },
            (_, err) => Self::Fatal(err),
        }
    }
}

/// How a reconciliation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Created,
    Updated,
    /// The server timed out waiting on its own task; the change lands later.
    Deferred,
    /// Given up for this entity; the run continues.
    Aborted { reason: String },
}

impl Outcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Created | Self::Updated)
    }
}

/// Result of one [`Reconciler::reconcile`] call.
#[derive(Debug, Clone)]
pub struct Reconciliation {
    /// Remote entity on success, the desired entity otherwise.
    pub entity: Entity,
    pub outcome: Outcome,
    pub state: RetryState,
}

enum LockResolution {
    Wait(Task),
    Paused(Task),
    Unresolved,
}

/// Brings remote entities in line with desired ones.
pub struct Reconciler<'a> {
    backend: &'a dyn Backend,
    clock: &'a dyn Clock,
    policy: RetryPolicy,
    tasks: TaskTracker<'a>,
    resolved: RefCell<HashMap<(EntityKind, String), Entity>>,
}

impl<'a> Reconciler<'a> {
    pub fn new(backend: &'a dyn Backend, clock: &'a dyn Clock, policy: RetryPolicy) -> Self {
        let tasks = TaskTracker::new(backend, clock, &policy);
        Self {
            backend,
            clock,
            policy,
            tasks,
            resolved: RefCell::new(HashMap::new()),
        }
    }

    /// Task tracker sharing this reconciler's backend and clock.
    pub fn tasks(&self) -> &TaskTracker<'a> {
        &self.tasks
    }

    /// Create or update `desired` on the server.
    pub fn reconcile(&self, desired: &Entity) -> Result<Reconciliation> {
        let mut desired = desired.clone();
        if desired.kind.accepts_description() {
            desired.set("description", DESCRIPTION_TAG);
        }

        let filter = self.match_filter(&desired)?;
        let endpoint = Endpoint::for_kind(desired.kind, &desired.owner);
        let mut state = RetryState::default();
        let mut conflicted = false;

        loop {
            let existing = self.search(&endpoint, &filter, &desired, desired.kind.key_field())?;

            let (operation, response) = match existing {
                Some(current) => {
                    let merged = current.merged_with(&desired);
                    log::debug!("Resulting item: {:?}", merged.attributes);
                    let Some(id) = current.id() else {
                        return Err(Error::InvalidResponse(format!(
                            "{} {} has no id",
                            desired.kind,
                            desired.display_key()
                        )));
                    };
                    let response =
                        self.backend
                            .update(&endpoint, &id.to_string(), &merged.request_body());
                    (Operation::Update, response)
                }
                None if conflicted => {
                    let reason = format!(
                        "{} {} reported as existing but not found by search",
                        desired.kind,
                        desired.display_key()
                    );
                    log::error!("{reason}");
                    return Ok(Self::aborted(desired, reason, state));
                }
                None => {
                    log::debug!("No item found matching {:?}", filter.build().search);
                    let response = self.backend.create(&endpoint, &desired.request_body());
                    (Operation::Create, response)
                }
            };
            state.attempts += 1;
            log::debug!("Response: {response:?}");

            match Classified::from_response(operation, response) {
                Classified::Success(value) => {
                    log::debug!("{} {} {}", operation.verb(), desired.kind, desired.display_key());
                    let outcome = match operation {
                        Operation::Create => Outcome::Created,
                        Operation::Update => Outcome::Updated,
                    };
                    let entity = Entity::from_remote(desired.kind, value, desired.owner.clone())
                        .unwrap_or_else(|| desired.clone());
                    return Ok(Reconciliation {
                        entity,
                        outcome,
                        state,
                    });
                }
                Classified::Conflict => {
                    log::debug!(
                        "{} {} {}: Item is already present, updating",
                        operation.verb(),
                        desired.kind,
                        desired.display_key()
                    );
                    state.record(FailureKind::Conflict);
                    conflicted = true;
                }
                Classified::Locked { task_id, body } => {
                    log::debug!("{} {} {}: Task locked", operation.verb(), desired.kind, desired.display_key());
                    state.record(FailureKind::Locked);
                    state.blocking_task.clone_from(&task_id);

                    match self.resolve_lock(task_id.as_deref())? {
                        LockResolution::Paused(task) => {
                            log::error!("Task {} is in paused state, skipping job", task.id);
                            state.record(FailureKind::LockedPaused);
                            let reason = format!("locked by paused task {}", task.id);
                            return Ok(Self::aborted(desired, reason, state));
                        }
                        LockResolution::Unresolved => {
                            log::error!("{} locked: {body}", desired.kind);
                            return Ok(Self::aborted(desired, body, state));
                        }
                        LockResolution::Wait(task) => {
                            log::warn!("{} locked by task {}", desired.kind, task.summary());
                            if !self.policy.allows_lock_wait(state.lock_waits) {
                                let reason = format!(
                                    "still locked by task {} after {} waits",
                                    task.id, state.lock_waits
                                );
                                log::error!("{reason}");
                                return Ok(Self::aborted(desired, reason, state));
                            }
                            self.clock.sleep(self.policy.lock_delay);
                            state.lock_waits += 1;
                        }
                    }
                }
                Classified::SoftTimeout(body) => {
                    log::error!("Task timeout, skipping: {body}");
                    state.record(FailureKind::SoftTimeout);
                    return Ok(Reconciliation {
                        entity: desired,
                        outcome: Outcome::Deferred,
                        state,
                    });
                }
                Classified::OtherError { status, body } => {
                    log::error!(
                        "Error running {} on {}: {status}  {body}",
                        operation.verb(),
                        desired.kind
                    );
                    log::debug!("Item: {:?}", desired.attributes);
                    state.record(FailureKind::Http(status));
                    let reason = format!("HTTP {status}");
                    return Ok(Self::aborted(desired, reason, state));
                }
                Classified::Fatal(err) => {
                    log::error!("Unknown exception {err}: {desired:?}");
                    return Err(err);
                }
            }
        }
    }

    /// Search the kind's collection for an exact key match.
    pub fn find(&self, kind: EntityKind, value: &str) -> Result<Option<Entity>> {
        self.find_by(kind, &OwnerScope::Global, kind.key_field(), value)
    }

    /// Search for an exact match on an arbitrary field within an owner scope.
    pub fn find_by(
        &self,
        kind: EntityKind,
        owner: &OwnerScope,
        field: &str,
        value: &str,
    ) -> Result<Option<Entity>> {
        let wanted = Entity::new(kind).with(field, value).owned_by(owner.clone());
        let filter = Filter::by(field, value);
        let endpoint = Endpoint::for_kind(kind, owner);
        let found = self.search(&endpoint, &filter, &wanted, field)?;
        if found.is_none() {
            log::warn!("Unable to get {kind} with {field} {value}");
        }
        Ok(found)
    }

    /// Look up an entity by name, creating it when missing. Results are
    /// cached for the lifetime of the reconciler.
    pub fn find_or_create(&self, kind: EntityKind, name: &str) -> Result<Entity> {
        let cache_key = (kind, name.to_string());
        if let Some(entity) = self.resolved.borrow().get(&cache_key) {
            return Ok(entity.clone());
        }

        let entity = match self.find(kind, name)? {
            Some(entity) => entity,
            None => {
                let reconciled = self.reconcile(&Entity::named(kind, name))?;
                if !reconciled.outcome.is_applied() {
                    return Err(Error::Other(format!("could not create {kind} {name}")));
                }
                reconciled.entity
            }
        };
        self.resolved.borrow_mut().insert(cache_key, entity.clone());
        Ok(entity)
    }

    /// Update an existing remote entity in place, without searching.
    pub fn update_existing(&self, entity: &Entity) -> Result<Reconciliation> {
        let id = entity.id().ok_or_else(|| Error::MissingKey {
            kind: entity.kind.to_string(),
            field: "id".into(),
        })?;
        let endpoint = Endpoint::for_kind(entity.kind, &entity.owner);
        let response = self
            .backend
            .update(&endpoint, &id.to_string(), &entity.request_body());
        let mut state = RetryState {
            attempts: 1,
            ..RetryState::default()
        };
        match Classified::from_response(Operation::Update, response) {
            Classified::Success(value) => Ok(Reconciliation {
                entity: Entity::from_remote(entity.kind, value, entity.owner.clone())
                    .unwrap_or_else(|| entity.clone()),
                outcome: Outcome::Updated,
                state,
            }),
            Classified::Fatal(err) => Err(err),
            Classified::SoftTimeout(body) => {
                log::error!("Task timeout, skipping: {body}");
                state.record(FailureKind::SoftTimeout);
                Ok(Reconciliation {
                    entity: entity.clone(),
                    outcome: Outcome::Deferred,
                    state,
                })
            }
            other => {
                log::error!("Error running update on {}: {other:?}", entity.kind);
                Ok(Self::aborted(entity.clone(), format!("{other:?}"), state))
            }
        }
    }

    fn match_filter(&self, desired: &Entity) -> Result<Filter> {
        let field = desired.kind.key_field();
        let value = desired
            .key_value()
            .and_then(FilterValue::from_json)
            .ok_or_else(|| Error::MissingKey {
                kind: desired.kind.to_string(),
                field: field.to_string(),
            })?;
        let mut filter = Filter::by(field, value);
        if let Some(product) = desired.get("product_id").and_then(FilterValue::from_json) {
            filter.insert("product_id", product);
        }
        Ok(filter)
    }

    fn query(&self, endpoint: &Endpoint, filter: &Filter) -> Result<Vec<Value>> {
        let query = filter.build();
        log::debug!("Searching for {query:?} on {endpoint}");
        match self.backend.search(endpoint, &query) {
            Ok(results) => Ok(results),
            Err(e) if e.category() == ErrorCategory::NotFound => Ok(Vec::new()),
            Err(e) => {
                log::error!("Search Error {}: {e}", e.status().unwrap_or_default());
                Err(Error::RemoteQuery {
                    endpoint: endpoint.url_path(),
                    source: Box::new(e),
                })
            }
        }
    }

    /// Exact match on `key` among search results; the lowest id wins on
    /// duplicates.
    fn search(
        &self,
        endpoint: &Endpoint,
        filter: &Filter,
        desired: &Entity,
        key: &str,
    ) -> Result<Option<Entity>> {
        let wanted = desired.get(key);
        let mut matches: Vec<Entity> = self
            .query(endpoint, filter)?
            .into_iter()
            .filter_map(|v| Entity::from_remote(desired.kind, v, desired.owner.clone()))
            .filter(|candidate| candidate.get(key) == wanted)
            .collect();

        if matches.len() > 1 {
            log::warn!(
                "Found more than one item matching {:?}, taking the first.",
                filter.build().search
            );
            matches.sort_by_key(|e| e.id().unwrap_or(u64::MAX));
        }
        Ok(matches.into_iter().next())
    }

    fn resolve_lock(&self, task_id: Option<&str>) -> Result<LockResolution> {
        let Some(task_id) = task_id else {
            return Ok(LockResolution::Unresolved);
        };
        Ok(match self.tasks.get_first("id", task_id)? {
            Some(task) if task.is_paused() => LockResolution::Paused(task),
            Some(task) => LockResolution::Wait(task),
            None => LockResolution::Unresolved,
        })
    }

    fn aborted(entity: Entity, reason: impl Into<String>, state: RetryState) -> Reconciliation {
        Reconciliation {
            entity,
            outcome: Outcome::Aborted {
                reason: reason.into(),
            },
            state,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LOCK_MESSAGE;
    use crate::testing::{FakeBackend, FakeClock};
    use serde_json::json;
    use std::time::Duration;

    fn locked_by(task_id: &str) -> Error {
        Error::http(
            500,
            format!(
                "{{\"displayMessage\":\"{LOCK_MESSAGE}.\\n\\nCurrent lock owners:\\n\\n* https://sat.example.com/foreman_tasks/tasks/{task_id}\"}}"
            ),
        )
    }

    fn plan() -> Entity {
        Entity::named(EntityKind::SyncPlan, "weekly-1")
            .with("interval", "weekly")
            .owned_by(OwnerScope::Organization(1))
    }

    #[test]
    fn test_create_when_missing() {
        let backend = FakeBackend::new();
        let clock = FakeClock::default();
        let reconciler = Reconciler::new(&backend, &clock, RetryPolicy::default());

        let result = reconciler.reconcile(&plan()).unwrap();
        assert_eq!(result.outcome, Outcome::Created);
        assert_eq!(backend.create_count(), 1);
        assert_eq!(backend.update_count(), 0);
        let body = &backend.creates.borrow()[0];
        assert_eq!(body["description"], json!(DESCRIPTION_TAG));
        assert_eq!(body["organization_id"], json!(1));
        assert_eq!(
            backend.searches.borrow()[0].1.search,
            r#"name = "weekly-1""#
        );
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let backend = FakeBackend::new();
        let clock = FakeClock::default();
        let reconciler = Reconciler::new(&backend, &clock, RetryPolicy::default());

        let first = reconciler.reconcile(&plan()).unwrap();
        let before = backend.records("sync_plans");
        let second = reconciler.reconcile(&plan()).unwrap();

        assert_eq!(first.outcome, Outcome::Created);
        assert_eq!(second.outcome, Outcome::Updated);
        assert_eq!(first.entity.id(), second.entity.id());
        assert_eq!(backend.create_count(), 1);
        assert_eq!(backend.update_count(), 1);
        assert_eq!(backend.records("sync_plans"), before);
    }

    #[test]
    fn test_update_merges_desired_over_remote() {
        let backend = FakeBackend::new();
        backend.seed(
            "subnets",
            json!({"id": 7, "name": "prov", "mask": "255.255.0.0", "gateway": "10.0.0.1"}),
        );
        let clock = FakeClock::default();
        let reconciler = Reconciler::new(&backend, &clock, RetryPolicy::default());

        let desired = Entity::named(EntityKind::Subnet, "prov").with("mask", "255.255.255.0");
        let result = reconciler.reconcile(&desired).unwrap();

        assert_eq!(result.outcome, Outcome::Updated);
        let updates = backend.updates.borrow();
        assert_eq!(updates[0].0, "7");
        assert_eq!(updates[0].1["subnet"]["mask"], json!("255.255.255.0"));
        assert_eq!(updates[0].1["subnet"]["gateway"], json!("10.0.0.1"));
    }

    #[test]
    fn test_duplicates_take_lowest_id() {
        let backend = FakeBackend::new();
        backend.seed("subnets", json!({"id": 9, "name": "prov"}));
        backend.seed("subnets", json!({"id": 3, "name": "prov"}));
        let clock = FakeClock::default();
        let reconciler = Reconciler::new(&backend, &clock, RetryPolicy::default());

        let result = reconciler
            .reconcile(&Entity::named(EntityKind::Subnet, "prov"))
            .unwrap();
        assert_eq!(result.outcome, Outcome::Updated);
        assert_eq!(backend.updates.borrow()[0].0, "3");
    }

    #[test]
    fn test_product_id_disambiguates_repositories() {
        let backend = FakeBackend::new();
        let clock = FakeClock::default();
        let reconciler = Reconciler::new(&backend, &clock, RetryPolicy::default());

        let repo = Entity::named(EntityKind::Repository, "nova-compute")
            .with("product_id", 12)
            .owned_by(OwnerScope::Organization(1));
        reconciler.reconcile(&repo).unwrap();
        assert_eq!(
            backend.searches.borrow()[0].1.search,
            r#"name = "nova-compute" AND product_id = 12"#
        );
    }

    /// Backend whose record only shows up once a create has been attempted,
    /// as when another client wins the race.
    struct AppearsAfterCreate<'b>(&'b FakeBackend);

    impl Backend for AppearsAfterCreate<'_> {
        fn search(&self, e: &Endpoint, q: &crate::query::SearchQuery) -> Result<Vec<Value>> {
            self.0.search(e, q)
        }
        fn create(&self, e: &Endpoint, b: &Value) -> Result<Value> {
            let response = self.0.create(e, b);
            self.0.seed(
                "sync_plans",
                json!({"id": 55, "name": "weekly-1", "interval": "daily"}),
            );
            response
        }
        fn update(&self, e: &Endpoint, id: &str, b: &Value) -> Result<Value> {
            self.0.update(e, id, b)
        }
    }

    #[test]
    fn test_conflict_on_create_switches_to_single_update() {
        let backend = FakeBackend::new();
        backend.script(Err(Error::http(422, "Name has already been taken")));
        let racing = AppearsAfterCreate(&backend);
        let clock = FakeClock::default();
        let reconciler = Reconciler::new(&racing, &clock, RetryPolicy::default());

        let desired = plan();
        let result = reconciler.reconcile(&desired).unwrap();

        assert_eq!(result.outcome, Outcome::Updated);
        assert_eq!(result.state.attempts, 2);
        assert_eq!(result.state.last_failure, Some(FailureKind::Conflict));
        assert_eq!(backend.create_count(), 1);
        assert_eq!(backend.update_count(), 1);

        let updates = backend.updates.borrow();
        assert_eq!(updates[0].0, "55");
        for (field, value) in &desired.attributes {
            assert_eq!(&updates[0].1[field], value);
        }
        assert_eq!(result.entity.get_str("interval"), Some("weekly"));
    }

    #[test]
    fn test_conflict_without_match_aborts() {
        let backend = FakeBackend::new();
        backend.script(Err(Error::http(409, "exists")));
        let clock = FakeClock::default();
        let reconciler = Reconciler::new(&backend, &clock, RetryPolicy::default());

        let result = reconciler.reconcile(&plan()).unwrap();
        assert!(matches!(result.outcome, Outcome::Aborted { .. }));
        assert_eq!(backend.create_count(), 1);
        assert_eq!(backend.update_count(), 0);
    }

    #[test]
    fn test_lock_retry_waits_then_succeeds() {
        let backend = FakeBackend::new();
        backend.seed("tasks", json!({"id": "t-1", "state": "running", "progress": 0.5}));
        backend.script(Err(locked_by("t-1")));
        backend.script(Err(locked_by("t-1")));
        let clock = FakeClock::default();
        let reconciler = Reconciler::new(&backend, &clock, RetryPolicy::default());

        let result = reconciler.reconcile(&plan()).unwrap();

        assert_eq!(result.outcome, Outcome::Created);
        assert_eq!(result.state.attempts, 3);
        assert_eq!(result.state.lock_waits, 2);
        assert_eq!(result.state.blocking_task.as_deref(), Some("t-1"));
        assert_eq!(
            *clock.sleeps.borrow(),
            vec![Duration::from_secs(5), Duration::from_secs(5)]
        );
        assert!(result.entity.id().is_some());
    }

    #[test]
    fn test_lock_owner_with_null_fields_is_waited_on() {
        let backend = FakeBackend::new();
        backend.seed(
            "tasks",
            json!({"id": "t-4", "state": "running", "progress": null, "pending": null}),
        );
        backend.script(Err(locked_by("t-4")));
        let clock = FakeClock::default();
        let reconciler = Reconciler::new(&backend, &clock, RetryPolicy::default());

        let result = reconciler.reconcile(&plan()).unwrap();

        assert_eq!(result.outcome, Outcome::Created);
        assert_eq!(result.state.lock_waits, 1);
        let owner = reconciler.tasks().cached("t-4").unwrap();
        assert_eq!(owner.progress_percent(), "0.00%");
    }

    #[test]
    fn test_paused_lock_aborts_without_waiting() {
        let backend = FakeBackend::new();
        backend.seed("tasks", json!({"id": "t-2", "state": "paused"}));
        backend.script(Err(locked_by("t-2")));
        let clock = FakeClock::default();
        let reconciler = Reconciler::new(&backend, &clock, RetryPolicy::default());

        let result = reconciler.reconcile(&plan()).unwrap();

        assert!(matches!(result.outcome, Outcome::Aborted { .. }));
        assert_eq!(result.state.last_failure, Some(FailureKind::LockedPaused));
        assert_eq!(clock.sleep_count(), 0);
        assert_eq!(result.entity.name(), Some("weekly-1"));
    }

    #[test]
    fn test_unresolvable_lock_aborts() {
        let backend = FakeBackend::new();
        backend.script(Err(Error::http(500, LOCK_MESSAGE)));
        let clock = FakeClock::default();
        let reconciler = Reconciler::new(&backend, &clock, RetryPolicy::default());

        let result = reconciler.reconcile(&plan()).unwrap();
        assert!(matches!(result.outcome, Outcome::Aborted { .. }));
        assert_eq!(clock.sleep_count(), 0);
    }

    #[test]
    fn test_lock_cap_is_honored() {
        let backend = FakeBackend::new();
        backend.seed("tasks", json!({"id": "t-3", "state": "running"}));
        for _ in 0..5 {
            backend.script(Err(locked_by("t-3")));
        }
        let clock = FakeClock::default();
        let reconciler =
            Reconciler::new(&backend, &clock, RetryPolicy::default().with_max_lock_waits(2));

        let result = reconciler.reconcile(&plan()).unwrap();
        assert!(matches!(result.outcome, Outcome::Aborted { .. }));
        assert_eq!(result.state.lock_waits, 2);
        assert_eq!(clock.sleep_count(), 2);
    }

    #[test]
    fn test_soft_timeout_returns_entity_unmodified() {
        let backend = FakeBackend::new();
        backend.script(Err(Error::http(500, "foreman_tasks_sync_task_timeout")));
        let clock = FakeClock::default();
        let reconciler = Reconciler::new(&backend, &clock, RetryPolicy::default());

        let result = reconciler.reconcile(&plan()).unwrap();
        assert_eq!(result.outcome, Outcome::Deferred);
        assert_eq!(result.entity.get_str("interval"), Some("weekly"));
        assert!(result.entity.id().is_none());
    }

    #[test]
    fn test_other_http_error_returns_original() {
        let backend = FakeBackend::new();
        backend.script(Err(Error::http(403, "Access denied")));
        let clock = FakeClock::default();
        let reconciler = Reconciler::new(&backend, &clock, RetryPolicy::default());

        let result = reconciler.reconcile(&plan()).unwrap();
        assert_eq!(
            result.outcome,
            Outcome::Aborted {
                reason: "HTTP 403".into()
            }
        );
        assert_eq!(result.state.last_failure, Some(FailureKind::Http(403)));
        assert_eq!(result.entity.name(), Some("weekly-1"));
    }

    #[test]
    fn test_conflict_on_update_is_plain_error() {
        let backend = FakeBackend::new();
        backend.seed("sync_plans", json!({"id": 1, "name": "weekly-1"}));
        backend.script(Err(Error::http(422, "Validation failed")));
        let clock = FakeClock::default();
        let reconciler = Reconciler::new(&backend, &clock, RetryPolicy::default());

        let result = reconciler.reconcile(&plan()).unwrap();
        assert_eq!(result.state.last_failure, Some(FailureKind::Http(422)));
        assert_eq!(backend.update_count(), 1);
    }

    #[test]
    fn test_unknown_failure_is_fatal() {
        let backend = FakeBackend::new();
        backend.script(Err(Error::Transport("connection reset by peer".into())));
        let clock = FakeClock::default();
        let reconciler = Reconciler::new(&backend, &clock, RetryPolicy::default());

        let err = reconciler.reconcile(&plan()).unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }

    #[test]
    fn test_missing_key_is_rejected() {
        let backend = FakeBackend::new();
        let clock = FakeClock::default();
        let reconciler = Reconciler::new(&backend, &clock, RetryPolicy::default());

        let env = Entity::named(EntityKind::LifecycleEnvironment, "Development");
        let err = reconciler.reconcile(&env).unwrap_err();
        assert!(matches!(err, Error::MissingKey { .. }));
    }

    #[test]
    fn test_find_or_create_caches() {
        let backend = FakeBackend::new();
        backend.seed("organizations", json!({"id": 1, "name": "ACME"}));
        let clock = FakeClock::default();
        let reconciler = Reconciler::new(&backend, &clock, RetryPolicy::default());

        let org = reconciler
            .find_or_create(EntityKind::Organization, "ACME")
            .unwrap();
        let again = reconciler
            .find_or_create(EntityKind::Organization, "ACME")
            .unwrap();
        assert_eq!(org.id(), Some(1));
        assert_eq!(again.id(), Some(1));
        assert_eq!(backend.searches.borrow().len(), 1);

        let loc = reconciler
            .find_or_create(EntityKind::Location, "Lab")
            .unwrap();
        assert_eq!(loc.id(), Some(100));
        assert_eq!(backend.create_count(), 1);
    }

    #[test]
    fn test_find_by_name_within_organization() {
        let backend = FakeBackend::new();
        backend.seed(
            "environments",
            json!({"id": 2, "name": "Library", "label": "Library"}),
        );
        let clock = FakeClock::default();
        let reconciler = Reconciler::new(&backend, &clock, RetryPolicy::default());

        let library = reconciler
            .find_by(
                EntityKind::LifecycleEnvironment,
                &OwnerScope::Organization(1),
                "name",
                "Library",
            )
            .unwrap();
        assert_eq!(library.and_then(|e| e.id()), Some(2));
        assert!(
            reconciler
                .find_by(
                    EntityKind::LifecycleEnvironment,
                    &OwnerScope::Organization(1),
                    "name",
                    "Production",
                )
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_classified_from_response() {
        assert!(matches!(
            Classified::from_response(Operation::Create, Err(Error::http(409, ""))),
            Classified::Conflict
        ));
        assert!(matches!(
            Classified::from_response(Operation::Update, Err(Error::http(409, ""))),
            Classified::OtherError { status: 409, .. }
        ));
        assert!(matches!(
            Classified::from_response(Operation::Update, Err(Error::InvalidResponse("x".into()))),
            Classified::Fatal(_)
        ));
        assert!(matches!(
            Classified::from_response(Operation::Update, Ok(json!({}))),
            Classified::Success(_)
        ));
    }
}
