//! Core types: entity kinds, entities, endpoints and tasks.

use chrono::{DateTime, NaiveDateTime, TimeDelta, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Description stamped on every entity this tool creates or updates.
pub const DESCRIPTION_TAG: &str = "Automatically generated by Forge for Satellite";

/// API namespaces exposed by a Satellite server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiRoot {
    /// Foreman core API (`/api/v2`)
    Foreman,
    /// Katello content API (`/katello/api/v2`)
    Katello,
    /// Foreman tasks API (`/foreman_tasks/api`)
    ForemanTasks,
}

impl ApiRoot {
    pub fn prefix(self) -> &'static str {
        match self {
            Self::Foreman => "/api/v2",
            Self::Katello => "/katello/api/v2",
            Self::ForemanTasks => "/foreman_tasks/api",
        }
    }
}

/// How an entity kind relates to organizations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeRequirement {
    /// Global entity.
    Unscoped,
    /// Belongs to exactly one organization.
    Organization,
    /// May be shared by several organizations.
    Organizations,
}

/// The closed set of remote resource types managed by this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Organization,
    Location,
    Setting,
    SyncPlan,
    LifecycleEnvironment,
    Domain,
    Subnet,
    Product,
    Repository,
}

impl EntityKind {
    pub fn api_root(self) -> ApiRoot {
        match self {
            Self::Organization
            | Self::Location
            | Self::Setting
            | Self::Domain
            | Self::Subnet => ApiRoot::Foreman,
            Self::SyncPlan
            | Self::LifecycleEnvironment
            | Self::Product
            | Self::Repository => ApiRoot::Katello,
        }
    }

    /// Collection path under the API root.
    pub fn collection(self) -> &'static str {
        match self {
            Self::Organization => "organizations",
            Self::Location => "locations",
            Self::Setting => "settings",
            Self::SyncPlan => "sync_plans",
            Self::LifecycleEnvironment => "environments",
            Self::Domain => "domains",
            Self::Subnet => "subnets",
            Self::Product => "products",
            Self::Repository => "repositories",
        }
    }

    /// Field used to match a desired entity with its remote counterpart.
    pub fn key_field(self) -> &'static str {
        match self {
            Self::LifecycleEnvironment => "label",
            _ => "name",
        }
    }

    pub fn scope(self) -> ScopeRequirement {
        match self {
            Self::Organization | Self::Location | Self::Setting => ScopeRequirement::Unscoped,
            Self::Domain | Self::Subnet => ScopeRequirement::Organizations,
            Self::SyncPlan
            | Self::LifecycleEnvironment
            | Self::Product
            | Self::Repository => ScopeRequirement::Organization,
        }
    }

    /// Foreman endpoints expect the attributes nested under the singular name.
    pub fn wrapper(self) -> Option<&'static str> {
        match self.api_root() {
            ApiRoot::Foreman => Some(self.singular()),
            _ => None,
        }
    }

    pub fn accepts_description(self) -> bool {
        !matches!(self, Self::Setting | Self::Domain)
    }

    /// Singular snake_case name, as used in payload wrappers and logs.
    pub fn singular(self) -> &'static str {
        match self {
            Self::Organization => "organization",
            Self::Location => "location",
            Self::Setting => "setting",
            Self::SyncPlan => "sync_plan",
            Self::LifecycleEnvironment => "environment",
            Self::Domain => "domain",
            Self::Subnet => "subnet",
            Self::Product => "product",
            Self::Repository => "repository",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.singular())
    }
}

/// Organization ownership of an entity.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum OwnerScope {
    #[default]
    Global,
    Organization(u64),
    Organizations(Vec<u64>),
}

impl OwnerScope {
    /// Organization used to scope searches, if any.
    pub fn search_organization(&self) -> Option<u64> {
        match self {
            Self::Organization(id) => Some(*id),
            _ => None,
        }
    }
}

/// A collection endpoint on the remote API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub root: ApiRoot,
    pub path: String,
    /// Sent as `organization_id` on searches.
    pub organization_id: Option<u64>,
}

impl Endpoint {
    pub fn new(root: ApiRoot, path: impl Into<String>) -> Self {
        Self {
            root,
            path: path.into(),
            organization_id: None,
        }
    }

    pub fn for_kind(kind: EntityKind, owner: &OwnerScope) -> Self {
        Self {
            root: kind.api_root(),
            path: kind.collection().to_string(),
            organization_id: owner.search_organization(),
        }
    }

    pub fn tasks() -> Self {
        Self::new(ApiRoot::ForemanTasks, "tasks")
    }

    /// Path relative to the server, e.g. `/katello/api/v2/products`.
    pub fn url_path(&self) -> String {
        format!("{}/{}", self.root.prefix(), self.path)
    }

    pub fn member_path(&self, id: &str) -> String {
        format!("{}/{}/{}", self.root.prefix(), self.path, id)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url_path())
    }
}

/// A remote resource instance, desired or observed.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    pub kind: EntityKind,
    pub attributes: Map<String, Value>,
    pub owner: OwnerScope,
}

impl Entity {
    pub fn new(kind: EntityKind) -> Self {
        Self {
            kind,
            attributes: Map::new(),
            owner: OwnerScope::Global,
        }
    }

    /// Shorthand for a named entity.
    pub fn named(kind: EntityKind, name: impl Into<String>) -> Self {
        Self::new(kind).with("name", name.into())
    }

    /// Build from a search or mutation response.
    pub fn from_remote(kind: EntityKind, value: Value, owner: OwnerScope) -> Option<Self> {
        match value {
            Value::Object(attributes) => Some(Self {
                kind,
                attributes,
                owner,
            }),
            _ => None,
        }
    }

    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(field, value);
        self
    }

    pub fn owned_by(mut self, owner: OwnerScope) -> Self {
        self.owner = owner;
        self
    }

    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        self.attributes.insert(field.into(), value.into());
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.attributes.get(field)
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.get(field).and_then(Value::as_str)
    }

    pub fn id(&self) -> Option<u64> {
        self.get("id").and_then(Value::as_u64)
    }

    pub fn name(&self) -> Option<&str> {
        self.get_str("name")
    }

    /// Value of the kind's key field.
    pub fn key_value(&self) -> Option<&Value> {
        self.get(self.kind.key_field())
    }

    /// Human label for logs: the key value when present.
    pub fn display_key(&self) -> String {
        match self.key_value() {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => "<unnamed>".to_string(),
        }
    }

    /// Overlay `desired` onto this entity. Desired values win; fields absent
    /// from `desired` keep their current value.
    pub fn merged_with(&self, desired: &Entity) -> Entity {
        let mut attributes = self.attributes.clone();
        for (field, value) in &desired.attributes {
            attributes.insert(field.clone(), value.clone());
        }
        Entity {
            kind: self.kind,
            attributes,
            owner: desired.owner.clone(),
        }
    }

    /// JSON payload for create/update.
    ///
    /// Read-only bookkeeping fields are dropped, organization ownership is
    /// added, and Foreman kinds are wrapped under their singular name.
    pub fn request_body(&self) -> Value {
        let mut body: Map<String, Value> = self
            .attributes
            .iter()
            .filter(|(field, _)| !matches!(field.as_str(), "id" | "created_at" | "updated_at"))
            .map(|(field, value)| (field.clone(), value.clone()))
            .collect();

        if !self.kind.accepts_description() {
            body.remove("description");
        }

        match &self.owner {
            OwnerScope::Global => {}
            OwnerScope::Organization(id) => {
                body.insert("organization_id".into(), Value::from(*id));
            }
            OwnerScope::Organizations(ids) => {
                body.insert("organization_ids".into(), Value::from(ids.clone()));
            }
        }

        match self.kind.wrapper() {
            Some(wrapper) => {
                let mut outer = Map::new();
                outer.insert(wrapper.to_string(), Value::Object(body));
                Value::Object(outer)
            }
            None => Value::Object(body),
        }
    }
}

/// Remote connection parameters.
#[derive(Debug, Clone)]
pub struct Connection {
    /// Base URL, e.g. `https://satellite.example.com`
    pub url: String,
    pub username: String,
    pub password: String,
    pub verify_tls: bool,
}

// =============================================================================
// Tasks
// =============================================================================

/// Execution state of a remote task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Scheduled,
    Running,
    Paused,
    Stopped,
    #[default]
    #[serde(other)]
    Unknown,
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Scheduled => "scheduled",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
            Self::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// Outcome of a remote task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskResult {
    Success,
    Warning,
    Pending,
    Error,
    #[default]
    #[serde(other)]
    Unknown,
}

impl fmt::Display for TaskResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Success => "success",
            Self::Warning => "warning",
            Self::Pending => "pending",
            Self::Error => "error",
            Self::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// Display strings computed by the server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Humanized {
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub input: Option<Value>,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default, deserialize_with = "null_default")]
    pub errors: Vec<String>,
}

/// An asynchronous unit of remote work.
///
/// The tasks API sends `null` for fields it has not computed yet, so every
/// non-optional field falls back to its default.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default, deserialize_with = "null_default")]
    pub state: TaskState,
    #[serde(default, deserialize_with = "null_default")]
    pub result: TaskResult,
    #[serde(default, deserialize_with = "null_default")]
    pub pending: bool,
    #[serde(default, deserialize_with = "null_default")]
    pub progress: f64,
    #[serde(default)]
    pub started_at: Option<String>,
    #[serde(default)]
    pub ended_at: Option<String>,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub output: Value,
    #[serde(default, deserialize_with = "null_default")]
    pub humanized: Humanized,
}

fn null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl Task {
    /// Progress as a percentage with two decimals, e.g. `37.50%`.
    pub fn progress_percent(&self) -> String {
        format!("{:.2}%", self.progress * 100.0)
    }

    pub fn label(&self) -> &str {
        self.label.as_deref().unwrap_or("-")
    }

    pub fn is_paused(&self) -> bool {
        self.state == TaskState::Paused
    }

    /// Wall time between start and end, when both are known.
    pub fn duration(&self) -> Option<TimeDelta> {
        let start = parse_timestamp(self.started_at.as_deref()?)?;
        let end = parse_timestamp(self.ended_at.as_deref()?)?;
        Some(end - start)
    }

    /// Names found in the task input (`{"product": {"name": ...}}`).
    pub fn input_names(&self) -> Vec<(String, String)> {
        let Some(input) = self.input.as_object() else {
            return Vec::new();
        };
        input
            .iter()
            .filter_map(|(k, v)| {
                v.get("name")
                    .and_then(Value::as_str)
                    .map(|name| (k.clone(), name.to_string()))
            })
            .collect()
    }

    /// One-line summary used in lock and idle-wait logs.
    pub fn summary(&self) -> String {
        format!(
            "{}: {} Started {}, State: {} Result: {} Progress: {}",
            self.id,
            self.label(),
            self.started_at.as_deref().unwrap_or("-"),
            self.state,
            self.result,
            self.progress_percent()
        )
    }

    /// Best-effort view of a task the full decoder rejected: id, label and
    /// state when present, defaults for the rest.
    pub fn lossy(raw: &Value) -> Option<Self> {
        let id = match raw.get("id")? {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            _ => return None,
        };
        Some(Self {
            id,
            label: raw.get("label").and_then(Value::as_str).map(str::to_string),
            state: raw
                .get("state")
                .and_then(|v| TaskState::deserialize(v).ok())
                .unwrap_or_default(),
            ..Self::default()
        })
    }
}

/// Parse the timestamp formats returned by the tasks API.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    let trimmed = raw.trim_end_matches(" UTC");
    NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}
