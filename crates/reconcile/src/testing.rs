//! In-memory backend and clock used by unit tests.

use crate::backend::Backend;
use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::query::SearchQuery;
use crate::types::Endpoint;
use serde_json::{Map, Value};
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

/// Clock that records sleeps instead of blocking.
#[derive(Default)]
pub struct FakeClock {
    pub sleeps: RefCell<Vec<Duration>>,
}

impl FakeClock {
    pub fn sleep_count(&self) -> usize {
        self.sleeps.borrow().len()
    }
}

impl Clock for FakeClock {
    fn sleep(&self, duration: Duration) {
        self.sleeps.borrow_mut().push(duration);
    }
}

/// Backend keeping collections in memory.
///
/// Mutations first consume scripted responses (to inject errors), then fall
/// back to applying the change to the store. Searches on the tasks endpoint
/// consume scripted polls before looking at the store.
#[derive(Default)]
pub struct FakeBackend {
    store: RefCell<BTreeMap<String, Vec<Map<String, Value>>>>,
    scripted_mutations: RefCell<VecDeque<Result<Value>>>,
    scripted_task_polls: RefCell<VecDeque<Vec<Value>>>,
    next_id: Cell<u64>,
    pub searches: RefCell<Vec<(String, SearchQuery)>>,
    pub creates: RefCell<Vec<Value>>,
    pub updates: RefCell<Vec<(String, Value)>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        let backend = Self::default();
        backend.next_id.set(100);
        backend
    }

    /// Seed a record in a collection (by endpoint path, e.g. "subnets").
    pub fn seed(&self, collection: &str, record: Value) {
        if let Value::Object(map) = record {
            self.store
                .borrow_mut()
                .entry(collection.to_string())
                .or_default()
                .push(map);
        }
    }

    /// Queue a response for the next create/update.
    pub fn script(&self, response: Result<Value>) {
        self.scripted_mutations.borrow_mut().push_back(response);
    }

    /// Queue the result of the next search on the tasks endpoint.
    pub fn script_task_poll(&self, tasks: Vec<Value>) {
        self.scripted_task_polls.borrow_mut().push_back(tasks);
    }

    pub fn records(&self, collection: &str) -> Vec<Map<String, Value>> {
        self.store
            .borrow()
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    pub fn create_count(&self) -> usize {
        self.creates.borrow().len()
    }

    pub fn update_count(&self) -> usize {
        self.updates.borrow().len()
    }

    fn unwrap_body(body: &Value) -> Map<String, Value> {
        let Value::Object(map) = body else {
            return Map::new();
        };
        // Foreman payloads are wrapped under a single object key.
        if map.len() == 1 {
            if let Some(Value::Object(inner)) = map.values().next() {
                return inner.clone();
            }
        }
        map.clone()
    }

    fn matches(record: &Map<String, Value>, search: &str) -> bool {
        if search.is_empty() {
            return true;
        }
        search.split(" AND ").all(|term| {
            let (field, expected, negate) = if let Some((f, v)) = term.split_once(" != ") {
                (f, v, true)
            } else if let Some((f, v)) = term.split_once(" = ") {
                (f, v, false)
            } else {
                return false;
            };
            let expected = expected
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .map_or_else(
                    || expected.to_string(),
                    |v| v.replace("\\\"", "\"").replace("\\\\", "\\"),
                );
            let actual = match record.get(field) {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Null) | None => String::new(),
                Some(other) => other.to_string(),
            };
            (actual == expected) != negate
        })
    }
}

impl Backend for FakeBackend {
    fn search(&self, endpoint: &Endpoint, query: &SearchQuery) -> Result<Vec<Value>> {
        self.searches
            .borrow_mut()
            .push((endpoint.path.clone(), query.clone()));

        if *endpoint == Endpoint::tasks() {
            if let Some(poll) = self.scripted_task_polls.borrow_mut().pop_front() {
                return Ok(poll);
            }
        }

        Ok(self
            .records(&endpoint.path)
            .into_iter()
            .filter(|r| Self::matches(r, &query.search))
            .map(Value::Object)
            .collect())
    }

    fn create(&self, endpoint: &Endpoint, body: &Value) -> Result<Value> {
        self.creates.borrow_mut().push(body.clone());
        if let Some(response) = self.scripted_mutations.borrow_mut().pop_front() {
            return response;
        }
        let mut record = Self::unwrap_body(body);
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        record.insert("id".into(), Value::from(id));
        self.seed(&endpoint.path, Value::Object(record.clone()));
        Ok(Value::Object(record))
    }

    fn update(&self, endpoint: &Endpoint, id: &str, body: &Value) -> Result<Value> {
        self.updates
            .borrow_mut()
            .push((id.to_string(), body.clone()));
        if let Some(response) = self.scripted_mutations.borrow_mut().pop_front() {
            return response;
        }
        let changes = Self::unwrap_body(body);
        let mut store = self.store.borrow_mut();
        let record = store
            .get_mut(&endpoint.path)
            .and_then(|records| {
                records
                    .iter_mut()
                    .find(|r| r.get("id").map(ToString::to_string).as_deref() == Some(id))
            })
            .ok_or_else(|| Error::http(404, format!("{} {id} not found", endpoint.path)))?;
        for (field, value) in changes {
            record.insert(field, value);
        }
        Ok(Value::Object(record.clone()))
    }
}
