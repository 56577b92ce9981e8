//! Remote task lookup and idle waiting.

use crate::backend::Backend;
use crate::clock::Clock;
use crate::error::{Error, ErrorCategory, Result};
use crate::query::{Filter, FilterValue, Operator};
use crate::retry::RetryPolicy;
use crate::types::{Endpoint, Task};
use serde_json::Value;
use std::cell::RefCell;
use std::collections::HashMap;
use std::time::Duration;

/// Read-only view over the remote task list.
pub struct TaskTracker<'a> {
    backend: &'a dyn Backend,
    clock: &'a dyn Clock,
    poll_interval: Duration,
    cache: RefCell<HashMap<String, Task>>,
}

impl<'a> TaskTracker<'a> {
    pub fn new(backend: &'a dyn Backend, clock: &'a dyn Clock, policy: &RetryPolicy) -> Self {
        Self {
            backend,
            clock,
            poll_interval: policy.idle_poll,
            cache: RefCell::new(HashMap::new()),
        }
    }

    /// Search tasks. A 404 means "no results"; any other failure is an
    /// [`Error::RemoteQuery`].
    pub fn search(&self, filter: &Filter) -> Result<Vec<Task>> {
        Ok(self
            .search_raw(filter)?
            .into_iter()
            .filter_map(|raw| self.decode(raw))
            .collect())
    }

    /// First task whose `key` field equals `value`, refreshed from the server.
    pub fn get_first(&self, key: &str, value: &str) -> Result<Option<Task>> {
        let raw = self.search_raw(&Filter::by(key, value))?;
        if raw.is_empty() {
            log::warn!("Unable to get task with {key} {value}");
            return Ok(None);
        }
        let found = raw
            .into_iter()
            .find(|task| field_equals(task, key, value))
            .and_then(|task| self.decode(task));
        if found.is_none() {
            log::warn!("Item task with key {key} = {value} not found");
        }
        Ok(found)
    }

    /// Last known copy of a task, without a round trip.
    pub fn cached(&self, id: &str) -> Option<Task> {
        self.cache.borrow().get(id).cloned()
    }

    /// Tasks that have not stopped yet.
    pub fn incomplete(&self) -> Result<Vec<Task>> {
        self.search(&Filter::by("state", "stopped").operator(Operator::NotEquals))
    }

    /// Tasks that ended in error.
    pub fn failed(&self) -> Result<Vec<Task>> {
        self.search(&Filter::by("result", "error"))
    }

    /// Block until no task is running, polling at a fixed interval.
    ///
    /// There is no attempt cap: this is meant to run before bulk operations
    /// that must not race with background work. Returns the number of
    /// waits taken.
    pub fn wait_for_idle(&self) -> Result<u32> {
        let mut waits = 0;
        loop {
            log::info!("Looking if there's still running tasks...");
            let running = self.search_raw(&Filter::by("state", "running"))?;
            if running.is_empty() {
                return Ok(waits);
            }
            for task in running.into_iter().filter_map(|raw| self.decode(raw)) {
                log::warn!("{}", task.summary());
                for (field, name) in task.input_names() {
                    log::info!("{field}: {name}");
                }
            }
            self.clock.sleep(self.poll_interval);
            waits += 1;
        }
    }

    fn search_raw(&self, filter: &Filter) -> Result<Vec<Value>> {
        let endpoint = Endpoint::tasks();
        let query = filter.build();
        log::debug!("Searching for {query:?} on {endpoint}");
        match self.backend.search(&endpoint, &query) {
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

    /// Decode a task and remember it. A task the decoder rejects is kept in
    /// its lossy form so it still counts as a lock owner.
    fn decode(&self, raw: Value) -> Option<Task> {
        let task = match serde_json::from_value::<Task>(raw.clone()) {
            Ok(task) => task,
            Err(e) => {
                log::warn!("Task does not match the expected shape: {e}");
                Task::lossy(&raw)?
            }
        };
        self.cache
            .borrow_mut()
            .insert(task.id.clone(), task.clone());
        Some(task)
    }
}

/// Compare a raw field with a requested value, numbers included.
fn field_equals(raw: &Value, key: &str, value: &str) -> bool {
    match raw.get(key) {
        Some(field) => match FilterValue::from_json(field) {
            Some(FilterValue::Text(s)) => s == value,
            Some(FilterValue::Number(n)) => n.to_string() == value,
            None => false,
        },
        None => false,
    }
}
