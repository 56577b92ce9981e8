//! Step selection and child environment policy.

use std::collections::BTreeSet;
use std::env;

/// Which named steps run.
///
/// The skip list is checked first; a non-empty only list then acts as an
/// allow-list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepPolicy {
    skip: BTreeSet<String>,
    only: BTreeSet<String>,
}

impl StepPolicy {
    pub fn new<S, O>(skip: S, only: O) -> Self
    where
        S: IntoIterator,
        S::Item: Into<String>,
        O: IntoIterator,
        O::Item: Into<String>,
    {
        Self {
            skip: skip.into_iter().map(Into::into).collect(),
            only: only.into_iter().map(Into::into).collect(),
        }
    }

    /// Policy that runs every step.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn allows(&self, step: &str) -> bool {
        if self.skip.contains(step) {
            return false;
        }
        self.only.is_empty() || self.only.contains(step)
    }

    /// Names in the only list that are not in `known`, to catch typos.
    pub fn unknown_steps<'a>(&'a self, known: &[&str]) -> Vec<&'a str> {
        self.skip
            .iter()
            .chain(self.only.iter())
            .map(String::as_str)
            .filter(|name| !known.contains(name))
            .collect()
    }
}

/// Drop `PATH` entries containing `marker`. Entry order is preserved.
pub fn sanitized_path(path: &str, marker: &str) -> String {
    if marker.is_empty() {
        return path.to_string();
    }
    path.split(':')
        .filter(|entry| !entry.contains(marker))
        .collect::<Vec<_>>()
        .join(":")
}

/// `PATH` of the current process with marked entries removed.
pub fn sanitized_env_path(marker: &str) -> Option<String> {
    env::var("PATH").ok().map(|path| sanitized_path(&path, marker))
}
