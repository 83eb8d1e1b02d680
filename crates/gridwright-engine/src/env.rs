//! Job environments and the scheduler environment escaper.

use std::fmt;

use indexmap::IndexMap;
use serde::Deserialize;
use serde::Serialize;

/// An insertion-ordered set of environment variables for a job.
///
/// Re-inserting an existing key replaces its value but keeps the key in its
/// original position, so the rendered environment is stable across runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvironmentProfile(IndexMap<String, String>);

impl EnvironmentProfile {
    /// Constructs an empty environment profile.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a variable, returning the previous value if there was one.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.0.insert(key.into(), value.into())
    }

    /// Gets the value of a variable.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Determines if the profile defines the given variable.
    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Removes a variable, preserving the order of the remaining variables.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.shift_remove(key)
    }

    /// Adds every variable of `other` that is not already defined here.
    pub fn merge_missing(&mut self, other: &EnvironmentProfile) {
        for (k, v) in other.iter() {
            if !self.contains(k) {
                self.set(k, v);
            }
        }
    }

    /// Iterates the variables in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Gets the number of variables in the profile.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Determines if the profile is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for EnvironmentProfile {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Escapes an environment profile into a single scheduler environment
/// expression.
///
/// The result is `"k=v k=v"`. Values containing a space are wrapped in
/// single quotes and every quote character in a value is doubled. A
/// backslash is not an escape character in this grammar and is copied as
/// is.
pub fn escape(profile: &EnvironmentProfile) -> String {
    let mut out = String::from("\"");
    for (key, value) in profile.iter() {
        out.push_str(key);
        out.push('=');
        escape_value(value, &mut out);
        out.push(' ');
    }

    let trimmed = out.trim_end().len();
    out.truncate(trimmed);
    out.push('"');
    out
}

/// Escapes a single environment value onto `out`.
pub(crate) fn escape_value(value: &str, out: &mut String) {
    let wrap = value.contains(' ');
    if wrap {
        out.push('\'');
    }

    for ch in value.chars() {
        if ch == '\'' || ch == '"' {
            out.push(ch);
        }
        out.push(ch);
    }

    if wrap {
        out.push('\'');
    }
}

/// The kinds of hook commands the launcher runs around a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookKind {
    /// Runs before anything else, typically to create a directory.
    Setup,
    /// Runs before the job, typically to stage inputs.
    Pre,
    /// Runs after the job, typically to stage outputs.
    Post,
    /// Runs last, typically to remove a directory.
    Cleanup,
}

impl HookKind {
    /// Every hook kind, in execution order.
    pub const ALL: [HookKind; 4] = [Self::Setup, Self::Pre, Self::Post, Self::Cleanup];

    /// The environment variable the launcher reads the hook from.
    pub fn variable(&self) -> &'static str {
        match self {
            Self::Setup => "GW_SETUP",
            Self::Pre => "GW_PREJOB",
            Self::Post => "GW_POSTJOB",
            Self::Cleanup => "GW_CLEANUP",
        }
    }
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Setup => write!(f, "setup"),
            Self::Pre => write!(f, "pre"),
            Self::Post => write!(f, "post"),
            Self::Cleanup => write!(f, "cleanup"),
        }
    }
}

/// Returned when a hook slot is already occupied.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("a {kind} hook is already set to `{existing}`")]
pub struct HookConflict {
    /// The conflicting hook kind.
    pub kind: HookKind,
    /// The command already in the slot.
    pub existing: String,
}

/// The hook commands attached to a job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct Hooks {
    /// The setup hook.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    setup: Option<String>,
    /// The pre-job hook.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pre: Option<String>,
    /// The post-job hook.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    post: Option<String>,
    /// The cleanup hook.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cleanup: Option<String>,
}

impl Hooks {
    /// Gets the slot for a hook kind.
    fn slot(&mut self, kind: HookKind) -> &mut Option<String> {
        match kind {
            HookKind::Setup => &mut self.setup,
            HookKind::Pre => &mut self.pre,
            HookKind::Post => &mut self.post,
            HookKind::Cleanup => &mut self.cleanup,
        }
    }

    /// Gets the command of a hook, if set.
    pub fn get(&self, kind: HookKind) -> Option<&str> {
        match kind {
            HookKind::Setup => self.setup.as_deref(),
            HookKind::Pre => self.pre.as_deref(),
            HookKind::Post => self.post.as_deref(),
            HookKind::Cleanup => self.cleanup.as_deref(),
        }
    }

    /// Sets a hook, failing if the slot already holds a different command.
    pub fn set(&mut self, kind: HookKind, command: impl Into<String>) -> Result<(), HookConflict> {
        let command = command.into();
        let slot = self.slot(kind);
        match slot {
            Some(existing) if *existing != command => Err(HookConflict {
                kind,
                existing: existing.clone(),
            }),
            _ => {
                *slot = Some(command);
                Ok(())
            }
        }
    }

    /// Appends a command to a hook, running it after any existing command.
    pub fn merge(&mut self, kind: HookKind, command: impl Into<String>) {
        let command = command.into();
        let slot = self.slot(kind);
        *slot = Some(match slot.take() {
            Some(existing) => format!("{existing} && {command}"),
            None => command,
        });
    }

    /// Determines if no hook is set.
    pub fn is_empty(&self) -> bool {
        HookKind::ALL.iter().all(|k| self.get(*k).is_none())
    }

    /// Writes the set hooks into an environment profile.
    pub fn apply_to(&self, env: &mut EnvironmentProfile) {
        for kind in HookKind::ALL {
            if let Some(command) = self.get(kind) {
                env.set(kind.variable(), command);
            }
        }
    }
}
