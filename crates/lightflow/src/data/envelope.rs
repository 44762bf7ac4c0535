//! Data envelopes: ordered, named slices of task output
//!
//! An [`Envelope`] is what travels along a DAG edge. Each [`Slice`] in it
//! carries a slot name, a JSON payload, the append-only history of tasks
//! that touched it, and an alias map the producing task may use to
//! advertise alternate names.
//!
//! Envelopes fork at graph fan-out and merge at fan-in. Merging
//! concatenates slices preserving parent order; colliding slot names are
//! disambiguated with a parent-name prefix (`parent.slot`), the first
//! occurrence keeping its bare name.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Error type for envelope operations
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum DataError {
    /// A slice with this slot name already exists in the envelope
    #[error("duplicate slot in envelope: {0}")]
    DuplicateSlot(String),

    /// A task referenced a slot or alias not present in its input
    #[error("unknown input alias: {0}")]
    UnknownAlias(String),

    /// A task requires input and none was delivered
    #[error("no input delivered to a task that requires one")]
    EmptyInput,
}

/// A single named data slice
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Slice {
    /// Slot name, unique within an envelope
    pub slot: String,

    /// Opaque serialized value
    pub payload: serde_json::Value,

    /// Ordered list of task names that touched this slice (append-only)
    #[serde(default)]
    pub history: Vec<String>,

    /// Producer-advertised alternate names for this slot
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub aliases: HashMap<String, String>,
}

impl Slice {
    /// Create a slice with an empty history
    pub fn new(slot: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            slot: slot.into(),
            payload,
            history: Vec::new(),
            aliases: HashMap::new(),
        }
    }

    /// Append a task name to the slice history
    pub fn append_history(&mut self, task: impl Into<String>) {
        self.history.push(task.into());
    }

    /// Check whether `name` addresses this slice, either as the slot name
    /// or through a producer alias
    pub fn answers_to(&self, name: &str) -> bool {
        self.slot == name || self.aliases.get(name).is_some_and(|s| *s == self.slot)
    }
}

/// An ordered collection of named slices delivered to a task
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    slices: Vec<Slice>,
}

impl Envelope {
    /// Create an empty envelope
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an envelope from `(slot, payload)` pairs
    ///
    /// # Errors
    ///
    /// Returns [`DataError::DuplicateSlot`] if a slot name repeats.
    pub fn from_slots(
        slots: impl IntoIterator<Item = (String, serde_json::Value)>,
    ) -> Result<Self, DataError> {
        let mut envelope = Self::new();
        for (slot, payload) in slots {
            envelope.push(Slice::new(slot, payload))?;
        }
        Ok(envelope)
    }

    /// Append a slice, enforcing slot uniqueness
    pub fn push(&mut self, slice: Slice) -> Result<(), DataError> {
        if self.slices.iter().any(|s| s.slot == slice.slot) {
            return Err(DataError::DuplicateSlot(slice.slot));
        }
        self.slices.push(slice);
        Ok(())
    }

    /// Number of slices
    pub fn len(&self) -> usize {
        self.slices.len()
    }

    /// Whether the envelope carries no slices
    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }

    /// Iterate over slices in order
    pub fn slices(&self) -> impl Iterator<Item = &Slice> {
        self.slices.iter()
    }

    /// Look up a slice by slot name
    pub fn slice(&self, slot: &str) -> Option<&Slice> {
        self.slices.iter().find(|s| s.slot == slot)
    }

    /// Slot names in order
    pub fn slots(&self) -> Vec<&str> {
        self.slices.iter().map(|s| s.slot.as_str()).collect()
    }

    /// Append `task` to the history of every slice
    pub fn append_history(&mut self, task: &str) {
        for slice in &mut self.slices {
            slice.append_history(task);
        }
    }

    /// Produce an independent copy for a graph fork
    ///
    /// Payloads are JSON documents, so the copy is value-deep; histories
    /// diverge from this point on.
    pub fn fork(&self) -> Self {
        self.clone()
    }

    /// Restrict the envelope to a single slot, as required by a labeled edge
    pub fn project(&self, slot: &str) -> Option<Self> {
        self.slice(slot).map(|s| Self {
            slices: vec![s.clone()],
        })
    }

    /// Merge parent envelopes at a fan-in, preserving parent order
    ///
    /// Slot collisions are resolved by prefixing later occurrences with the
    /// parent name (`parent.slot`); the first occurrence keeps its bare
    /// name.
    pub fn merge(parts: impl IntoIterator<Item = (String, Envelope)>) -> Self {
        let mut merged = Self::new();
        for (parent, envelope) in parts {
            for slice in envelope.slices {
                if merged.push(slice.clone()).is_err() {
                    let mut renamed = slice;
                    renamed.slot = format!("{}.{}", parent, renamed.slot);
                    // A second collision on the prefixed name would need the
                    // same parent to deliver the same slot twice; drop it.
                    let _ = merged.push(renamed);
                }
            }
        }
        merged
    }

    /// Materialize the body-facing named view for a task
    ///
    /// `inputs` is the task's declared input slot list (`None` = all
    /// slices), `aliases` its input alias map (user name -> slot).
    ///
    /// # Errors
    ///
    /// [`DataError::UnknownAlias`] if a declared input or alias target is
    /// absent; [`DataError::EmptyInput`] if `strict` is set, inputs are
    /// required and the envelope is empty.
    pub fn select(
        &self,
        inputs: Option<&[String]>,
        aliases: &HashMap<String, String>,
        strict: bool,
    ) -> Result<DataView, DataError> {
        match inputs {
            None => {
                let mut view = DataView::default();
                for slice in &self.slices {
                    view.insert(slice.slot.clone(), slice.payload.clone());
                }
                // Task-level aliases still apply when all slots are taken
                for (name, slot) in aliases {
                    let slice = self
                        .resolve(slot)
                        .ok_or_else(|| DataError::UnknownAlias(name.clone()))?;
                    view.insert(name.clone(), slice.payload.clone());
                }
                Ok(view)
            }
            Some(names) => {
                if strict && !names.is_empty() && self.is_empty() {
                    return Err(DataError::EmptyInput);
                }
                let mut view = DataView::default();
                for name in names {
                    let slot = aliases.get(name).map(String::as_str).unwrap_or(name);
                    let slice = self
                        .resolve(slot)
                        .ok_or_else(|| DataError::UnknownAlias(name.clone()))?;
                    view.insert(name.clone(), slice.payload.clone());
                }
                Ok(view)
            }
        }
    }

    /// Resolve a name against slot names first, then producer aliases
    fn resolve(&self, name: &str) -> Option<&Slice> {
        self.slice(name)
            .or_else(|| self.slices.iter().find(|s| s.answers_to(name)))
    }
}

/// The named, ordered view of input data handed to a task body
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DataView {
    entries: Vec<(String, serde_json::Value)>,
}

impl DataView {
    /// Look up a value by name
    pub fn get(&self, name: &str) -> Option<&serde_json::Value> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    /// Iterate over `(name, value)` entries in order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &serde_json::Value)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v))
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the view is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn insert(&mut self, name: String, value: serde_json::Value) {
        if let Some(entry) = self.entries.iter_mut().find(|(n, _)| *n == name) {
            entry.1 = value;
        } else {
            self.entries.push((name, value));
        }
    }
}
