//! Stub task factories and small helpers for testing plans.
//!
//! The engine never computes anything itself, so most tests need a task to
//! bind: [`EchoFactory`] reflects its parameters back as a JSON object,
//! [`CountingFactory`] additionally counts invocations (the way to observe
//! at-most-one execution of cacheable operators), and [`FailingFactory`]
//! fails on demand to exercise error propagation.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Result, anyhow};
use serde::Serialize;
use serde_json::Map;

use crate::context::RunContext;
use crate::task::{DotName, Task, TaskFactory};
use crate::value::Document;

/// JSON documents from any serializable values.
///
/// # Panics
///
/// Panics when a value does not serialize; test fixtures are expected to.
pub fn docs<T: Serialize>(values: impl IntoIterator<Item = T>) -> Vec<Document> {
    values
        .into_iter()
        .map(|v| serde_json::to_value(v).expect("fixture serializes"))
        .collect()
}

/// A task reflecting its bound parameters back as one JSON object.
pub struct EchoFactory {
    id: String,
}

impl EchoFactory {
    pub fn new(id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self { id: id.into() })
    }
}

impl TaskFactory for EchoFactory {
    fn id(&self) -> &str {
        &self.id
    }

    fn create(&self) -> Box<dyn Task> {
        Box::new(EchoTask {
            fields: Map::new(),
        })
    }
}

struct EchoTask {
    fields: Map<String, Document>,
}

impl Task for EchoTask {
    fn set_parameter(&mut self, name: &DotName, value: &Document) -> Result<()> {
        self.fields.insert(name.to_string(), value.clone());
        Ok(())
    }

    fn run(&mut self, _ctx: &RunContext) -> Result<Document> {
        Ok(Document::Object(std::mem::take(&mut self.fields)))
    }
}

/// An echo task that counts how many times it actually ran.
pub struct CountingFactory {
    id: String,
    runs: Arc<AtomicUsize>,
}

impl CountingFactory {
    pub fn new(id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            runs: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Number of completed [`Task::run`] calls so far.
    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::Relaxed)
    }
}

impl TaskFactory for CountingFactory {
    fn id(&self) -> &str {
        &self.id
    }

    fn create(&self) -> Box<dyn Task> {
        Box::new(CountingTask {
            fields: Map::new(),
            runs: Arc::clone(&self.runs),
        })
    }
}

struct CountingTask {
    fields: Map<String, Document>,
    runs: Arc<AtomicUsize>,
}

impl Task for CountingTask {
    fn set_parameter(&mut self, name: &DotName, value: &Document) -> Result<()> {
        self.fields.insert(name.to_string(), value.clone());
        Ok(())
    }

    fn run(&mut self, _ctx: &RunContext) -> Result<Document> {
        self.runs.fetch_add(1, Ordering::Relaxed);
        Ok(Document::Object(std::mem::take(&mut self.fields)))
    }
}

/// A task whose every run fails with the given message.
pub struct FailingFactory {
    id: String,
    message: String,
}

impl FailingFactory {
    pub fn new(id: impl Into<String>, message: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            message: message.into(),
        })
    }
}

impl TaskFactory for FailingFactory {
    fn id(&self) -> &str {
        &self.id
    }

    fn create(&self) -> Box<dyn Task> {
        Box::new(FailingTask {
            message: self.message.clone(),
        })
    }
}

struct FailingTask {
    message: String,
}

impl Task for FailingTask {
    fn set_parameter(&mut self, _name: &DotName, _value: &Document) -> Result<()> {
        Ok(())
    }

    fn run(&mut self, _ctx: &RunContext) -> Result<Document> {
        Err(anyhow!("{}", self.message))
    }
}
