//! The boundary to the external task collaborator.
//!
//! The engine never executes user computations itself: a task operator in the
//! plan graph pulls parameter tuples from its parent, binds each document to a
//! named task parameter, and invokes [`Task::run`].
//! Everything behind that call — scheduling, persistence, resource locking —
//! lives outside this crate.
//!
//! Parameter names are dotted paths ([`DotName`]), so a single task input can
//! address a nested field (`"model.lr"`).

use std::collections::BTreeMap;
use std::fmt;

use anyhow::{Result, bail};

use crate::context::RunContext;
use crate::value::Document;

/// A dotted parameter name such as `model.lr`.
///
/// Ordered and hashable so it can key input-mapping tables deterministically.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct DotName(Vec<String>);

impl DotName {
    /// Parse a name from its dotted form. Empty segments are preserved as-is;
    /// surfaces that care validate with [`DotName::is_simple`].
    pub fn parse(name: &str) -> Self {
        Self(name.split('.').map(str::to_string).collect())
    }

    /// A name with no dots.
    pub fn is_simple(&self) -> bool {
        self.0.len() == 1
    }

    /// The path segments.
    pub fn segments(&self) -> &[String] {
        &self.0
    }
}

impl fmt::Display for DotName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("."))
    }
}

impl From<&str> for DotName {
    fn from(name: &str) -> Self {
        Self::parse(name)
    }
}

/// One task invocation in the making.
///
/// Created fresh by the factory for every upstream tuple; parameters are bound
/// one by one, then [`Task::run`] produces the single output document.
pub trait Task {
    /// Bind one named parameter.
    ///
    /// # Errors
    ///
    /// Fails if the task does not declare a parameter with that name.
    fn set_parameter(&mut self, name: &DotName, value: &Document) -> Result<()>;

    /// Execute the task and return its output document.
    ///
    /// Implementations should consult [`RunContext::simulate`] and skip real
    /// side effects in simulate mode.
    ///
    /// # Errors
    ///
    /// Any failure aborts the whole plan run; the engine wraps it with the
    /// task identity before propagating.
    fn run(&mut self, ctx: &RunContext) -> Result<Document>;
}

/// Creates [`Task`] instances and identifies them in diagnostics.
pub trait TaskFactory: Send + Sync {
    /// Stable identifier used in error messages and graph exports.
    fn id(&self) -> &str;

    /// Create a fresh task instance for one invocation.
    fn create(&self) -> Box<dyn Task>;
}

/// Built-in factory behind [`Workspace::merge`](crate::graph::Workspace::merge):
/// collects every bound input into one JSON object keyed by parameter name.
pub(crate) struct MergeFactory {
    id: String,
}

impl MergeFactory {
    pub(crate) fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

impl TaskFactory for MergeFactory {
    fn id(&self) -> &str {
        &self.id
    }

    fn create(&self) -> Box<dyn Task> {
        Box::new(MergeTask {
            fields: BTreeMap::new(),
        })
    }
}

struct MergeTask {
    fields: BTreeMap<String, Document>,
}

impl Task for MergeTask {
    fn set_parameter(&mut self, name: &DotName, value: &Document) -> Result<()> {
        if !name.is_simple() {
            bail!("merge has no parameter '{name}': names must be simple");
        }
        self.fields.insert(name.to_string(), value.clone());
        Ok(())
    }

    fn run(&mut self, _ctx: &RunContext) -> Result<Document> {
        Ok(Document::Object(
            self.fields
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        ))
    }
}
