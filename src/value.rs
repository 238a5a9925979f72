//! The tuple type that flows along plan edges.
//!
//! Every operator produces a lazy sequence of [`Tuple`]s: an array of document
//! payloads plus a parallel array of 64-bit provenance ids (the "context").
//! Context entries let downstream operators detect which upstream values a
//! tuple derives from — joins compare them, group-by watches them for
//! boundaries, order-by sorts on them.
//!
//! Operator-kind iterators internally produce the rawer [`RawTuple`], whose
//! context is still laid out per parent stream. The generic iterator wrapper
//! in [`exec`](crate::exec) flattens that into the operator's own local slots
//! and assigns the tuple id.

/// Document payload carried by tuples. Structural clone and equality come with
/// the JSON value model.
pub type Document = serde_json::Value;

/// Sentinel context value for "this branch does not carry that stream".
///
/// Produced by unions whose selected branch lacks a needed ancestor; consumed
/// by the join, which treats such tuples as wildcards ("jokers").
pub const ABSENT: i64 = -1;

/// One unit of data flowing along a plan edge.
///
/// Immutable after creation: downstream operators only read it or embed its
/// payloads into new tuples.
#[derive(Clone, Debug)]
pub struct Tuple {
    pub(crate) id: u64,
    pub(crate) nodes: Vec<Document>,
    pub(crate) context: Vec<i64>,
}

impl Tuple {
    /// The strictly increasing id assigned by the producing iterator.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The document payloads, one per output slot of the producing operator.
    pub fn nodes(&self) -> &[Document] {
        &self.nodes
    }

    /// The provenance ids, one per tracked upstream stream.
    pub fn context(&self) -> &[i64] {
        &self.context
    }

    /// Consume the tuple, keeping only its payloads.
    pub fn into_nodes(self) -> Vec<Document> {
        self.nodes
    }
}

/// Per-parent context access for a raw (pre-flattening) tuple.
///
/// `get(stream, slot)` answers "what is the context value at `slot` of the
/// `stream`-th parent's layout for this tuple". Streams the tuple does not
/// carry answer [`ABSENT`].
#[derive(Clone, Debug, Default)]
pub struct Contexts(Vec<Vec<i64>>);

impl Contexts {
    /// No parent streams (leaf operators).
    pub(crate) fn empty() -> Self {
        Self(Vec::new())
    }

    /// A single pass-through stream (unary operators).
    pub(crate) fn single(context: Vec<i64>) -> Self {
        Self(vec![context])
    }

    /// One context array per parent stream, in parent order.
    pub(crate) fn per_parent(streams: Vec<Vec<i64>>) -> Self {
        Self(streams)
    }

    pub(crate) fn get(&self, stream: usize, slot: usize) -> i64 {
        match self.0.get(stream) {
            Some(ctx) => ctx.get(slot).copied().unwrap_or(ABSENT),
            None => ABSENT,
        }
    }
}

/// Output of an operator-kind iterator before the generic wrapper flattens it.
#[derive(Clone, Debug)]
pub struct RawTuple {
    pub(crate) nodes: Vec<Document>,
    pub(crate) contexts: Contexts,
}

impl RawTuple {
    pub(crate) fn new(nodes: Vec<Document>, contexts: Contexts) -> Self {
        Self { nodes, contexts }
    }
}
