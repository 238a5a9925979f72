//! The pull-based iterator protocol.
//!
//! Every operator kind has a cursor producing [`RawTuple`]s; the generic
//! wrapper turns those into [`Tuple`]s by assigning the strictly increasing
//! per-iterator id and flattening the per-stream contexts through the slot
//! sources computed at init time. Sequences are finite, forward-only and
//! restartable only by asking for a new iterator; re-iterating a
//! deterministic operator reproduces the same tuples with the same ids.
//!
//! Cacheable operators (tasks) are materialized once per [`RunContext`] and
//! replayed to every consumer, so fan-out in the graph never re-invokes a
//! task. A failure observed while filling the cache is replayed too.

use std::cmp::Ordering;
use std::rc::Rc;

use anyhow::{Result, anyhow};
use tracing::{debug, trace};

use crate::context::{CachedFailure, CachedRun, RunContext};
use crate::error::TaskError;
use crate::graph::{ContextSource, PlanGraph};
use crate::op_id::OpId;
use crate::operator::{JoinRef, OperatorKind};
use crate::value::{ABSENT, Contexts, Document, RawTuple, Tuple};

pub(crate) type TupleStream<'a> = Box<dyn Iterator<Item = Result<Tuple>> + 'a>;
type RawStream<'a> = Box<dyn Iterator<Item = Result<RawTuple>> + 'a>;

/// Public iterator over an initialized operator's output.
pub(crate) fn tuples<'a>(graph: &'a PlanGraph, ctx: &'a RunContext, op: OpId) -> TupleStream<'a> {
    if !graph.kind(op).cacheable() {
        return Box::new(Wrapper::new(graph, ctx, op));
    }

    let run = match ctx.cached(op) {
        Some(run) => run,
        None => {
            let run = Rc::new(materialize(graph, ctx, op));
            ctx.store_cache(op, Rc::clone(&run));
            run
        }
    };
    Box::new(Replay { run, pos: 0 })
}

/// Drain a cacheable operator once, remembering the failure if it ends in
/// one.
fn materialize(graph: &PlanGraph, ctx: &RunContext, op: OpId) -> CachedRun {
    debug!(operator = %op, "materializing cacheable operator");
    let mut tuples = Vec::new();
    let mut failed = None;
    for item in Wrapper::new(graph, ctx, op) {
        match item {
            Ok(tuple) => tuples.push(tuple),
            Err(err) => {
                let task = match graph.kind(op) {
                    OperatorKind::Task { factory, .. } => factory.id().to_string(),
                    _ => graph.label(op),
                };
                failed = Some(CachedFailure {
                    task,
                    operator: op.to_string(),
                    detail: format!("{err:#}"),
                });
                break;
            }
        }
    }
    CachedRun { tuples, failed }
}

struct Replay {
    run: Rc<CachedRun>,
    pos: usize,
}

impl Iterator for Replay {
    type Item = Result<Tuple>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(tuple) = self.run.tuples.get(self.pos) {
            self.pos += 1;
            return Some(Ok(tuple.clone()));
        }
        if self.pos == self.run.tuples.len() {
            self.pos += 1;
            if let Some(failure) = &self.run.failed {
                return Some(Err(TaskError::new(
                    failure.task.clone(),
                    failure.operator.clone(),
                    anyhow!("{}", failure.detail),
                )
                .into()));
            }
        }
        None
    }
}

/* ---------- Generic wrapper ---------- */

struct Wrapper<'a> {
    graph: &'a PlanGraph,
    ctx: &'a RunContext,
    op: OpId,
    raw: RawStream<'a>,
    next_id: u64,
    done: bool,
}

impl<'a> Wrapper<'a> {
    fn new(graph: &'a PlanGraph, ctx: &'a RunContext, op: OpId) -> Self {
        Self {
            graph,
            ctx,
            op,
            raw: raw_cursor(graph, ctx, op),
            next_id: 0,
            done: false,
        }
    }
}

impl Iterator for Wrapper<'_> {
    type Item = Result<Tuple>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.raw.next()? {
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
            Ok(raw) => {
                let id = self.next_id;
                self.next_id += 1;
                let context = self
                    .graph
                    .record(self.op)
                    .sources
                    .iter()
                    .map(|source| match *source {
                        ContextSource::Own => id as i64,
                        ContextSource::Parent { stream, slot } => raw.contexts.get(stream, slot),
                    })
                    .collect();
                self.ctx.bump(self.op);
                trace!(operator = %self.op, id, "emit");
                Some(Ok(Tuple {
                    id,
                    nodes: raw.nodes,
                    context,
                }))
            }
        }
    }
}

/* ---------- Per-kind cursors ---------- */

fn raw_cursor<'a>(graph: &'a PlanGraph, ctx: &'a RunContext, op: OpId) -> RawStream<'a> {
    let parents = graph.parents(op);
    match graph.kind(op) {
        OperatorKind::Constant { documents } => Box::new(
            documents
                .clone()
                .into_iter()
                .map(|doc| Ok(RawTuple::new(vec![doc], Contexts::empty()))),
        ),

        OperatorKind::Product => Box::new(ProductCursor::new(graph, ctx, parents.to_vec())),

        OperatorKind::Union { tables } => {
            Box::new(UnionCursor::new(graph, ctx, parents.to_vec(), tables))
        }

        OperatorKind::Join { joins, .. } => {
            Box::new(JoinCursor::new(graph, ctx, parents.to_vec(), joins))
        }

        OperatorKind::OrderBy { context_order, .. } => Box::new(OrderCursor {
            source: Some(tuples(graph, ctx, parents[0])),
            slots: context_order,
            sorted: Vec::new().into_iter(),
        }),

        OperatorKind::GroupBy { indices, .. } => Box::new(GroupCursor {
            source: tuples(graph, ctx, parents[0]),
            slots: indices,
            key: None,
            group: Vec::new(),
            context: Vec::new(),
            done: false,
        }),

        OperatorKind::Task { factory, mappings } => {
            let source = tuples(graph, ctx, parents[0]);
            let task = factory.id().to_string();
            let operator = op.to_string();
            Box::new(source.map(move |item| {
                let tuple = item?;
                let mut instance = factory.create();
                let outcome = mappings
                    .iter()
                    .try_fold((), |(), (name, slot)| {
                        instance.set_parameter(name, &tuple.nodes[*slot])
                    })
                    .and_then(|()| instance.run(ctx));
                match outcome {
                    Ok(doc) => Ok(RawTuple::new(vec![doc], Contexts::single(tuple.context))),
                    Err(err) => Err(TaskError::new(task.clone(), operator.clone(), err).into()),
                }
            }))
        }

        OperatorKind::Function { f, .. } => {
            let source = tuples(graph, ctx, parents[0]);
            Box::new(source.flat_map(move |item| {
                match item.and_then(|tuple| Ok((f(&tuple.nodes)?, tuple.context))) {
                    Ok((docs, context)) => docs
                        .into_iter()
                        .map(|doc| Ok(RawTuple::new(vec![doc], Contexts::single(context.clone()))))
                        .collect::<Vec<_>>(),
                    Err(err) => vec![Err(err)],
                }
            }))
        }

        OperatorKind::Reorder { permutation } => {
            let source = tuples(graph, ctx, parents[0]);
            Box::new(source.map(move |item| {
                let tuple = item?;
                let nodes = permutation
                    .iter()
                    .map(|&slot| tuple.nodes[slot].clone())
                    .collect();
                Ok(RawTuple::new(nodes, Contexts::single(tuple.context)))
            }))
        }

        OperatorKind::SubPlan { .. } => {
            panic!("iterating an unexpanded plan operator: {}", graph.label(op))
        }
    }
}

/* ---------- Product ---------- */

/// Odometer over the parent streams, last parent varying fastest. Advancing
/// a digit resets and re-pulls every stream to its right.
struct ProductCursor<'a> {
    graph: &'a PlanGraph,
    ctx: &'a RunContext,
    parents: Vec<OpId>,
    streams: Vec<TupleStream<'a>>,
    current: Vec<Tuple>,
    started: bool,
    done: bool,
}

impl<'a> ProductCursor<'a> {
    fn new(graph: &'a PlanGraph, ctx: &'a RunContext, parents: Vec<OpId>) -> Self {
        Self {
            graph,
            ctx,
            parents,
            streams: Vec::new(),
            current: Vec::new(),
            started: false,
            done: false,
        }
    }

    /// Pull the first value of every parent; an empty parent empties the
    /// whole product.
    fn start(&mut self) -> Result<bool> {
        self.started = true;
        for &parent in &self.parents {
            let mut stream = tuples(self.graph, self.ctx, parent);
            match stream.next().transpose()? {
                Some(tuple) => {
                    self.streams.push(stream);
                    self.current.push(tuple);
                }
                None => return Ok(false),
            }
        }
        Ok(!self.parents.is_empty())
    }

    fn advance(&mut self) -> Result<bool> {
        for digit in (0..self.parents.len()).rev() {
            if let Some(tuple) = self.streams[digit].next().transpose()? {
                self.current[digit] = tuple;
                for reset in digit + 1..self.parents.len() {
                    let mut stream = tuples(self.graph, self.ctx, self.parents[reset]);
                    match stream.next().transpose()? {
                        Some(tuple) => {
                            self.streams[reset] = stream;
                            self.current[reset] = tuple;
                        }
                        None => return Ok(false),
                    }
                }
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn emit(&self) -> RawTuple {
        let nodes = self
            .current
            .iter()
            .flat_map(|t| t.nodes.iter().cloned())
            .collect();
        let contexts = self.current.iter().map(|t| t.context.clone()).collect();
        RawTuple::new(nodes, Contexts::per_parent(contexts))
    }
}

impl Iterator for ProductCursor<'_> {
    type Item = Result<RawTuple>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let more = if self.started {
            self.advance()
        } else {
            self.start()
        };
        match more {
            Ok(true) => Some(Ok(self.emit())),
            Ok(false) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

/* ---------- Union ---------- */

/// Concatenates the branches, rewriting each branch's context into the
/// union-wide layout. Ancestors a branch does not carry read as the joker.
struct UnionCursor<'a> {
    graph: &'a PlanGraph,
    ctx: &'a RunContext,
    parents: Vec<OpId>,
    tables: &'a [Vec<Option<usize>>],
    branch: usize,
    stream: Option<TupleStream<'a>>,
    done: bool,
}

impl<'a> UnionCursor<'a> {
    fn new(
        graph: &'a PlanGraph,
        ctx: &'a RunContext,
        parents: Vec<OpId>,
        tables: &'a [Vec<Option<usize>>],
    ) -> Self {
        Self {
            graph,
            ctx,
            parents,
            tables,
            branch: 0,
            stream: None,
            done: false,
        }
    }
}

impl Iterator for UnionCursor<'_> {
    type Item = Result<RawTuple>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            if self.stream.is_none() {
                if self.branch == self.parents.len() {
                    self.done = true;
                    return None;
                }
                self.stream = Some(tuples(self.graph, self.ctx, self.parents[self.branch]));
            }
            match self.stream.as_mut().and_then(Iterator::next) {
                Some(Ok(tuple)) => {
                    let table = &self.tables[self.branch];
                    let context = table
                        .iter()
                        .map(|slot| slot.map_or(ABSENT, |s| tuple.context[s]))
                        .collect();
                    return Some(Ok(RawTuple::new(tuple.nodes, Contexts::single(context))));
                }
                Some(Err(err)) => {
                    self.done = true;
                    return Some(Err(err));
                }
                None => {
                    self.stream = None;
                    self.branch += 1;
                }
            }
        }
    }
}

/* ---------- OrderBy ---------- */

/// The explicit buffering stage: drain the parent, stable-sort on the
/// resolved context slots, then stream the buffer out.
struct OrderCursor<'a> {
    source: Option<TupleStream<'a>>,
    slots: &'a [usize],
    sorted: std::vec::IntoIter<Tuple>,
}

impl Iterator for OrderCursor<'_> {
    type Item = Result<RawTuple>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(source) = self.source.take() {
            let mut buffer = Vec::new();
            for item in source {
                match item {
                    Ok(tuple) => buffer.push(tuple),
                    Err(err) => return Some(Err(err)),
                }
            }
            let slots = self.slots;
            buffer.sort_by(|a, b| {
                slots
                    .iter()
                    .map(|&s| a.context[s].cmp(&b.context[s]))
                    .find(|o| *o != Ordering::Equal)
                    .unwrap_or(Ordering::Equal)
            });
            self.sorted = buffer.into_iter();
        }
        let tuple = self.sorted.next()?;
        Some(Ok(RawTuple::new(
            tuple.nodes,
            Contexts::single(tuple.context),
        )))
    }
}

/* ---------- GroupBy ---------- */

/// Collapses runs of tuples with equal context at the tracked slots. The
/// group tuple carries each member's first document in a JSON array and the
/// first member's context.
struct GroupCursor<'a> {
    source: TupleStream<'a>,
    slots: &'a [usize],
    key: Option<Vec<i64>>,
    group: Vec<Document>,
    context: Vec<i64>,
    done: bool,
}

impl GroupCursor<'_> {
    fn finish(&mut self) -> RawTuple {
        self.key = None;
        let docs = std::mem::take(&mut self.group);
        RawTuple::new(
            vec![Document::Array(docs)],
            Contexts::single(std::mem::take(&mut self.context)),
        )
    }
}

impl Iterator for GroupCursor<'_> {
    type Item = Result<RawTuple>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            match self.source.next() {
                Some(Ok(tuple)) => {
                    let key: Vec<i64> = self.slots.iter().map(|&s| tuple.context[s]).collect();
                    match &self.key {
                        Some(current) if *current == key => {
                            self.group.push(tuple.nodes[0].clone());
                        }
                        Some(_) => {
                            let finished = self.finish();
                            self.key = Some(key);
                            self.group.push(tuple.nodes[0].clone());
                            self.context = tuple.context;
                            return Some(Ok(finished));
                        }
                        None => {
                            self.key = Some(key);
                            self.group.push(tuple.nodes[0].clone());
                            self.context = tuple.context;
                        }
                    }
                }
                Some(Err(err)) => {
                    self.done = true;
                    return Some(Err(err));
                }
                None => {
                    self.done = true;
                    // An empty upstream produces no groups at all.
                    return self.key.is_some().then(|| Ok(self.finish()));
                }
            }
        }
    }
}

/* ---------- Join ---------- */

/// One input of the sort-merge join. `head` is the next real tuple; tuples
/// whose key context contains the joker sentinel wait in `jokers` until the
/// stream's key passes them.
struct JoinStream<'a> {
    source: TupleStream<'a>,
    key_slots: Vec<usize>,
    head: Option<Tuple>,
    jokers: Vec<Tuple>,
    exhausted: bool,
}

impl JoinStream<'_> {
    fn key(&self, tuple: &Tuple) -> Vec<i64> {
        self.key_slots.iter().map(|&s| tuple.context[s]).collect()
    }

    /// Refill `head` with the next fully-keyed tuple, stashing jokers.
    fn pull(&mut self) -> Result<()> {
        while !self.exhausted {
            match self.source.next() {
                Some(Ok(tuple)) => {
                    if self.key(&tuple).contains(&ABSENT) {
                        self.jokers.push(tuple);
                    } else {
                        self.head = Some(tuple);
                        return Ok(());
                    }
                }
                Some(Err(err)) => {
                    self.exhausted = true;
                    return Err(err);
                }
                None => self.exhausted = true,
            }
        }
        Ok(())
    }

    /// Jokers sorted before the keys that match them are dead once the
    /// stream's key has moved past: compare with the joker slot greatest.
    fn expire_jokers(&mut self, position: &[i64]) {
        let slots = &self.key_slots;
        self.jokers.retain(|j| {
            let key: Vec<i64> = slots.iter().map(|&s| j.context[s]).collect();
            joker_cmp(&key, position) != Ordering::Less
        });
    }

    /// Clones of the stored jokers matching `position`, with their joker
    /// slots filled in from it.
    fn matching_jokers(&self, position: &[i64]) -> Vec<Tuple> {
        self.jokers
            .iter()
            .filter(|j| {
                self.key(j)
                    .iter()
                    .zip(position)
                    .all(|(&k, &p)| k == ABSENT || k == p)
            })
            .map(|j| {
                let mut patched = j.clone();
                for (&slot, &p) in self.key_slots.iter().zip(position) {
                    patched.context[slot] = p;
                }
                patched
            })
            .collect()
    }
}

/// Lexicographic key comparison where the joker sentinel sorts greatest.
fn joker_cmp(a: &[i64], b: &[i64]) -> Ordering {
    for (&x, &y) in a.iter().zip(b) {
        let o = match (x, y) {
            (ABSENT, ABSENT) => Ordering::Equal,
            (ABSENT, _) => Ordering::Greater,
            (_, ABSENT) => Ordering::Less,
            _ => x.cmp(&y),
        };
        if o != Ordering::Equal {
            return o;
        }
    }
    Ordering::Equal
}

/// Streaming sort-merge over the pre-sorted parents: align every stream on
/// one key vector, gather each stream's equal-key run plus its matching
/// jokers, and cross the runs block by block.
struct JoinCursor<'a> {
    streams: Vec<JoinStream<'a>>,
    block: Vec<Vec<Tuple>>,
    odometer: Vec<usize>,
    emitting: bool,
    done: bool,
}

impl<'a> JoinCursor<'a> {
    fn new(
        graph: &'a PlanGraph,
        ctx: &'a RunContext,
        parents: Vec<OpId>,
        joins: &[JoinRef],
    ) -> Self {
        let streams = parents
            .iter()
            .enumerate()
            .map(|(stream, &parent)| JoinStream {
                source: tuples(graph, ctx, parent),
                key_slots: joins.iter().map(|j| j.context_indices[stream]).collect(),
                head: None,
                jokers: Vec::new(),
                exhausted: false,
            })
            .collect();
        Self {
            streams,
            block: Vec::new(),
            odometer: Vec::new(),
            emitting: false,
            done: false,
        }
    }

    /// Build the next non-empty block, or report the end of the join.
    fn fill_block(&mut self) -> Result<bool> {
        'align: loop {
            for stream in &mut self.streams {
                if stream.head.is_none() {
                    stream.pull()?;
                }
            }

            // Candidate key: the largest head key. No heads left anywhere
            // means no further block can be driven.
            let mut position: Option<Vec<i64>> = None;
            for stream in &self.streams {
                if let Some(head) = &stream.head {
                    let key = stream.key(head);
                    if position.as_ref().is_none_or(|p| key > *p) {
                        position = Some(key);
                    }
                }
            }
            let Some(position) = position else {
                return Ok(false);
            };

            // Advance lagging streams; overshooting moves the candidate up.
            for stream in &mut self.streams {
                while let Some(head) = &stream.head {
                    match stream.key(head).cmp(&position) {
                        Ordering::Less => {
                            stream.head = None;
                            stream.pull()?;
                        }
                        Ordering::Greater => continue 'align,
                        Ordering::Equal => break,
                    }
                }
            }

            // Gather each stream's contribution: matching jokers first, then
            // the run of real tuples at the position.
            let mut block: Vec<Vec<Tuple>> = Vec::with_capacity(self.streams.len());
            let mut complete = true;
            for stream in &mut self.streams {
                stream.expire_jokers(&position);
                let mut run = stream.matching_jokers(&position);
                while let Some(head) = &stream.head {
                    if stream.key(head) != position {
                        break;
                    }
                    run.push(stream.head.take().expect("head checked above"));
                    stream.pull()?;
                }
                if run.is_empty() {
                    complete = false;
                }
                block.push(run);
            }

            // A stream with nothing at this key vetoes the block; the runs
            // already consumed can never join and are dropped.
            if complete {
                self.block = block;
                self.odometer = vec![0; self.streams.len()];
                return Ok(true);
            }
        }
    }

    fn emit(&mut self) -> RawTuple {
        let picks: Vec<&Tuple> = self
            .odometer
            .iter()
            .zip(&self.block)
            .map(|(&i, run)| &run[i])
            .collect();
        let nodes = picks
            .iter()
            .flat_map(|t| t.nodes.iter().cloned())
            .collect();
        let contexts = picks.iter().map(|t| t.context.clone()).collect();

        // Step the in-block odometer, last stream fastest.
        self.emitting = false;
        for digit in (0..self.odometer.len()).rev() {
            self.odometer[digit] += 1;
            if self.odometer[digit] < self.block[digit].len() {
                self.emitting = true;
                break;
            }
            self.odometer[digit] = 0;
        }
        RawTuple::new(nodes, Contexts::per_parent(contexts))
    }
}

impl Iterator for JoinCursor<'_> {
    type Item = Result<RawTuple>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if !self.emitting {
            match self.fill_block() {
                Ok(true) => self.emitting = true,
                Ok(false) => {
                    self.done = true;
                    return None;
                }
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
            }
        }
        Some(Ok(self.emit()))
    }
}
