//! DOT export of an operator graph, for diagnostics.
//!
//! Nodes carry the operator label and id; solid edges are parent streams,
//! labeled with the stream index and the context-slot remapping the child
//! computed at init time. Sort keys show as dashed edges, join and grouping
//! references as dotted ones. When emission counts are supplied each node is
//! annotated with the number of tuples it produced.

use std::collections::HashMap;
use std::fmt::Write;

use crate::graph::{ContextSource, PlanGraph};
use crate::op_id::OpId;
use crate::operator::OperatorKind;
use crate::planner;

pub(crate) fn render(graph: &PlanGraph, root: OpId, counts: Option<&HashMap<OpId, u64>>) -> String {
    let mut out = String::from("digraph plan {\n");
    for op in planner::reachable(graph, root) {
        let mut label = format!("{} {}", graph.label(op), op);
        if let Some(count) = counts.and_then(|c| c.get(&op)) {
            write!(label, "\\n{count} tuples").ok();
        }
        writeln!(out, "  p{} [label=\"{}\"];", op.raw(), escape(&label)).ok();

        for (stream, &parent) in graph.parents(op).iter().enumerate() {
            let remap = remapping(graph, op, stream);
            writeln!(
                out,
                "  p{} -> p{} [label=\"{stream}{remap}\"];",
                parent.raw(),
                op.raw()
            )
            .ok();
        }

        match graph.kind(op) {
            OperatorKind::OrderBy { order, .. } => {
                for item in order.items() {
                    writeln!(
                        out,
                        "  p{} -> p{} [style=\"dashed\"];",
                        item.raw(),
                        op.raw()
                    )
                    .ok();
                }
            }
            OperatorKind::Join { refs, .. } | OperatorKind::GroupBy { refs, .. } => {
                for r in refs {
                    writeln!(out, "  p{} -> p{} [style=\"dotted\"];", r.raw(), op.raw()).ok();
                }
            }
            _ => {}
        }
    }
    out.push_str("}\n");
    out
}

/// `slot→local` pairs for the context entries the child takes from this
/// stream. Empty before init or when nothing is taken.
fn remapping(graph: &PlanGraph, op: OpId, stream: usize) -> String {
    let mut remap = String::new();
    for (local, source) in graph.record(op).sources.iter().enumerate() {
        if let ContextSource::Parent { stream: s, slot } = source
            && *s == stream
        {
            let sep = if remap.is_empty() { ": " } else { " " };
            write!(remap, "{sep}{slot}>{local}").ok();
        }
    }
    remap
}

fn escape(label: &str) -> String {
    label.replace('"', "\\\"")
}
