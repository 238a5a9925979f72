use anyhow::Result;
use expflow::{PlanError, RunContext, Workspace};
use serde_json::json;

#[test]
fn dot_export_names_every_operator() -> Result<()> {
    let ws = Workspace::new();
    let lr = ws.constant_of("lr", [0.1, 0.01])?;
    let depth = ws.constant_of("depth", [2])?;
    let grid = ws.merge("grid", &[("lr", &lr), ("depth", &depth)])?;

    let dot = grid.to_dot(true)?;
    assert!(dot.starts_with("digraph plan {"));
    assert!(dot.ends_with("}\n"));
    assert!(dot.contains("lr [constant(2)]"));
    assert!(dot.contains("depth [constant(1)]"));
    assert!(dot.contains("task grid"));
    assert!(dot.contains(" -> "));
    Ok(())
}

#[test]
fn joined_plans_show_sort_and_join_edges() -> Result<()> {
    let ws = Workspace::new();
    let base = ws.constant_of("base", [1i64, 2])?;
    let a = base.transform("a", |n| Ok(n.to_vec()));
    let b = base.transform("b", |n| Ok(n.to_vec()));
    let m = ws.merge("m", &[("a", &a), ("b", &b)])?;

    let dot = m.to_dot(true)?;
    assert!(dot.contains("join(1)"));
    assert!(dot.contains("order-by(1)"));
    assert!(dot.contains("style=\"dashed\""), "sort keys are dashed");
    assert!(dot.contains("style=\"dotted\""), "join refs are dotted");
    Ok(())
}

#[test]
fn simplification_collapses_single_branch_unions() -> Result<()> {
    let ws = Workspace::new();
    let only = ws.constant_of("only", [1, 2])?;
    let u = ws.union_of(std::slice::from_ref(&only))?;

    assert!(u.to_dot(false)?.contains("union"));
    assert!(!u.to_dot(true)?.contains("union"));

    // Collapsing is purely structural; the stream is unchanged.
    assert_eq!(u.run(&RunContext::new())?, vec![json!(1), json!(2)]);
    Ok(())
}

#[test]
fn dot_export_is_stable_across_calls() -> Result<()> {
    let ws = Workspace::new();
    let x = ws.constant_of("x", [1, 2])?;
    let y = ws.constant_of("y", [3])?;
    let m = ws.merge("m", &[("x", &x), ("y", &y)])?;

    assert_eq!(m.to_dot(true)?, m.to_dot(true)?);
    Ok(())
}

#[test]
fn detailed_simulation_annotates_counts() -> Result<()> {
    let ws = Workspace::new();
    let x = ws.constant_of("x", [1, 2, 3])?;
    let y = ws.constant_of("y", [4])?;
    let m = ws.merge("m", &[("x", &x), ("y", &y)])?;

    let (out, dot) = m.simulate_detailed(&RunContext::new())?;
    assert_eq!(out.len(), 3);
    assert!(dot.contains("3 tuples"));
    Ok(())
}

#[test]
fn group_by_rejects_unrelated_keys() -> Result<()> {
    let ws = Workspace::new();
    let stream = ws.constant_of("stream", [1, 2])?;
    let unrelated = ws.constant_of("unrelated", [3])?;

    let err = stream.group_by(&[unrelated]).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<PlanError>(),
        Some(PlanError::NotAnAncestor { index: 0 })
    ));
    Ok(())
}

#[test]
fn merge_rejects_dotted_input_names() -> Result<()> {
    let ws = Workspace::new();
    let c = ws.constant_of("c", [1])?;

    let err = ws.merge("m", &[("model.lr", &c)]).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<PlanError>(),
        Some(PlanError::DottedName { .. })
    ));
    Ok(())
}

#[test]
fn empty_combinations_are_rejected() -> Result<()> {
    let ws = Workspace::new();
    for err in [
        ws.union_of(&[]).unwrap_err(),
        ws.product_of(&[]).unwrap_err(),
        ws.merge("m", &[]).unwrap_err(),
    ] {
        assert!(matches!(
            err.downcast_ref::<PlanError>(),
            Some(PlanError::EmptyCombination { .. })
        ));
    }
    Ok(())
}
