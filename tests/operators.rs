use anyhow::Result;
use expflow::testing::docs;
use expflow::{RunContext, TaskError, Workspace};
use serde_json::json;

#[test]
fn merge_of_independent_axes_is_a_grid() -> Result<()> {
    let ws = Workspace::new();
    let lr = ws.constant_of("lr", [0.1, 0.01])?;
    let depth = ws.constant_of("depth", [2, 4])?;

    let grid = ws.merge("grid", &[("lr", &lr), ("depth", &depth)])?;
    let out = grid.run(&RunContext::new())?;

    // The last axis varies fastest.
    assert_eq!(
        out,
        vec![
            json!({"depth": 2, "lr": 0.1}),
            json!({"depth": 4, "lr": 0.1}),
            json!({"depth": 2, "lr": 0.01}),
            json!({"depth": 4, "lr": 0.01}),
        ]
    );
    Ok(())
}

#[test]
fn merge_with_an_empty_axis_is_empty() -> Result<()> {
    let ws = Workspace::new();
    let some = ws.constant_of("some", [1, 2])?;
    let none = ws.constant("none", Vec::new());

    let grid = ws.merge("grid", &[("a", &some), ("b", &none)])?;
    assert!(grid.run(&RunContext::new())?.is_empty());
    Ok(())
}

#[test]
fn union_concatenates_in_argument_order() -> Result<()> {
    let ws = Workspace::new();
    let a = ws.constant_of("a", [1, 2])?;
    let b = ws.constant_of("b", [3])?;

    let u = ws.union_of(&[a, b])?;
    assert_eq!(u.run(&RunContext::new())?, docs([1, 2, 3]));
    Ok(())
}

#[test]
fn select_follows_a_json_pointer() -> Result<()> {
    let ws = Workspace::new();
    let c = ws.constant(
        "c",
        vec![
            json!({"model": {"lr": 0.1}}),
            json!({"model": {"lr": 0.2}}),
            json!({"other": true}),
        ],
    );

    // Tuples without a match are dropped, not nulled.
    let lr = c.select("/model/lr");
    assert_eq!(lr.run(&RunContext::new())?, docs([0.1, 0.2]));
    Ok(())
}

#[test]
fn transform_may_expand_or_drop_tuples() -> Result<()> {
    let ws = Workspace::new();
    let c = ws.constant_of("c", [1i64, 2, 3])?;

    let doubled = c.transform("repeat", |nodes| {
        let n = nodes[0].as_i64().unwrap();
        Ok(if n == 2 {
            Vec::new()
        } else {
            vec![json!(n), json!(n * 10)]
        })
    });
    assert_eq!(doubled.run(&RunContext::new())?, docs([1, 10, 3, 30]));
    Ok(())
}

#[test]
fn derived_streams_rejoin_on_their_shared_source() -> Result<()> {
    let ws = Workspace::new();
    let base = ws.constant_of("base", [1i64, 2])?;
    let twice = base.transform("twice", |n| Ok(vec![json!(n[0].as_i64().unwrap() * 2)]));
    let inc = base.transform("inc", |n| Ok(vec![json!(n[0].as_i64().unwrap() + 1)]));

    // Joined point for point, not crossed: 2 tuples rather than 4.
    let pair = ws.merge("pair", &[("twice", &twice), ("inc", &inc)])?;
    assert_eq!(
        pair.run(&RunContext::new())?,
        vec![json!({"inc": 2, "twice": 2}), json!({"inc": 3, "twice": 4})]
    );
    Ok(())
}

#[test]
fn group_by_collapses_runs_sharing_an_ancestor() -> Result<()> {
    let ws = Workspace::new();
    let x = ws.constant_of("x", ["a", "b"])?;
    let y = ws.constant_of("y", [1, 2, 3])?;
    let grid = ws.merge("grid", &[("x", &x), ("y", &y)])?;

    let grouped = grid.group_by(&[x])?;
    let out = grouped.run(&RunContext::new())?;

    assert_eq!(
        out,
        vec![
            json!([{"x": "a", "y": 1}, {"x": "a", "y": 2}, {"x": "a", "y": 3}]),
            json!([{"x": "b", "y": 1}, {"x": "b", "y": 2}, {"x": "b", "y": 3}]),
        ]
    );
    Ok(())
}

#[test]
fn group_by_of_an_empty_stream_has_no_groups() -> Result<()> {
    let ws = Workspace::new();
    let x = ws.constant("x", Vec::new());
    let y = x.transform("keep", |n| Ok(n.to_vec()));

    let grouped = y.group_by(&[x])?;
    assert!(grouped.run(&RunContext::new())?.is_empty());
    Ok(())
}

#[test]
fn groups_of_uneven_sizes_stay_separate() -> Result<()> {
    let ws = Workspace::new();
    let base = ws.constant_of("base", [1i64, 2, 3])?;
    let fanned = base.transform("fan", |n| {
        let v = n[0].as_i64().unwrap();
        // 1 fans out to two tuples, 2 to three, 3 to one.
        Ok(match v {
            1 => vec![json!(10), json!(11)],
            2 => vec![json!(20), json!(21), json!(22)],
            _ => vec![json!(30)],
        })
    });

    let grouped = fanned.group_by(&[base])?;
    assert_eq!(
        grouped.run(&RunContext::new())?,
        vec![json!([10, 11]), json!([20, 21, 22]), json!([30])]
    );
    Ok(())
}

#[test]
fn union_branches_without_the_join_key_match_every_key() -> Result<()> {
    let ws = Workspace::new();
    let base = ws.constant_of("base", [1i64, 2])?;
    let derived = base.transform("twice", |n| Ok(vec![json!(n[0].as_i64().unwrap() * 2)]));
    let floating = ws.constant_of("floating", [100i64])?;
    let u = ws.union_of(&[derived, floating.clone()])?;

    // The floating branch carries no provenance for `base`, so its tuple
    // pairs with both base values; the derived branch only with its own.
    let m = ws.merge("m", &[("u", &u), ("b", &base)])?;
    assert_eq!(
        m.run(&RunContext::new())?,
        vec![
            json!({"b": 1, "u": 100}),
            json!({"b": 1, "u": 2}),
            json!({"b": 2, "u": 100}),
            json!({"b": 2, "u": 4}),
        ]
    );
    Ok(())
}

#[test]
fn reruns_are_deterministic() -> Result<()> {
    let ws = Workspace::new();
    let base = ws.constant_of("base", [1i64, 2, 3])?;
    let twice = base.transform("twice", |n| Ok(vec![json!(n[0].as_i64().unwrap() * 2)]));
    let pair = ws.merge("pair", &[("b", &base), ("t", &twice)])?;

    let first = pair.run(&RunContext::new())?;
    let second = pair.run(&RunContext::new())?;
    assert_eq!(first, second);
    assert_eq!(first.len(), 3);
    Ok(())
}

#[test]
fn copies_are_independent_streams() -> Result<()> {
    let ws = Workspace::new();
    let base = ws.constant_of("base", [1i64, 2])?;
    let copy = base.copy();

    // A copy shares no ancestry, so combining crosses instead of joins.
    let m = ws.merge("m", &[("a", &base), ("b", &copy)])?;
    assert_eq!(m.run(&RunContext::new())?.len(), 4);
    Ok(())
}

#[test]
fn copies_keep_their_internal_sharing() -> Result<()> {
    let ws = Workspace::new();
    let base = ws.constant_of("base", [1i64, 2])?;
    let twice = base.transform("twice", |n| Ok(vec![json!(n[0].as_i64().unwrap() * 2)]));
    let inc = base.transform("inc", |n| Ok(vec![json!(n[0].as_i64().unwrap() + 1)]));
    let pair = ws.merge("pair", &[("t", &twice), ("i", &inc)])?;

    // The shared source is duplicated once inside the copy, so the copied
    // streams still join point for point through their common duplicate.
    let copied = pair.copy();
    assert_eq!(
        copied.run(&RunContext::new())?,
        vec![json!({"i": 2, "t": 2}), json!({"i": 3, "t": 4})]
    );

    // While original and copy together share nothing, and cross.
    let both = ws.merge("both", &[("x", &pair), ("y", &copied)])?;
    assert_eq!(both.run(&RunContext::new())?.len(), 4);
    Ok(())
}

#[test]
fn task_failures_carry_the_task_identity() -> Result<()> {
    use expflow::testing::FailingFactory;
    use expflow::{Plan, PlanInputs};

    let ws = Workspace::new();
    let c = ws.constant_of("c", [1])?;
    let plan = Plan::new(&ws, FailingFactory::new("boom", "disk on fire"));
    plan.add(PlanInputs::new().bind("v", &c));

    let err = plan.operator().run(&RunContext::new()).unwrap_err();
    let task_err = err
        .downcast_ref::<TaskError>()
        .expect("failure should surface as a task error");
    assert_eq!(task_err.task, "boom");
    assert!(format!("{err:#}").contains("disk on fire"));
    Ok(())
}

#[test]
fn simulate_runs_the_same_plan() -> Result<()> {
    let ws = Workspace::new();
    let a = ws.constant_of("a", [1, 2])?;
    let b = ws.constant_of("b", [10])?;
    let m = ws.merge("m", &[("a", &a), ("b", &b)])?;

    let ctx = RunContext::new();
    assert_eq!(m.simulate(&ctx)?, m.run(&ctx)?);
    Ok(())
}

#[test]
fn run_counted_reports_per_operator_emissions() -> Result<()> {
    let ws = Workspace::new();
    let lr = ws.constant_of("lr", [0.1, 0.01])?;
    let depth = ws.constant_of("depth", [2, 4])?;
    let grid = ws.merge("grid", &[("lr", &lr), ("depth", &depth)])?;

    let (out, counts) = grid.run_counted(&RunContext::new())?;
    assert_eq!(out.len(), 4);
    assert_eq!(counts.get("lr [constant(2)]"), Some(&2));
    assert_eq!(counts.get("task grid"), Some(&4));
    Ok(())
}
