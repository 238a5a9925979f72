use anyhow::Result;
use expflow::testing::{CountingFactory, EchoFactory};
use expflow::{Plan, PlanError, PlanInputs, RunContext, Workspace};
use serde_json::json;

#[test]
fn one_input_set_crosses_independent_parameters() -> Result<()> {
    let ws = Workspace::new();
    let x = ws.constant_of("x", [1, 2])?;
    let y = ws.constant_of("y", ["a", "b"])?;

    let plan = Plan::new(&ws, EchoFactory::new("echo"));
    plan.add(PlanInputs::new().bind("x", &x).bind("y", &y));

    let out = plan.operator().run(&RunContext::new())?;
    assert_eq!(
        out,
        vec![
            json!({"x": 1, "y": "a"}),
            json!({"x": 1, "y": "b"}),
            json!({"x": 2, "y": "a"}),
            json!({"x": 2, "y": "b"}),
        ]
    );
    Ok(())
}

#[test]
fn alternative_input_sets_union() -> Result<()> {
    let ws = Workspace::new();
    let x = ws.constant_of("x", [1, 2])?;
    let y = ws.constant_of("y", [3, 4, 5])?;

    let plan = Plan::new(&ws, EchoFactory::new("echo"));
    plan.add(PlanInputs::new().bind("x", &x));
    plan.add(PlanInputs::new().bind("y", &y));

    let out = plan.operator().run(&RunContext::new())?;
    assert_eq!(
        out,
        vec![
            json!({"x": 1}),
            json!({"x": 2}),
            json!({"y": 3}),
            json!({"y": 4}),
            json!({"y": 5}),
        ]
    );
    Ok(())
}

#[test]
fn several_bindings_of_one_name_union() -> Result<()> {
    let ws = Workspace::new();
    let a = ws.constant_of("a", [1])?;
    let b = ws.constant_of("b", [2, 3])?;

    let plan = Plan::new(&ws, EchoFactory::new("echo"));
    plan.add(PlanInputs::new().bind("v", &a).bind("v", &b));

    let out = plan.operator().run(&RunContext::new())?;
    assert_eq!(out, vec![json!({"v": 1}), json!({"v": 2}), json!({"v": 3})]);
    Ok(())
}

#[test]
fn a_plan_without_input_sets_cannot_run() -> Result<()> {
    let ws = Workspace::new();
    let plan = Plan::new(&ws, EchoFactory::new("orphan"));

    let err = plan.operator().run(&RunContext::new()).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<PlanError>(),
        Some(PlanError::EmptyPlan { task }) if task == "orphan"
    ));
    Ok(())
}

#[test]
fn an_empty_input_set_runs_the_task_once() -> Result<()> {
    let ws = Workspace::new();
    let plan = Plan::new(&ws, EchoFactory::new("echo"));
    plan.add(PlanInputs::new());

    let out = plan.operator().run(&RunContext::new())?;
    assert_eq!(out, vec![json!({})]);
    Ok(())
}

#[test]
fn dotted_names_address_nested_parameters() -> Result<()> {
    let ws = Workspace::new();
    let lr = ws.constant_of("lr", [0.1])?;

    let plan = Plan::new(&ws, EchoFactory::new("echo"));
    plan.add(PlanInputs::new().bind("model.lr", &lr));

    let out = plan.operator().run(&RunContext::new())?;
    assert_eq!(out, vec![json!({"model.lr": 0.1})]);
    Ok(())
}

#[test]
fn the_same_operator_bound_twice_is_not_crossed() -> Result<()> {
    let ws = Workspace::new();
    let c = ws.constant_of("c", [1, 2, 3])?;

    let plan = Plan::new(&ws, EchoFactory::new("echo"));
    plan.add(PlanInputs::new().bind("a", &c).bind("b", &c));

    let out = plan.operator().run(&RunContext::new())?;
    assert_eq!(
        out,
        vec![
            json!({"a": 1, "b": 1}),
            json!({"a": 2, "b": 2}),
            json!({"a": 3, "b": 3}),
        ]
    );
    Ok(())
}

#[test]
fn a_task_runs_at_most_once_per_tuple_within_a_run() -> Result<()> {
    let ws = Workspace::new();
    let c = ws.constant(
        "c",
        vec![json!({"v": 1}), json!({"v": 2}), json!({"v": 3})],
    );

    let counting = CountingFactory::new("work");
    let plan = Plan::new(&ws, counting.clone());
    plan.add(PlanInputs::new().bind("in", &c));
    let op = plan.operator();

    // Two consumers of the task output, rejoined on the task itself.
    let a = op.select("/in/v");
    let b = op.select("/in/v");
    let pair = ws.merge("pair", &[("a", &a), ("b", &b)])?;

    let out = pair.run(&RunContext::new())?;
    assert_eq!(
        out,
        vec![
            json!({"a": 1, "b": 1}),
            json!({"a": 2, "b": 2}),
            json!({"a": 3, "b": 3}),
        ]
    );
    assert_eq!(counting.runs(), 3);
    Ok(())
}

#[test]
fn a_fresh_context_runs_tasks_again() -> Result<()> {
    let ws = Workspace::new();
    let c = ws.constant_of("c", [1, 2])?;

    let counting = CountingFactory::new("work");
    let plan = Plan::new(&ws, counting.clone());
    plan.add(PlanInputs::new().bind("v", &c));
    let op = plan.operator();

    op.run(&RunContext::new())?;
    assert_eq!(counting.runs(), 2);
    op.run(&RunContext::new())?;
    assert_eq!(counting.runs(), 4);
    Ok(())
}

#[test]
fn nested_plans_expand_once_and_rejoin() -> Result<()> {
    let ws = Workspace::new();
    let c = ws.constant(
        "c",
        vec![json!({"v": 10}), json!({"v": 20})],
    );

    let counting = CountingFactory::new("inner");
    let inner = Plan::new(&ws, counting.clone());
    inner.add(PlanInputs::new().bind("in", &c));
    let inner_op = inner.operator();

    // Two streams derived from the inner plan, merged back together.
    let raw = inner_op.select("/in/v");
    let tagged = inner_op.transform("tag", |nodes| {
        Ok(vec![json!({"tagged": nodes[0]["in"]["v"].clone()})])
    });
    let pair = ws.merge("pair", &[("raw", &raw), ("tagged", &tagged)])?;

    let out = pair.run(&RunContext::new())?;
    assert_eq!(
        out,
        vec![
            json!({"raw": 10, "tagged": {"tagged": 10}}),
            json!({"raw": 20, "tagged": {"tagged": 20}}),
        ]
    );
    assert_eq!(counting.runs(), 2);
    Ok(())
}

#[test]
fn plans_stack_as_inputs_of_other_plans() -> Result<()> {
    let ws = Workspace::new();
    let c = ws.constant_of("c", [1, 2])?;

    let inner = Plan::new(&ws, EchoFactory::new("inner"));
    inner.add(PlanInputs::new().bind("v", &c));

    let outer = Plan::new(&ws, EchoFactory::new("outer"));
    outer.add(PlanInputs::new().bind("payload", &inner.operator()));

    let out = outer.operator().run(&RunContext::new())?;
    assert_eq!(
        out,
        vec![
            json!({"payload": {"v": 1}}),
            json!({"payload": {"v": 2}}),
        ]
    );
    Ok(())
}
