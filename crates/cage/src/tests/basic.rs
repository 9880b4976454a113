use crate::tests::test_helpers::run;

#[tokio::test]
async fn test_valid_arithmetic() {
    let result = run("const a=1; const b=2; const sum=a+b;").await;
    assert!(result.is_ok(), "{result:?}");
}

#[tokio::test]
async fn test_empty_script() {
    let result = run("").await;
    assert!(result.is_ok(), "{result:?}");
}

#[tokio::test]
async fn test_script_can_use_builtin_globals() {
    let result = run(
        r#"
        const s = JSON.stringify({ a: [1, 2, 3] });
        const parsed = JSON.parse(s);
        if (parsed.a.length !== 3) throw new Error("bad roundtrip");
        if (Math.max(1, 5, 3) !== 5) throw new Error("bad max");
        "#,
    )
    .await;
    assert!(result.is_ok(), "{result:?}");
}

#[tokio::test]
async fn test_microtasks_run_to_completion() {
    // A resolved promise chain must have fully executed by the time the
    // evaluation returns.
    let result = run(
        r#"
        globalThis.steps = [];
        Promise.resolve()
            .then(() => globalThis.steps.push(1))
            .then(() => globalThis.steps.push(2))
            .then(() => {
                if (globalThis.steps.length !== 2) throw new Error("queue not drained");
            });
        "#,
    )
    .await;
    assert!(result.is_ok(), "{result:?}");
}

#[tokio::test]
async fn test_sequential_evaluations_share_nothing() {
    let result = run("globalThis.leak = 42;").await;
    assert!(result.is_ok(), "{result:?}");
    let result = run(
        r#"
        if (typeof globalThis.leak !== "undefined") throw new Error("state leaked");
        "#,
    )
    .await;
    assert!(result.is_ok(), "{result:?}");
}

#[tokio::test]
async fn test_eval_is_disallowed() {
    let result = run("eval('1 + 1');").await;
    assert!(result.is_err(), "{result:?}");
}
