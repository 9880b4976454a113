use anyhow::anyhow;

use crate::{
    error::CageError,
    module::module_from_fn,
    modules::ConsoleModule,
    tests::{
        assert_contains,
        test_helpers::{
            run,
            run_with,
        },
    },
    Cage,
};

#[tokio::test]
async fn test_syntax_error() {
    let result = run("const a=1; const b=; ").await;
    let err = result.expect_err("syntax error must fail the evaluation");
    match err {
        CageError::Guest(e) => {
            assert_eq!(e.name, "SyntaxError");
            assert!(!e.message.is_empty());
        },
        other => panic!("unexpected error kind: {other:?}"),
    }
}

#[tokio::test]
async fn test_runtime_error() {
    let result = run("const b=null; b.x;").await;
    let err = result.expect_err("runtime error must fail the evaluation");
    match err {
        CageError::Guest(e) => {
            assert_eq!(e.name, "TypeError");
            assert!(!e.message.is_empty());
        },
        other => panic!("unexpected error kind: {other:?}"),
    }
}

#[tokio::test]
async fn test_thrown_custom_error_keeps_name() {
    let result = run(
        r#"
        class AppError extends Error {
            constructor(message) {
                super(message);
                this.name = "AppError";
            }
        }
        throw new AppError("it broke");
        "#,
    )
    .await;
    let err = result.expect_err("throw must fail the evaluation");
    match err {
        CageError::Guest(e) => {
            assert_eq!(e.name, "AppError");
            assert_eq!(e.message, "it broke");
        },
        other => panic!("unexpected error kind: {other:?}"),
    }
}

#[tokio::test]
async fn test_module_def_error_aborts_before_evaluation() {
    let failing = module_from_fn(|_ctx| Err(anyhow!("Module error")));
    let (console, capture) = ConsoleModule::capturing();
    let result = Cage::new()
        .run_code(r#"console.log("ran");"#, &[&failing, &console])
        .await;
    let err = result.expect_err("def failure must fail the evaluation");
    match &err {
        CageError::ModuleRegistration(e) => assert_eq!(e.to_string(), "Module error"),
        other => panic!("unexpected error kind: {other:?}"),
    }
    // Evaluation never ran.
    assert!(capture.messages().is_empty());
}

#[tokio::test]
async fn test_unhandled_rejection_is_a_job_queue_error() {
    let result = run(r#"Promise.reject(new Error("nope"));"#).await;
    let err = result.expect_err("unhandled rejection must fail the evaluation");
    match err {
        CageError::JobQueue(e) => assert_eq!(e.message, "nope"),
        other => panic!("unexpected error kind: {other:?}"),
    }
}

#[tokio::test]
async fn test_throw_inside_microtask() {
    let result = run(r#"Promise.resolve().then(() => { throw new Error("boom"); });"#).await;
    let err = result.expect_err("microtask throw must fail the evaluation");
    match err {
        CageError::JobQueue(e) => assert_eq!(e.message, "boom"),
        other => panic!("unexpected error kind: {other:?}"),
    }
}

#[tokio::test]
async fn test_handled_rejection_is_fine() {
    let result = run(
        r#"
        Promise.reject(new Error("caught below")).catch(() => {});
        "#,
    )
    .await;
    assert!(result.is_ok(), "{result:?}");
}

#[tokio::test]
async fn test_hook_error() {
    let hooky = module_from_fn(|ctx| {
        ctx.after_script(|_vm| Err(anyhow!("hook exploded")));
        Ok(())
    });
    let result = run_with("const a=1;", &[&hooky]).await;
    let err = result.expect_err("hook failure must fail the evaluation");
    match &err {
        CageError::Hook(e) => assert_contains(e, "hook exploded"),
        other => panic!("unexpected error kind: {other:?}"),
    }
}

#[tokio::test]
async fn test_run_code_reports_message_for_every_kind() {
    let result = run("const b=;").await;
    let err = result.expect_err("syntax error");
    assert!(!err.message().is_empty());
}
