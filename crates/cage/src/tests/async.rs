use std::{
    cell::Cell,
    rc::Rc,
    time::Duration,
};

use crate::{
    module::module_from_fn,
    modules::{
        ConsoleModule,
        TimersModule,
    },
    tests::test_helpers::run_with,
    value::GuestValue,
    Cage,
};

#[tokio::test]
async fn test_set_timeout_gates_completion() {
    let (console, capture) = ConsoleModule::capturing();
    let result = Cage::new()
        .run_code(
            r#"setTimeout(() => console.log("t"), 10);"#,
            &[&console, &TimersModule],
        )
        .await;
    assert!(result.is_ok(), "{result:?}");
    // The evaluation only returned once the timer had fired.
    assert_eq!(capture.messages(), vec!["t"]);
}

#[tokio::test]
async fn test_clear_timeout_cancels_and_releases() {
    let (console, capture) = ConsoleModule::capturing();
    let result = Cage::new()
        .run_code(
            r#"
            const id = setTimeout(() => console.log("t"), 50);
            clearTimeout(id);
            "#,
            &[&console, &TimersModule],
        )
        .await;
    // Completes (the cleared timer no longer pins the evaluation) and the
    // callback never ran.
    assert!(result.is_ok(), "{result:?}");
    assert!(capture.messages().is_empty());
}

#[tokio::test]
async fn test_nested_timeouts() {
    let (console, capture) = ConsoleModule::capturing();
    let result = Cage::new()
        .run_code(
            r#"
            setTimeout(() => {
                console.log("outer");
                setTimeout(() => console.log("inner"), 1);
            }, 1);
            "#,
            &[&console, &TimersModule],
        )
        .await;
    assert!(result.is_ok(), "{result:?}");
    assert_eq!(capture.messages(), vec!["outer", "inner"]);
}

#[tokio::test]
async fn test_set_interval_until_cleared() {
    let (console, capture) = ConsoleModule::capturing();
    let result = Cage::new()
        .run_code(
            r#"
            let count = 0;
            const id = setInterval(() => {
                count += 1;
                console.log("tick " + count);
                if (count === 3) clearInterval(id);
            }, 1);
            "#,
            &[&console, &TimersModule],
        )
        .await;
    assert!(result.is_ok(), "{result:?}");
    assert_eq!(capture.messages(), vec!["tick 1", "tick 2", "tick 3"]);
}

#[tokio::test]
async fn test_timer_callback_error_fails_evaluation() {
    let result = run_with(
        r#"setTimeout(() => { throw new Error("late boom"); }, 1);"#,
        &[&TimersModule],
    )
    .await;
    let err = result.expect_err("timer callback throw must fail the evaluation");
    assert!(err.message().contains("late boom"), "{err:?}");
}

#[tokio::test]
async fn test_keep_alive_future_gates_completion() {
    let flag = Rc::new(Cell::new(false));
    let flag2 = flag.clone();
    let module = module_from_fn(move |ctx| {
        let flag = flag2.clone();
        ctx.keep_alive(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            flag.set(true);
        })
    });
    let result = run_with("const a=1;", &[&module]).await;
    assert!(result.is_ok(), "{result:?}");
    assert!(flag.get(), "evaluation returned before the keep-alive settled");
}

#[tokio::test]
async fn test_marshal_future_resolves_guest_promise() {
    let module = module_from_fn(|ctx| {
        ctx.define_sandbox_fn_raw(
            "delayedValue",
            Box::new(|vm, _this, _args| {
                vm.marshal_future(async {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    Ok(GuestValue::Number(42.0))
                })
            }),
        )
    });
    let result = run_with(
        r#"
        const v = await delayedValue();
        if (v !== 42) throw new Error("wrong value: " + v);
        "#,
        &[&module],
    )
    .await;
    assert!(result.is_ok(), "{result:?}");
}

#[tokio::test]
async fn test_marshal_future_rejection_reaches_guest() {
    let module = module_from_fn(|ctx| {
        ctx.define_sandbox_fn_raw(
            "failLater",
            Box::new(|vm, _this, _args| {
                vm.marshal_future(async {
                    Err(crate::GuestError::type_error("host side gave up"))
                })
            }),
        )
    });
    let result = run_with(
        r#"
        let caught = null;
        try {
            await failLater();
        } catch (e) {
            caught = e;
        }
        if (caught === null) throw new Error("rejection did not arrive");
        if (caught.name !== "TypeError") throw new Error("wrong name: " + caught.name);
        if (!caught.message.includes("host side gave up")) throw new Error("wrong message");
        "#,
        &[&module],
    )
    .await;
    assert!(result.is_ok(), "{result:?}");
}

#[tokio::test]
async fn test_top_level_await_on_timer() {
    let (console, capture) = ConsoleModule::capturing();
    let result = Cage::new()
        .run_code(
            r#"
            await new Promise((resolve) => setTimeout(resolve, 5));
            console.log("after await");
            "#,
            &[&console, &TimersModule],
        )
        .await;
    assert!(result.is_ok(), "{result:?}");
    assert_eq!(capture.messages(), vec!["after await"]);
}
