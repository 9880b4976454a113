use std::{
    cell::{
        Cell,
        RefCell,
    },
    rc::Rc,
};

use anyhow::anyhow;

use crate::{
    error::CageError,
    module::{
        module_from_fn,
        SandboxValue,
    },
    tests::test_helpers::{
        run_with,
        run_with_console,
    },
    value::GuestValue,
    Cage,
    PropertyAttributes,
};

#[tokio::test]
async fn test_after_script_hook_runs_on_success() {
    let flag = Rc::new(Cell::new(false));
    let flag2 = flag.clone();
    let module = module_from_fn(move |ctx| {
        let flag = flag2.clone();
        ctx.after_script(move |_vm| {
            flag.set(true);
            Ok(())
        });
        Ok(())
    });
    let result = run_with("const a=1;", &[&module]).await;
    assert!(result.is_ok(), "{result:?}");
    assert!(flag.get());
}

#[tokio::test]
async fn test_after_script_hook_skipped_on_eval_error() {
    let flag = Rc::new(Cell::new(false));
    let flag2 = flag.clone();
    let module = module_from_fn(move |ctx| {
        let flag = flag2.clone();
        ctx.after_script(move |_vm| {
            flag.set(true);
            Ok(())
        });
        Ok(())
    });
    let result = run_with("const a=;", &[&module]).await;
    assert!(result.is_err(), "{result:?}");
    assert!(!flag.get());
}

#[tokio::test]
async fn test_hook_ordering_across_modules() {
    let order: Rc<RefCell<Vec<u32>>> = Rc::new(RefCell::new(Vec::new()));
    let o1 = order.clone();
    let first = module_from_fn(move |ctx| {
        for i in [1u32, 2] {
            let order = o1.clone();
            ctx.after_script(move |_vm| {
                order.borrow_mut().push(i);
                Ok(())
            });
        }
        Ok(())
    });
    let o2 = order.clone();
    let second = module_from_fn(move |ctx| {
        let order = o2.clone();
        ctx.after_script(move |_vm| {
            order.borrow_mut().push(3);
            Ok(())
        });
        Ok(())
    });
    let result = run_with("const a=1;", &[&first, &second]).await;
    assert!(result.is_ok(), "{result:?}");
    assert_eq!(*order.borrow(), vec![1, 2, 3]);
}

#[tokio::test]
async fn test_sandbox_fn_marshals_arguments_and_result() {
    let module = module_from_fn(|ctx| {
        ctx.define_sandbox_fn("add", |args| {
            let a = args.first().and_then(|v| v.as_f64()).unwrap_or(0.0);
            let b = args.get(1).and_then(|v| v.as_f64()).unwrap_or(0.0);
            Ok(GuestValue::Number(a + b))
        })
    });
    let result = run_with(
        r#"
        if (add(2, 3) !== 5) throw new Error("wrong sum");
        "#,
        &[&module],
    )
    .await;
    assert!(result.is_ok(), "{result:?}");
}

#[tokio::test]
async fn test_sandbox_fn_error_becomes_guest_exception() {
    let module = module_from_fn(|ctx| {
        ctx.define_sandbox_fn("explode", |_args| Err(anyhow!("host refused")))
    });
    let result = run_with(
        r#"
        let caught = null;
        try {
            explode();
        } catch (e) {
            caught = e;
        }
        if (caught === null) throw new Error("no exception crossed the boundary");
        if (!caught.message.includes("host refused")) throw new Error("wrong message: " + caught.message);
        "#,
        &[&module],
    )
    .await;
    assert!(result.is_ok(), "{result:?}");
}

#[tokio::test]
async fn test_sandbox_object_nesting() {
    let module = module_from_fn(|ctx| {
        let double = ctx.sandbox_fn("double", |args| {
            let n = args.first().and_then(|v| v.as_f64()).unwrap_or(0.0);
            Ok(GuestValue::Number(n * 2.0))
        })?;
        let version = ctx.vm().new_string("1.2.3")?;
        let version = ctx.vm().manage(version)?;
        ctx.define_sandbox_object(
            "api",
            SandboxValue::Object(vec![
                (
                    "math".to_string(),
                    SandboxValue::Object(vec![("double".to_string(), SandboxValue::Handle(double))]),
                ),
                ("version".to_string(), SandboxValue::Handle(version)),
            ]),
        )
    });
    let result = run_with(
        r#"
        if (api.math.double(21) !== 42) throw new Error("nested call failed");
        if (api.version !== "1.2.3") throw new Error("leaf handle failed");
        "#,
        &[&module],
    )
    .await;
    assert!(result.is_ok(), "{result:?}");
}

#[tokio::test]
async fn test_marshalling_an_opaque_value_fails() {
    let module = module_from_fn(|ctx| {
        // The dump of a guest function is opaque; pushing it back through the
        // marshaller is a host-side mistake the evaluation must surface.
        ctx.vm().to_guest(&GuestValue::Opaque("function"))?;
        Ok(())
    });
    let result = run_with("const a=1;", &[&module]).await;
    let err = result.expect_err("marshalling an opaque value must fail");
    match err {
        CageError::Marshal(_) => (),
        other => panic!("unexpected error kind: {other:?}"),
    }
}

#[tokio::test]
async fn test_console_microtask_ordering() {
    let (result, capture) = run_with_console(
        r#"
        console.log("Start");
        Promise.resolve().then(()=>console.log("P1")).then(()=>console.log("P2"));
        Promise.resolve().then(()=>console.log("P3"));
        console.log("End");
        "#,
    )
    .await;
    assert!(result.is_ok(), "{result:?}");
    assert_eq!(capture.messages(), vec!["Start", "End", "P1", "P3", "P2"]);
}

#[tokio::test]
async fn test_console_formats_values() {
    let (result, capture) = run_with_console(
        r#"
        console.log("n:", 3, [1, "a"], { x: true }, null, undefined);
        "#,
    )
    .await;
    assert!(result.is_ok(), "{result:?}");
    assert_eq!(
        capture.messages(),
        vec![r#"n: 3 [1, "a"] {x: true} null undefined"#]
    );
}

#[tokio::test]
async fn test_read_only_define_prop() {
    let module = module_from_fn(|ctx| {
        let global = ctx.vm().global();
        let value = ctx.vm().new_number(7.0);
        ctx.vm()
            .define_prop(&global, "LIMIT", &value, PropertyAttributes::READ_ONLY)
    });
    // Modules run in strict mode, so assigning to a read-only global throws.
    let result = run_with("LIMIT = 8;", &[&module]).await;
    assert!(result.is_err(), "{result:?}");
    let result = run_with(
        r#"if (LIMIT !== 7) throw new Error("missing");"#,
        &[&module],
    )
    .await;
    assert!(result.is_ok(), "{result:?}");
}

#[tokio::test]
async fn test_modules_install_in_caller_order() {
    // Later modules can see bindings installed by earlier ones.
    let first = module_from_fn(|ctx| {
        ctx.define_sandbox_fn("base", |_args| Ok(GuestValue::Number(10.0)))
    });
    let second = module_from_fn(|ctx| {
        let global = ctx.vm().global();
        let base = ctx.vm().get_prop(&global, "base")?;
        anyhow::ensure!(ctx.vm().is_function(&base)?, "base missing during def");
        Ok(())
    });
    let result = Cage::new().run_code("const a=1;", &[&first, &second]).await;
    assert!(result.is_ok(), "{result:?}");
}
