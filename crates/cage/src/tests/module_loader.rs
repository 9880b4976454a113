use std::{
    collections::HashMap,
    rc::Rc,
};

use anyhow::anyhow;
use async_trait::async_trait;
use deno_core::ModuleSpecifier;

use crate::{
    error::CageError,
    loader::ModuleLoader,
    module::module_from_fn,
    tests::test_helpers::{
        run,
        run_with,
    },
};

/// Serves modules from an in-memory map, the way a host embedding the cage
/// would serve bundled sources.
struct MapLoader {
    modules: HashMap<String, String>,
}

impl MapLoader {
    fn new(entries: &[(&str, &str)]) -> Rc<Self> {
        Rc::new(Self {
            modules: entries
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        })
    }
}

#[async_trait(?Send)]
impl ModuleLoader for MapLoader {
    async fn fetch(&self, specifier: &ModuleSpecifier) -> anyhow::Result<String> {
        self.modules
            .get(specifier.as_str())
            .cloned()
            .ok_or_else(|| anyhow!("module not found: {specifier}"))
    }
}

fn loader_module(entries: &'static [(&'static str, &'static str)]) -> impl crate::CageModule {
    module_from_fn(move |ctx| ctx.set_module_loader(MapLoader::new(entries)))
}

#[tokio::test]
async fn test_static_import() {
    let loader = loader_module(&[("cage:///dep.js", "export const x = 7;")]);
    let result = run_with(
        r#"
        import { x } from "./dep.js";
        if (x !== 7) throw new Error("wrong import");
        "#,
        &[&loader],
    )
    .await;
    assert!(result.is_ok(), "{result:?}");
}

#[tokio::test]
async fn test_transitive_imports() {
    let loader = loader_module(&[
        (
            "cage:///a.js",
            "import { b } from './b.js'; export const a = b + 1;",
        ),
        ("cage:///b.js", "export const b = 41;"),
    ]);
    let result = run_with(
        r#"
        import { a } from "./a.js";
        if (a !== 42) throw new Error("wrong transitive import");
        "#,
        &[&loader],
    )
    .await;
    assert!(result.is_ok(), "{result:?}");
}

#[tokio::test]
async fn test_import_cycle_terminates() {
    let loader = loader_module(&[
        ("cage:///x.js", "import './y.js'; export const x = 1;"),
        ("cage:///y.js", "import './x.js'; export const y = 2;"),
    ]);
    let result = run_with(
        r#"
        import { x } from "./x.js";
        if (x !== 1) throw new Error("cycle broke imports");
        "#,
        &[&loader],
    )
    .await;
    assert!(result.is_ok(), "{result:?}");
}

#[tokio::test]
async fn test_dynamic_import() {
    let loader = loader_module(&[("cage:///dyn.js", "export const x = 7;")]);
    let result = run_with(
        r#"
        const m = await import("./dyn.js");
        if (m.x !== 7) throw new Error("wrong dynamic import");
        "#,
        &[&loader],
    )
    .await;
    assert!(result.is_ok(), "{result:?}");
}

#[tokio::test]
async fn test_dynamic_import_failure_rejects() {
    let loader = loader_module(&[]);
    let result = run_with(
        r#"
        let caught = null;
        try {
            await import("./missing.js");
        } catch (e) {
            caught = e;
        }
        if (caught === null) throw new Error("missing module did not reject");
        "#,
        &[&loader],
    )
    .await;
    assert!(result.is_ok(), "{result:?}");
}

#[tokio::test]
async fn test_import_without_loader_fails() {
    let result = run(r#"import { x } from "./dep.js";"#).await;
    let err = result.expect_err("import without a loader must fail");
    match err {
        CageError::Guest(e) => assert!(e.message.contains("no module loader"), "{e:?}"),
        other => panic!("unexpected error kind: {other:?}"),
    }
}
