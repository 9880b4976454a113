use deno_core::v8;

use crate::{
    cage::{
        Cage,
        CageOptions,
    },
    context_state::ContextState,
    entered_context::EnteredVm,
    error::EvalResult,
    isolate::Isolate,
    module::CageModule,
    modules::{
        ConsoleModule,
        LogCapture,
    },
};

pub async fn run(source: &str) -> EvalResult {
    Cage::new().run_code(source, &[]).await
}

pub async fn run_with(source: &str, modules: &[&dyn CageModule]) -> EvalResult {
    Cage::new().run_code(source, modules).await
}

/// Run with a capturing console installed as the only module.
pub async fn run_with_console(source: &str) -> (EvalResult, LogCapture) {
    let (console, capture) = ConsoleModule::capturing();
    let result = Cage::new().run_code(source, &[&console]).await;
    (result, capture)
}

/// Engine-level harness: a fresh context entered for the duration of `f`,
/// with the evaluation scope closed afterwards.
pub fn with_vm<R>(f: impl FnOnce(&mut EnteredVm<'_, '_>) -> anyhow::Result<R>) -> anyhow::Result<R> {
    let options = CageOptions::default();
    let mut isolate = Isolate::new(&options);
    let mut handle_scope = isolate.handle_scope();
    let context = v8::Context::new(&mut handle_scope);
    let mut context_scope = v8::ContextScope::new(&mut handle_scope, context);
    ContextState::install(&mut context_scope, context);
    let mut vm = EnteredVm::new(&mut context_scope);
    let result = f(&mut vm);
    vm.close_scope()?;
    result
}
