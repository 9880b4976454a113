use anyhow::anyhow;
use deno_core::{
    v8,
    ModuleSpecifier,
};
use futures::{
    stream::FuturesUnordered,
    StreamExt,
};

use crate::{
    context_state::{
        AfterScriptHook,
        ContextState,
        HostTask,
    },
    entered_context::EnteredVm,
    error::{
        CageError,
        EvalResult,
        MarshalError,
    },
    isolate::{
        Isolate,
        MAIN_MODULE_URL,
    },
    module::{
        CageModule,
        ModuleContext,
    },
};

/// Engine-level configuration for a cage. Everything defaults off; the
/// sandbox imposes no limits the caller didn't ask for.
#[derive(Clone, Debug, Default)]
pub struct CageOptions {
    pub max_heap_size_bytes: Option<usize>,
}

/// An embeddable sandbox. Each [`Cage::run_code`] call evaluates one script
/// in a fresh runtime and context; cages share no mutable state, and a host
/// may hold any number of them.
///
/// Evaluation pipeline: runtime and context creation, module registration
/// (caller order), module-mode evaluation of the source, a drain of the
/// guest job queue, after-script hooks (module order, then registration
/// order), the pump loop interleaving host task completions with job
/// drains, a final drain, and scope teardown. Every failure path runs the
/// same teardown and lands in [`EvalResult::Err`]; `run_code` does not
/// throw.
pub struct Cage {
    options: CageOptions,
}

impl Cage {
    pub fn new() -> Self {
        Self::with_options(CageOptions::default())
    }

    pub fn with_options(options: CageOptions) -> Self {
        Self { options }
    }

    /// Evaluate `source` as an ES module with the given capability modules
    /// installed.
    ///
    /// The returned future is not `Send`: the guest runtime is bound to the
    /// thread that polls it. Dropping the future cancels the evaluation and
    /// tears down the runtime.
    pub async fn run_code(&self, source: &str, modules: &[&dyn CageModule]) -> EvalResult {
        match self.run_code_inner(source, modules).await {
            Ok(()) => EvalResult::Ok,
            Err(e) => EvalResult::Err(CageError::classify(e)),
        }
    }

    async fn run_code_inner(
        &self,
        source: &str,
        modules: &[&dyn CageModule],
    ) -> anyhow::Result<()> {
        let mut isolate = Isolate::new(&self.options);
        let mut handle_scope = isolate.handle_scope();
        let context = v8::Context::new(&mut handle_scope);
        let mut context_scope = v8::ContextScope::new(&mut handle_scope, context);
        ContextState::install(&mut context_scope, context);
        let mut vm = EnteredVm::new(&mut context_scope);

        // Module registration, in caller order. A failing `def` aborts the
        // evaluation before any guest code runs.
        let mut all_hooks: Vec<Vec<AfterScriptHook>> = Vec::with_capacity(modules.len());
        for module in modules {
            let mut hooks = Vec::new();
            {
                let mut module_ctx = ModuleContext::new(&mut vm, &mut hooks);
                module.def(&mut module_ctx).map_err(module_registration_error)?;
            }
            all_hooks.push(hooks);
        }

        // Evaluate the user source in module mode. Compile and runtime
        // failures come back in-band as guest errors.
        let main_url = ModuleSpecifier::parse(MAIN_MODULE_URL)?;
        match vm.register_module(&main_url, source.to_string()).await? {
            Ok(()) => (),
            Err(e) => return Err(anyhow!(CageError::Guest(e))),
        }
        let eval_promise = match vm.instantiate_and_evaluate(&main_url)? {
            Ok(promise) => promise,
            Err(e) => return Err(anyhow!(CageError::Guest(e))),
        };

        // First drain of the guest job queue.
        if let Err(e) = vm.drain_microtasks()? {
            return Err(anyhow!(CageError::JobQueue(e)));
        }
        if vm.promise_state(&eval_promise)? == v8::PromiseState::Rejected {
            let e = vm.promise_rejection(&eval_promise)?;
            return Err(anyhow!(CageError::Guest(e)));
        }

        // After-script hooks fire only once the initial evaluation and drain
        // have succeeded.
        for hooks in all_hooks {
            for hook in hooks {
                hook(&mut vm).map_err(hook_error)?;
            }
        }
        if let Err(e) = vm.drain_microtasks()? {
            return Err(anyhow!(CageError::JobQueue(e)));
        }

        // Await host work: keep-alives, capability tasks, dynamic imports.
        Self::pump(&mut vm).await?;

        // The evaluation promise must have settled by now; a still-pending
        // top-level await has nothing left that could resolve it.
        match vm.promise_state(&eval_promise)? {
            v8::PromiseState::Fulfilled => (),
            v8::PromiseState::Rejected => {
                let e = vm.promise_rejection(&eval_promise)?;
                return Err(anyhow!(CageError::Guest(e)));
            },
            v8::PromiseState::Pending => {
                let e = crate::error::GuestError::error(
                    "module evaluation did not complete: a top-level await never resolved",
                );
                return Err(anyhow!(CageError::Guest(e)));
            },
        }

        vm.close_scope()?;
        Ok(())
    }

    /// The pump loop. Host tasks run on the host reactor while the guest
    /// sits idle; each completion re-enters the guest, and the job queue is
    /// drained to quiescence before the next suspension. The loop yields to
    /// the reactor once per iteration so host I/O keeps progressing, and
    /// ends only when no tasks, keep-alives, or dynamic imports remain.
    async fn pump(vm: &mut EnteredVm<'_, '_>) -> anyhow::Result<()> {
        let mut in_flight: FuturesUnordered<HostTask> = FuturesUnordered::new();
        loop {
            // Drain first: whatever ran last (a completion, an import, the
            // after-script hooks) may have queued jobs, tasks, or imports.
            if let Err(e) = vm.drain_microtasks()? {
                return Err(anyhow!(CageError::JobQueue(e)));
            }
            for task in vm.take_pending_tasks()? {
                in_flight.push(task);
            }

            let imports = vm.take_pending_dynamic_imports()?;
            if !imports.is_empty() {
                for (specifier, resolver) in imports {
                    vm.service_dynamic_import(specifier, resolver).await?;
                }
                // Servicing an import can queue more imports or tasks.
                continue;
            }

            if in_flight.is_empty() {
                // The drain above left nothing behind: the queue is quiescent
                // and no host work remains.
                break;
            }
            let completion = in_flight
                .next()
                .await
                .expect("nonempty task stream returned None");
            tokio::task::yield_now().await;
            if let Some(reentry) = completion {
                reentry(vm)?;
            }
        }
        Ok(())
    }
}

fn module_registration_error(e: anyhow::Error) -> anyhow::Error {
    match e.downcast::<MarshalError>() {
        Ok(me) => anyhow!(CageError::Marshal(me)),
        Err(e) => anyhow!(CageError::ModuleRegistration(e)),
    }
}

fn hook_error(e: anyhow::Error) -> anyhow::Error {
    match e.downcast::<MarshalError>() {
        Ok(me) => anyhow!(CageError::Marshal(me)),
        Err(e) => anyhow!(CageError::Hook(e)),
    }
}
