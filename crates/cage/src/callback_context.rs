use anyhow::anyhow;
use deno_core::v8;

use crate::{
    entered_context::EnteredVm,
    error::guest_error_from_host_failure,
    handle::Handle,
    helpers,
    strings,
};

/// Entry points V8 calls back into while guest code runs. Each grabs the
/// current context and dispatches through the context state.
pub struct CallbackContext;

impl CallbackContext {
    /// See `ContextState::unhandled_promise_rejections`: a rejection without a
    /// handler is recorded here, and forgiven again if the guest attaches a
    /// handler before the next drain. Promises and async functions run
    /// synchronously until their first suspend point, so a `.catch()`
    /// attached right after a call can arrive after the rejection; failing
    /// immediately would flag well-formed programs.
    pub extern "C" fn promise_reject_callback(message: v8::PromiseRejectMessage) {
        let scope = &mut unsafe { v8::CallbackScope::new(&message) };
        let mut vm = EnteredVm::new(scope);
        if let Err(e) = Self::push_promise_rejection(&mut vm, message) {
            tracing::error!("Error in promise_reject_callback: {e:?}");
        }
    }

    fn push_promise_rejection(
        vm: &mut EnteredVm,
        message: v8::PromiseRejectMessage,
    ) -> anyhow::Result<()> {
        match message.get_event() {
            v8::PromiseRejectEvent::PromiseRejectWithNoHandler => {
                let Some(e) = message.get_value() else {
                    tracing::warn!("Message missing from call to promise_reject_callback");
                    return Ok(());
                };
                let error_global = v8::Global::new(&mut *vm, e);
                let promise_global = v8::Global::new(&mut *vm, message.get_promise());
                let state = vm.state_mut()?;
                if state.module_evaluation_promises.contains(&promise_global) {
                    // Module evaluation promises report through their state.
                    return Ok(());
                }
                state
                    .unhandled_promise_rejections
                    .insert(promise_global, error_global);
            },
            v8::PromiseRejectEvent::PromiseHandlerAddedAfterReject => {
                let promise_global = v8::Global::new(&mut *vm, message.get_promise());
                vm.state_mut()?
                    .unhandled_promise_rejections
                    .remove(&promise_global);
            },
            v8::PromiseRejectEvent::PromiseRejectAfterResolved => {
                tracing::warn!("Promise rejected after resolved");
            },
            v8::PromiseRejectEvent::PromiseResolveAfterResolved => {
                tracing::warn!("Promise resolved after resolved");
            },
        }
        Ok(())
    }

    pub extern "C" fn import_meta_callback(
        context: v8::Local<v8::Context>,
        _module: v8::Local<v8::Module>,
        _meta: v8::Local<v8::Object>,
    ) {
        let scope = &mut unsafe { v8::CallbackScope::new(context) };
        let message = strings::import_meta_unsupported
            .create(scope)
            .expect("Failed to create exception string");
        let exception = v8::Exception::type_error(scope, message);
        scope.throw_exception(exception);
    }

    /// Dynamic `import()` parks the resolved specifier and a promise resolver
    /// on the context state; the pump loop loads the module and settles the
    /// promise between job drains.
    pub fn dynamic_import_callback<'s>(
        scope: &mut v8::HandleScope<'s>,
        _host_defined_options: v8::Local<'s, v8::Data>,
        resource_name: v8::Local<'s, v8::Value>,
        specifier: v8::Local<'s, v8::String>,
        _import_assertions: v8::Local<'s, v8::FixedArray>,
    ) -> Option<v8::Local<'s, v8::Promise>> {
        let r: anyhow::Result<_> = (|| {
            let promise_resolver = v8::PromiseResolver::new(scope)
                .ok_or_else(|| anyhow!("Failed to create PromiseResolver"))?;
            let promise = promise_resolver.get_promise(scope);
            let promise_resolver = v8::Global::new(scope, promise_resolver);

            let resource_name: v8::Local<v8::String> = resource_name.try_into()?;
            let referrer_name = helpers::to_rust_string(scope, &resource_name)?;
            let referrer = deno_core::ModuleSpecifier::parse(&referrer_name)?;
            let specifier_str = helpers::to_rust_string(scope, &specifier)?;

            let mut vm = EnteredVm::new(scope);
            let resolved_specifier = vm.resolve_specifier(&specifier_str, &referrer)?;
            vm.state_mut()?
                .pending_dynamic_imports
                .push((resolved_specifier, promise_resolver));
            Ok(promise)
        })();
        match r {
            Ok(promise) => Some(promise),
            Err(e) => {
                helpers::throw_type_error(scope, e.to_string());
                None
            },
        }
    }

    /// Static-import resolution against the module map. Everything a module
    /// names has been registered before instantiation, so a miss here is a
    /// host bug rather than a guest one.
    pub fn resolve_module_impl<'s>(
        scope: &mut v8::HandleScope<'s>,
        referrer: v8::Local<'s, v8::Module>,
        specifier: v8::Local<'s, v8::String>,
    ) -> anyhow::Result<v8::Local<'s, v8::Module>> {
        let referrer_global = v8::Global::new(scope, referrer);
        let specifier_str = helpers::to_rust_string(scope, &specifier)?;
        let mut vm = EnteredVm::new(scope);
        let referrer_specifier = vm
            .state()?
            .module_map
            .lookup_by_v8_module(&referrer_global)
            .ok_or_else(|| anyhow!("Couldn't find referring module"))?
            .clone();
        let resolved_specifier = vm.resolve_specifier(&specifier_str, &referrer_specifier)?;
        let module = vm
            .state()?
            .module_map
            .lookup_module(&resolved_specifier)
            .ok_or_else(|| anyhow!("Couldn't find {resolved_specifier}"))?
            .clone();
        Ok(v8::Local::new(&mut *vm, module))
    }
}

pub fn resolve_module_callback<'c>(
    context: v8::Local<'c, v8::Context>,
    specifier: v8::Local<'c, v8::String>,
    _import_assertions: v8::Local<'c, v8::FixedArray>,
    referrer: v8::Local<'c, v8::Module>,
) -> Option<v8::Local<'c, v8::Module>> {
    let scope = &mut unsafe { v8::CallbackScope::new(context) };
    match CallbackContext::resolve_module_impl(scope, referrer, specifier) {
        Ok(m) => Some(m),
        Err(e) => {
            helpers::throw_type_error(scope, format!("{e:?}"));
            None
        },
    }
}

/// The single trampoline behind every sandbox function. The function's
/// registry id rides on its embedder data; the registered callback is taken
/// out of the registry for the duration of the call, so reentrant calls to
/// the same function fail cleanly instead of aliasing the closure.
pub fn sandbox_fn_callback(
    scope: &mut v8::HandleScope,
    args: v8::FunctionCallbackArguments,
    mut rv: v8::ReturnValue,
) {
    let mut vm = EnteredVm::new(scope);
    match run_sandbox_fn(&mut vm, &args) {
        Ok(value) => {
            match value.open(&mut vm) {
                Ok(local) => rv.set(local),
                Err(e) => {
                    helpers::throw_guest_error(&mut vm, &guest_error_from_host_failure(&e))
                },
            };
        },
        Err(e) => {
            let guest_error = guest_error_from_host_failure(&e);
            helpers::throw_guest_error(&mut vm, &guest_error);
        },
    }
}

fn run_sandbox_fn(
    vm: &mut EnteredVm<'_, '_>,
    args: &v8::FunctionCallbackArguments,
) -> anyhow::Result<Handle> {
    let id = args
        .data()
        .int32_value(vm)
        .ok_or_else(|| anyhow!("Sandbox function data was not an integer"))? as usize;

    let this = Handle::new(vm, args.this().into());
    let mut argv = Vec::with_capacity(args.length() as usize);
    for i in 0..args.length() {
        argv.push(Handle::new(vm, args.get(i)));
    }

    let mut callback = {
        let state = vm.state_mut()?;
        let slot = state
            .sandbox_fns
            .get_mut(id)
            .ok_or_else(|| anyhow!("Unknown sandbox function id {id}"))?;
        slot.take()
            .ok_or_else(|| anyhow!("Reentrant call into a sandbox function"))?
    };
    let result = callback(vm, this, &argv);
    // Put the callback back even when the call failed; the guest may catch
    // the exception and call again.
    let state = vm.state_mut()?;
    if let Some(slot) = state.sandbox_fns.get_mut(id) {
        *slot = Some(callback);
    }
    result
}
