use std::{
    mem,
    ops::{
        Deref,
        DerefMut,
    },
};

use anyhow::{
    anyhow,
    bail,
};
use async_recursion::async_recursion;
use deno_core::{
    v8,
    ModuleSpecifier,
};

use crate::{
    context_state::{
        ContextState,
        HostTask,
        PromiseId,
        RawFnCallback,
    },
    error::{
        guest_error_from_exception,
        GuestError,
    },
    handle::Handle,
    helpers,
    strings,
};

/// The in-context view of the engine: every operation that touches guest
/// values goes through here. One is constructed by the evaluation body for
/// the duration of a run, and transient ones are constructed inside engine
/// callbacks (see `CallbackContext`).
pub struct EnteredVm<'a, 'b> {
    scope: &'a mut v8::HandleScope<'b>,
    context: v8::Local<'b, v8::Context>,
}

impl<'a, 'b> Deref for EnteredVm<'a, 'b> {
    type Target = v8::HandleScope<'b>;

    fn deref(&self) -> &v8::HandleScope<'b> {
        self.scope
    }
}

impl<'a, 'b> DerefMut for EnteredVm<'a, 'b> {
    fn deref_mut(&mut self) -> &mut v8::HandleScope<'b> {
        self.scope
    }
}

impl<'a, 'b> EnteredVm<'a, 'b> {
    pub fn new(scope: &'a mut v8::HandleScope<'b>) -> Self {
        let context = scope.get_current_context();
        Self { scope, context }
    }

    pub(crate) fn state(&mut self) -> anyhow::Result<&ContextState> {
        self.context
            .get_slot::<ContextState>(self.scope)
            .ok_or_else(|| anyhow!("ContextState not found in context"))
    }

    pub(crate) fn state_mut(&mut self) -> anyhow::Result<&mut ContextState> {
        self.context
            .get_slot_mut::<ContextState>(self.scope)
            .ok_or_else(|| anyhow!("ContextState not found in context"))
    }

    /// Register `handle` with the evaluation's disposal scope and hand it
    /// back.
    pub fn manage(&mut self, handle: Handle) -> anyhow::Result<Handle> {
        self.state_mut()?.scope.manage(handle)
    }

    /// Close the evaluation scope, releasing every managed handle in LIFO
    /// order.
    pub(crate) fn close_scope(&mut self) -> anyhow::Result<()> {
        self.state_mut()?.scope.close();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Value constructors
    // ------------------------------------------------------------------

    pub fn undefined(&mut self) -> Handle {
        let value = v8::undefined(self.scope).into();
        Handle::new(self.scope, value)
    }

    pub fn null(&mut self) -> Handle {
        let value = v8::null(self.scope).into();
        Handle::new(self.scope, value)
    }

    pub fn boolean(&mut self, b: bool) -> Handle {
        let value = v8::Boolean::new(self.scope, b).into();
        Handle::new(self.scope, value)
    }

    pub fn new_string(&mut self, s: &str) -> anyhow::Result<Handle> {
        let value = v8::String::new(self.scope, s)
            .ok_or_else(|| anyhow!("Failed to create string"))?
            .into();
        Ok(Handle::new(self.scope, value))
    }

    pub fn new_number(&mut self, n: f64) -> Handle {
        let value = v8::Number::new(self.scope, n).into();
        Handle::new(self.scope, value)
    }

    pub fn new_array(&mut self) -> Handle {
        let value = v8::Array::new(self.scope, 0).into();
        Handle::new(self.scope, value)
    }

    pub fn new_object(&mut self) -> Handle {
        let value = v8::Object::new(self.scope).into();
        Handle::new(self.scope, value)
    }

    pub fn new_error(&mut self, err: &GuestError) -> anyhow::Result<Handle> {
        let local = self.new_error_local(err)?;
        Ok(Handle::new(self.scope, local))
    }

    pub(crate) fn new_error_local(
        &mut self,
        err: &GuestError,
    ) -> anyhow::Result<v8::Local<'b, v8::Value>> {
        let message = v8::String::new(self.scope, &err.message)
            .ok_or_else(|| anyhow!("Failed to create error message string"))?;
        let exception = match err.name.as_str() {
            "TypeError" => v8::Exception::type_error(self.scope, message),
            "RangeError" => v8::Exception::range_error(self.scope, message),
            "SyntaxError" => v8::Exception::syntax_error(self.scope, message),
            "Error" => v8::Exception::error(self.scope, message),
            name => {
                let exception = v8::Exception::error(self.scope, message);
                let obj = exception
                    .to_object(self.scope)
                    .ok_or_else(|| anyhow!("Error exception wasn't an object?"))?;
                let key = strings::name.create(self.scope)?;
                let name = v8::String::new(self.scope, name)
                    .ok_or_else(|| anyhow!("Failed to create error name string"))?;
                obj.set(self.scope, key.into(), name.into());
                exception
            },
        };
        Ok(exception)
    }

    /// Create a guest byte array backed by `bytes`.
    pub fn new_uint8_array(&mut self, bytes: Vec<u8>) -> anyhow::Result<Handle> {
        let len = bytes.len();
        let backing_store = v8::ArrayBuffer::new_backing_store_from_vec(bytes).make_shared();
        let array_buffer = v8::ArrayBuffer::with_backing_store(self.scope, &backing_store);
        let value = v8::Uint8Array::new(self.scope, array_buffer, 0, len)
            .ok_or_else(|| anyhow!("Failed to create Uint8Array"))?
            .into();
        Ok(Handle::new(self.scope, value))
    }

    /// Create a guest `ArrayBuffer` holding `bytes`.
    pub fn new_array_buffer(&mut self, bytes: Vec<u8>) -> Handle {
        let backing_store = v8::ArrayBuffer::new_backing_store_from_vec(bytes).make_shared();
        let value = v8::ArrayBuffer::with_backing_store(self.scope, &backing_store).into();
        Handle::new(self.scope, value)
    }

    /// Install a host callback as a guest function. The function's identity
    /// in the sandbox-function registry travels as its embedder data.
    pub fn new_function(&mut self, name: &str, callback: RawFnCallback) -> anyhow::Result<Handle> {
        let id = {
            let state = self.state_mut()?;
            state.sandbox_fns.push(Some(callback));
            state.sandbox_fns.len() - 1
        };
        let id_v8 = v8::Integer::new(self.scope, i32::try_from(id)?);
        let function = v8::Function::builder(crate::callback_context::sandbox_fn_callback)
            .data(id_v8.into())
            .build(self.scope)
            .ok_or_else(|| anyhow!("Failed to build sandbox function"))?;
        if let Some(name) = v8::String::new(self.scope, name) {
            function.set_name(name);
        }
        let handle = Handle::new(self.scope, function.into());
        self.manage(handle)
    }

    /// Create a guest promise under host control. Returns the promise handle
    /// (scope-managed) and the id used to settle it later.
    pub fn new_promise(&mut self) -> anyhow::Result<(Handle, PromiseId)> {
        let resolver = v8::PromiseResolver::new(self.scope)
            .ok_or_else(|| anyhow!("Failed to create PromiseResolver"))?;
        let promise = resolver.get_promise(self.scope);
        let resolver = v8::Global::new(self.scope, resolver);
        let promise_id = {
            let state = self.state_mut()?;
            let promise_id = state.next_promise_id;
            state.next_promise_id += 1;
            state.promise_resolvers.insert(promise_id, resolver);
            promise_id
        };
        let handle = Handle::new(self.scope, promise.into());
        Ok((self.manage(handle)?, promise_id))
    }

    /// Settle a host-controlled promise. A `Err` result rejects it with a
    /// guest error object carrying the name and message.
    pub fn settle_promise(
        &mut self,
        promise_id: PromiseId,
        result: Result<Handle, GuestError>,
    ) -> anyhow::Result<()> {
        let resolver = self.state_mut()?.take_promise(promise_id)?;
        let resolver = v8::Local::new(self.scope, resolver);
        match result {
            Ok(value) => {
                let value = value.open(self.scope)?;
                resolver.resolve(self.scope, value);
            },
            Err(err) => {
                let exception = self.new_error_local(&err)?;
                resolver.reject(self.scope, exception);
            },
        }
        Ok(())
    }

    pub(crate) fn settle_promise_resolver(
        &mut self,
        resolver: v8::Global<v8::PromiseResolver>,
        result: Result<v8::Local<'b, v8::Value>, GuestError>,
    ) -> anyhow::Result<()> {
        let resolver = v8::Local::new(self.scope, resolver);
        match result {
            Ok(value) => {
                resolver.resolve(self.scope, value);
            },
            Err(err) => {
                let exception = self.new_error_local(&err)?;
                resolver.reject(self.scope, exception);
            },
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Property operations
    // ------------------------------------------------------------------

    fn open_object(&mut self, handle: &Handle) -> anyhow::Result<v8::Local<'b, v8::Object>> {
        let local = handle.open(self.scope)?;
        v8::Local::<v8::Object>::try_from(local)
            .map_err(|_| anyhow!(GuestError::type_error("receiver is not an object")))
    }

    pub fn get_prop(&mut self, object: &Handle, key: &str) -> anyhow::Result<Handle> {
        let object = self.open_object(object)?;
        let value = helpers::get_property(self.scope, object, key)?
            .unwrap_or_else(|| v8::undefined(self.scope).into());
        Ok(Handle::new(self.scope, value))
    }

    pub fn get_index(&mut self, object: &Handle, index: u32) -> anyhow::Result<Handle> {
        let object = self.open_object(object)?;
        let value = object
            .get_index(self.scope, index)
            .unwrap_or_else(|| v8::undefined(self.scope).into());
        Ok(Handle::new(self.scope, value))
    }

    pub fn set_prop(&mut self, object: &Handle, key: &str, value: &Handle) -> anyhow::Result<()> {
        let object = self.open_object(object)?;
        let key = v8::String::new(self.scope, key)
            .ok_or_else(|| anyhow!("Failed to create property key"))?;
        let value = value.open(self.scope)?;
        object
            .set(self.scope, key.into(), value)
            .ok_or_else(|| anyhow!("Failed to set property"))?;
        Ok(())
    }

    pub fn set_index(&mut self, object: &Handle, index: u32, value: &Handle) -> anyhow::Result<()> {
        let object = self.open_object(object)?;
        let value = value.open(self.scope)?;
        object
            .set_index(self.scope, index, value)
            .ok_or_else(|| anyhow!("Failed to set indexed property"))?;
        Ok(())
    }

    /// Define a data property with explicit attributes.
    pub fn define_prop(
        &mut self,
        object: &Handle,
        key: &str,
        value: &Handle,
        attributes: PropertyAttributes,
    ) -> anyhow::Result<()> {
        let object = self.open_object(object)?;
        let key = v8::String::new(self.scope, key)
            .ok_or_else(|| anyhow!("Failed to create property key"))?;
        let value = value.open(self.scope)?;
        let mut attrs = v8::PropertyAttribute::NONE;
        if !attributes.writable {
            attrs = attrs | v8::PropertyAttribute::READ_ONLY;
        }
        if !attributes.enumerable {
            attrs = attrs | v8::PropertyAttribute::DONT_ENUM;
        }
        if !attributes.configurable {
            attrs = attrs | v8::PropertyAttribute::DONT_DELETE;
        }
        object
            .define_own_property(self.scope, key.into(), value, attrs)
            .ok_or_else(|| anyhow!("Failed to define property"))?;
        Ok(())
    }

    /// The context's global object.
    pub fn global(&mut self) -> Handle {
        let global = self.context.global(self.scope);
        Handle::new(self.scope, global.into())
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    /// `typeof` of a guest value, with `null` reported as its own type.
    pub fn type_of(&mut self, handle: &Handle) -> anyhow::Result<String> {
        let local = handle.open(self.scope)?;
        if local.is_null() {
            return Ok("null".to_string());
        }
        let type_string = local.type_of(self.scope);
        helpers::to_rust_string(self.scope, &type_string)
    }

    pub fn is_function(&mut self, handle: &Handle) -> anyhow::Result<bool> {
        Ok(handle.open(self.scope)?.is_function())
    }

    pub fn to_rust_string(&mut self, handle: &Handle) -> anyhow::Result<String> {
        let local = handle.open(self.scope)?;
        let s: v8::Local<v8::String> = local
            .try_into()
            .map_err(|_| anyhow!(GuestError::type_error("value is not a string")))?;
        helpers::to_rust_string(self.scope, &s)
    }

    /// Read the bytes of an `ArrayBuffer` or any view over one.
    pub fn read_bytes(&mut self, handle: &Handle) -> anyhow::Result<Vec<u8>> {
        let local = handle.open(self.scope)?;
        if let Ok(view) = v8::Local::<v8::ArrayBufferView>::try_from(local) {
            let mut buf = vec![0u8; view.byte_length()];
            let copied = view.copy_contents(&mut buf);
            buf.truncate(copied);
            return Ok(buf);
        }
        if let Ok(buffer) = v8::Local::<v8::ArrayBuffer>::try_from(local) {
            let backing_store = buffer.get_backing_store();
            let Some(data) = backing_store.data() else {
                return Ok(Vec::new());
            };
            let slice = unsafe {
                std::slice::from_raw_parts(data.as_ptr() as *const u8, backing_store.byte_length())
            };
            return Ok(slice.to_vec());
        }
        Err(anyhow!(GuestError::type_error(
            "expected an ArrayBuffer or an ArrayBuffer view"
        )))
    }

    /// Overwrite the contents of an `ArrayBuffer` view in place. `bytes` must
    /// match the view's length.
    pub fn write_bytes(&mut self, handle: &Handle, bytes: &[u8]) -> anyhow::Result<()> {
        self.write_bytes_impl(handle, bytes, true)
    }

    /// Write `bytes` into the leading bytes of an `ArrayBuffer` view that is
    /// at least as long.
    pub fn write_bytes_prefix(&mut self, handle: &Handle, bytes: &[u8]) -> anyhow::Result<()> {
        self.write_bytes_impl(handle, bytes, false)
    }

    fn write_bytes_impl(
        &mut self,
        handle: &Handle,
        bytes: &[u8],
        exact: bool,
    ) -> anyhow::Result<()> {
        let local = handle.open(self.scope)?;
        let view: v8::Local<v8::ArrayBufferView> = local.try_into().map_err(|_| {
            anyhow!(GuestError::type_error("expected an ArrayBuffer view"))
        })?;
        if exact {
            anyhow::ensure!(
                view.byte_length() == bytes.len(),
                "byte length mismatch writing into ArrayBuffer view"
            );
        } else {
            anyhow::ensure!(
                view.byte_length() >= bytes.len(),
                "ArrayBuffer view too small for write"
            );
        }
        let buffer = view
            .buffer(self.scope)
            .ok_or_else(|| anyhow!(GuestError::type_error("ArrayBuffer view is detached")))?;
        let backing_store = buffer.get_backing_store();
        let Some(data) = backing_store.data() else {
            anyhow::bail!(GuestError::type_error("ArrayBuffer has no backing store"));
        };
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                (data.as_ptr() as *mut u8).add(view.byte_offset()),
                bytes.len(),
            );
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------

    /// Run `f` under a catch guard, reporting any guest exception in-band.
    pub fn with_try_catch<R>(
        &mut self,
        f: impl FnOnce(&mut v8::HandleScope<'b>) -> R,
    ) -> anyhow::Result<Result<R, GuestError>> {
        let mut tc_scope = v8::TryCatch::new(&mut *self.scope);
        let r = f(&mut tc_scope);
        if let Some(e) = tc_scope.exception() {
            drop(tc_scope);
            return Ok(Err(guest_error_from_exception(self.scope, e)?));
        }
        Ok(Ok(r))
    }

    /// Call a guest function. Guest exceptions come back in-band.
    pub fn call_function(
        &mut self,
        function: &Handle,
        this: Option<&Handle>,
        args: &[Handle],
    ) -> anyhow::Result<Result<Handle, GuestError>> {
        let function: v8::Local<v8::Function> = function
            .open(self.scope)?
            .try_into()
            .map_err(|_| anyhow!(GuestError::type_error("value is not a function")))?;
        let recv = match this {
            Some(h) => h.open(self.scope)?,
            None => v8::undefined(self.scope).into(),
        };
        let mut argv = Vec::with_capacity(args.len());
        for arg in args {
            argv.push(arg.open(self.scope)?);
        }
        let result = self.with_try_catch(|s| function.call(s, recv, &argv))?;
        match result {
            Ok(Some(value)) => Ok(Ok(Handle::new(self.scope, value))),
            Ok(None) => Err(anyhow!("Function call returned no value and no exception")),
            Err(e) => Ok(Err(e)),
        }
    }

    /// Drain the guest job queue to quiescence. Reports the first microtask
    /// exception or unhandled promise rejection in-band.
    pub fn drain_microtasks(&mut self) -> anyhow::Result<Result<(), GuestError>> {
        let r = self.with_try_catch(|s| s.perform_microtask_checkpoint())?;
        if let Err(e) = r {
            return Ok(Err(e));
        }
        // A rejection that made it all the way through the drain without
        // anyone attaching a handler is unhandled for good; fail the job
        // queue with the first one.
        let rejection = {
            let state = self.state_mut()?;
            let rejection = state.unhandled_promise_rejections.drain().next();
            state.unhandled_promise_rejections.clear();
            rejection
        };
        if let Some((_promise, error_global)) = rejection {
            let error = v8::Local::new(self.scope, error_global);
            return Ok(Err(guest_error_from_exception(self.scope, error)?));
        }
        Ok(Ok(()))
    }

    pub fn promise_state(&mut self, promise: &Handle) -> anyhow::Result<v8::PromiseState> {
        let promise: v8::Local<v8::Promise> = promise
            .open(self.scope)?
            .try_into()
            .map_err(|_| anyhow!("value is not a promise"))?;
        Ok(promise.state())
    }

    pub fn promise_rejection(&mut self, promise: &Handle) -> anyhow::Result<GuestError> {
        let promise: v8::Local<v8::Promise> = promise
            .open(self.scope)?
            .try_into()
            .map_err(|_| anyhow!("value is not a promise"))?;
        anyhow::ensure!(promise.state() == v8::PromiseState::Rejected);
        let exception = promise.result(self.scope);
        guest_error_from_exception(self.scope, exception)
    }

    /// Evaluate source text in script mode. Errors come back in-band.
    pub fn eval_script(&mut self, source: &str) -> anyhow::Result<Result<Handle, GuestError>> {
        let name = v8::String::new(self.scope, "cage:///script.js")
            .ok_or_else(|| anyhow!("Failed to create script name"))?;
        let source = v8::String::new(self.scope, source)
            .ok_or_else(|| anyhow!("Failed to create source string"))?;
        let origin = helpers::module_origin(self.scope, name, false);
        let script = match self.with_try_catch(|s| v8::Script::compile(s, source, Some(&origin)))? {
            Ok(Some(script)) => script,
            Ok(None) => bail!("Unexpected script compilation failure"),
            Err(e) => return Ok(Err(e)),
        };
        match self.with_try_catch(|s| script.run(s))? {
            Ok(Some(value)) => Ok(Ok(Handle::new(self.scope, value))),
            Ok(None) => bail!("Missing result from successful script run"),
            Err(e) => Ok(Err(e)),
        }
    }

    // ------------------------------------------------------------------
    // Module loading
    // ------------------------------------------------------------------

    /// Compile and register `source` under `url`, then recursively load every
    /// import it names through the context's module loader. Compilation and
    /// resolution failures come back in-band.
    #[async_recursion(?Send)]
    pub(crate) async fn register_module(
        &mut self,
        url: &ModuleSpecifier,
        source: String,
    ) -> anyhow::Result<Result<(), GuestError>> {
        if self.state()?.module_map.contains_module(url) {
            return Ok(Ok(()));
        }
        let import_specifiers = {
            let name_str = v8::String::new(self.scope, url.as_str())
                .ok_or_else(|| anyhow!("Failed to create name string"))?;
            let source_str = v8::String::new(self.scope, &source)
                .ok_or_else(|| anyhow!("Failed to create source string"))?;
            let origin = helpers::module_origin(self.scope, name_str, true);
            let v8_source = v8::script_compiler::Source::new(source_str, Some(&origin));

            let module =
                match self.with_try_catch(|s| v8::script_compiler::compile_module(s, v8_source))? {
                    Ok(Some(module)) => module,
                    Ok(None) => bail!("Unexpected module compilation failure"),
                    Err(e) => return Ok(Err(e)),
                };
            anyhow::ensure!(module.get_status() == v8::ModuleStatus::Uninstantiated);

            let mut import_specifiers = Vec::new();
            let module_requests = module.get_module_requests();
            for i in 0..module_requests.length() {
                let module_request: v8::Local<v8::ModuleRequest> = module_requests
                    .get(self.scope, i)
                    .ok_or_else(|| anyhow!("Module request {} out of bounds", i))?
                    .try_into()?;
                let import_specifier =
                    helpers::to_rust_string(self.scope, &module_request.get_specifier())?;
                match self.resolve_specifier(&import_specifier, url) {
                    Ok(specifier) => import_specifiers.push(specifier),
                    Err(e) => {
                        return Ok(Err(GuestError::type_error(e.to_string())));
                    },
                }
            }

            let module = v8::Global::new(self.scope, module);
            let state = self.state_mut()?;
            import_specifiers.retain(|s| !state.module_map.contains_module(s));
            state.module_map.register(url.clone(), module)?;
            import_specifiers
        };

        for specifier in import_specifiers {
            match self.load_module(&specifier).await? {
                Ok(()) => (),
                Err(e) => return Ok(Err(e)),
            }
        }
        Ok(Ok(()))
    }

    /// Resolve an import specifier against its referrer, through the
    /// installed module loader when one is present so hosts can customize
    /// resolution (bare specifiers, package maps). Without a loader the
    /// default URL semantics apply.
    pub(crate) fn resolve_specifier(
        &mut self,
        specifier: &str,
        referrer: &ModuleSpecifier,
    ) -> anyhow::Result<ModuleSpecifier> {
        match self.state()?.loader.clone() {
            Some(loader) => loader.resolve(specifier, referrer),
            None => Ok(deno_core::resolve_import(specifier, referrer.as_str())?),
        }
    }

    /// Fetch a module's source through the loader and register it.
    pub(crate) async fn load_module(
        &mut self,
        specifier: &ModuleSpecifier,
    ) -> anyhow::Result<Result<(), GuestError>> {
        if self.state()?.module_map.contains_module(specifier) {
            return Ok(Ok(()));
        }
        let Some(loader) = self.state()?.loader.clone() else {
            return Ok(Err(GuestError::type_error(format!(
                "Cannot load module {specifier}: no module loader is installed"
            ))));
        };
        let source = match loader.fetch(specifier).await {
            Ok(source) => source,
            Err(e) => {
                return Ok(Err(GuestError::type_error(format!(
                    "Failed to load module {specifier}: {e}"
                ))));
            },
        };
        self.register_module(specifier, source).await
    }

    /// Instantiate and evaluate a registered module, returning the evaluation
    /// promise. For modules without top-level awaits the promise is settled
    /// by the time this returns.
    pub(crate) fn instantiate_and_evaluate(
        &mut self,
        url: &ModuleSpecifier,
    ) -> anyhow::Result<Result<Handle, GuestError>> {
        let module_global = self
            .state()?
            .module_map
            .lookup_module(url)
            .ok_or_else(|| anyhow!("Module {url} not registered"))?
            .clone();
        let module = v8::Local::new(self.scope, module_global);

        if module.get_status() == v8::ModuleStatus::Uninstantiated {
            let instantiation_result = match self.with_try_catch(|s| {
                module.instantiate_module(s, crate::callback_context::resolve_module_callback)
            })? {
                Ok(r) => r,
                Err(e) => return Ok(Err(e)),
            };
            if matches!(instantiation_result, Some(false) | None) {
                bail!("Unexpected instantiate result: {instantiation_result:?}");
            }
        }

        let evaluation_result = match self.with_try_catch(|s| module.evaluate(s))? {
            Ok(r) => r.ok_or_else(|| anyhow!("Missing result from module evaluation"))?,
            Err(e) => return Ok(Err(e)),
        };

        let status = module.get_status();
        anyhow::ensure!(
            status == v8::ModuleStatus::Evaluated || status == v8::ModuleStatus::Errored
        );
        let promise = v8::Local::<v8::Promise>::try_from(evaluation_result)
            .map_err(|e| anyhow!("Module evaluation did not return a promise: {:?}", e))?;
        // The evaluation promise is observed through its state, not through a
        // guest handler; keep its rejection out of the unhandled set.
        let promise_global = v8::Global::new(self.scope, promise);
        let state = self.state_mut()?;
        state
            .unhandled_promise_rejections
            .remove(&promise_global);
        state
            .module_evaluation_promises
            .insert(promise_global);
        let handle = Handle::new(self.scope, promise.into());
        Ok(Ok(self.manage(handle)?))
    }

    /// The namespace object of an evaluated module.
    pub(crate) fn module_namespace(&mut self, url: &ModuleSpecifier) -> anyhow::Result<Handle> {
        let module_global = self
            .state()?
            .module_map
            .lookup_module(url)
            .ok_or_else(|| anyhow!("Module {url} not registered"))?
            .clone();
        let module = v8::Local::new(self.scope, module_global);
        let namespace = module.get_module_namespace();
        Ok(Handle::new(self.scope, namespace))
    }

    /// Service one dynamic `import()`: load, evaluate, and settle the
    /// import's promise with the module namespace. Failures reject the
    /// promise; they never fail the evaluation.
    pub(crate) async fn service_dynamic_import(
        &mut self,
        specifier: ModuleSpecifier,
        resolver: v8::Global<v8::PromiseResolver>,
    ) -> anyhow::Result<()> {
        let outcome = self.dynamic_import_outcome(&specifier).await?;
        match outcome {
            Ok(namespace) => {
                let value = namespace.open(self.scope)?;
                self.settle_promise_resolver(resolver, Ok(value))?;
            },
            Err(e) => {
                self.settle_promise_resolver(resolver, Err(e))?;
            },
        }
        Ok(())
    }

    async fn dynamic_import_outcome(
        &mut self,
        specifier: &ModuleSpecifier,
    ) -> anyhow::Result<Result<Handle, GuestError>> {
        match self.load_module(specifier).await? {
            Ok(()) => (),
            Err(e) => return Ok(Err(e)),
        }
        let eval_promise = match self.instantiate_and_evaluate(specifier)? {
            Ok(p) => p,
            Err(e) => return Ok(Err(e)),
        };
        match self.promise_state(&eval_promise)? {
            v8::PromiseState::Fulfilled => Ok(Ok(self.module_namespace(specifier)?)),
            v8::PromiseState::Rejected => Ok(Err(self.promise_rejection(&eval_promise)?)),
            v8::PromiseState::Pending => Ok(Err(GuestError::type_error(format!(
                "Top-level await in dynamically imported module {specifier} is unsupported"
            )))),
        }
    }

    // ------------------------------------------------------------------
    // Host tasks
    // ------------------------------------------------------------------

    /// Queue host-side asynchronous work. The pump loop owns these futures
    /// and delivers each completion's re-entry closure back into the guest.
    pub fn push_host_task(&mut self, task: HostTask) -> anyhow::Result<()> {
        self.state_mut()?.pending_tasks.push(task);
        Ok(())
    }

    pub(crate) fn take_pending_tasks(&mut self) -> anyhow::Result<Vec<HostTask>> {
        Ok(mem::take(&mut self.state_mut()?.pending_tasks))
    }

    pub(crate) fn take_pending_dynamic_imports(
        &mut self,
    ) -> anyhow::Result<Vec<(ModuleSpecifier, v8::Global<v8::PromiseResolver>)>> {
        Ok(mem::take(&mut self.state_mut()?.pending_dynamic_imports))
    }
}

/// Attribute set for `define_prop`. Defaults match a plain assignment:
/// writable, enumerable, configurable.
#[derive(Clone, Copy, Debug)]
pub struct PropertyAttributes {
    pub writable: bool,
    pub enumerable: bool,
    pub configurable: bool,
}

impl Default for PropertyAttributes {
    fn default() -> Self {
        Self {
            writable: true,
            enumerable: true,
            configurable: true,
        }
    }
}

impl PropertyAttributes {
    pub const READ_ONLY: PropertyAttributes = PropertyAttributes {
        writable: false,
        enumerable: true,
        configurable: false,
    };
}
