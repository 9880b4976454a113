use std::{
    cell::RefCell,
    collections::HashMap,
    rc::Rc,
};

use anyhow::anyhow;
use futures::FutureExt;

use crate::{
    context_state::{
        AfterScriptHook,
        GuestReentry,
        RawFnCallback,
    },
    entered_context::EnteredVm,
    error::guest_error_from_host_failure,
    handle::Handle,
    loader::ModuleLoader,
    strings,
    value::GuestValue,
};

/// A capability module: a registration routine that installs guest-visible
/// bindings for one evaluation. Modules are reusable across evaluations;
/// anything per-evaluation lives in state created inside `def`.
///
/// `def` is synchronous registration: guest-visible installs only, no I/O.
pub trait CageModule {
    fn def(&self, ctx: &mut ModuleContext<'_, '_, '_>) -> anyhow::Result<()>;
}

/// Wrap a plain closure as a reusable [`CageModule`].
pub fn module_from_fn<F>(f: F) -> FnModule<F>
where
    F: Fn(&mut ModuleContext<'_, '_, '_>) -> anyhow::Result<()>,
{
    FnModule { f }
}

pub struct FnModule<F> {
    f: F,
}

impl<F> CageModule for FnModule<F>
where
    F: Fn(&mut ModuleContext<'_, '_, '_>) -> anyhow::Result<()>,
{
    fn def(&self, ctx: &mut ModuleContext<'_, '_, '_>) -> anyhow::Result<()> {
        (self.f)(ctx)
    }
}

/// A tree of guest-bound values for [`ModuleContext::define_sandbox_object`]:
/// already-built handles are used verbatim, object nodes are recursed.
pub enum SandboxValue {
    Handle(Handle),
    Object(Vec<(String, SandboxValue)>),
}

/// The per-evaluation, per-module view handed to `CageModule::def`. Owns this
/// module's after-script hooks; shares the evaluation's context, scope, and
/// task queue through the [`EnteredVm`].
pub struct ModuleContext<'m, 'a, 'b> {
    vm: &'m mut EnteredVm<'a, 'b>,
    hooks: &'m mut Vec<AfterScriptHook>,
}

impl<'m, 'a, 'b> ModuleContext<'m, 'a, 'b> {
    pub(crate) fn new(vm: &'m mut EnteredVm<'a, 'b>, hooks: &'m mut Vec<AfterScriptHook>) -> Self {
        Self { vm, hooks }
    }

    /// Direct access to the engine operations, for modules that need more
    /// than the helpers below.
    pub fn vm(&mut self) -> &mut EnteredVm<'a, 'b> {
        self.vm
    }

    /// Create a guest function backed by a raw handle-in/handle-out host
    /// callback. The handle is managed by the evaluation scope.
    pub fn sandbox_fn_raw(&mut self, name: &str, callback: RawFnCallback) -> anyhow::Result<Handle> {
        self.vm.new_function(name, callback)
    }

    /// Create and install a raw sandbox function on the guest global.
    pub fn define_sandbox_fn_raw(
        &mut self,
        name: &str,
        callback: RawFnCallback,
    ) -> anyhow::Result<()> {
        let function = self.sandbox_fn_raw(name, callback)?;
        let global = self.vm.global();
        self.vm.set_prop(&global, name, &function)
    }

    /// Create a guest function from a host-typed callback: arguments are
    /// dumped to [`GuestValue`]s and the result is marshalled back. A host
    /// error becomes a guest exception carrying its name and message; it
    /// never crosses the boundary uncaught.
    pub fn sandbox_fn(
        &mut self,
        name: &str,
        mut f: impl FnMut(&[GuestValue]) -> anyhow::Result<GuestValue> + 'static,
    ) -> anyhow::Result<Handle> {
        let callback: RawFnCallback = Box::new(move |vm, _this, args| {
            let mut dumped = Vec::with_capacity(args.len());
            for arg in args {
                dumped.push(vm.dump(arg)?);
            }
            let result = f(&dumped).map_err(|e| anyhow!(guest_error_from_host_failure(&e)))?;
            vm.to_guest(&result)
        });
        self.sandbox_fn_raw(name, callback)
    }

    /// Create and install a marshalled sandbox function on the guest global.
    pub fn define_sandbox_fn(
        &mut self,
        name: &str,
        f: impl FnMut(&[GuestValue]) -> anyhow::Result<GuestValue> + 'static,
    ) -> anyhow::Result<()> {
        let function = self.sandbox_fn(name, f)?;
        let global = self.vm.global();
        self.vm.set_prop(&global, name, &function)
    }

    /// Build a (possibly nested) object from `shape` and install it on the
    /// guest global under `name`.
    pub fn define_sandbox_object(&mut self, name: &str, shape: SandboxValue) -> anyhow::Result<()> {
        let object = build_sandbox_value(self.vm, shape)?;
        let global = self.vm.global();
        self.vm.set_prop(&global, name, &object)
    }

    /// Queue a hook to run after the script has evaluated and its job queue
    /// has drained. Hooks run in (module order, registration order).
    pub fn after_script(
        &mut self,
        hook: impl for<'x, 'y> FnOnce(&mut EnteredVm<'x, 'y>) -> anyhow::Result<()> + 'static,
    ) {
        self.hooks.push(Box::new(hook));
    }

    /// Register a host future the evaluation must await before returning.
    /// Modules doing asynchronous host work gate script completion this way.
    pub fn keep_alive(
        &mut self,
        future: impl std::future::Future<Output = ()> + 'static,
    ) -> anyhow::Result<()> {
        let task = future
            .map(|()| None::<GuestReentry>)
            .boxed_local();
        self.vm.push_host_task(task)
    }

    /// Install the module loader used for guest `import`s in this evaluation.
    pub fn set_module_loader(&mut self, loader: Rc<dyn ModuleLoader>) -> anyhow::Result<()> {
        self.vm.state_mut()?.loader = Some(loader);
        Ok(())
    }
}

fn build_sandbox_value(vm: &mut EnteredVm<'_, '_>, shape: SandboxValue) -> anyhow::Result<Handle> {
    match shape {
        SandboxValue::Handle(handle) => Ok(handle),
        SandboxValue::Object(fields) => {
            let object = vm.new_object();
            for (key, field) in fields {
                let field = build_sandbox_value(vm, field)?;
                vm.set_prop(&object, &key, &field)?;
            }
            vm.manage(object)
        },
    }
}

/// Host-side instance state for guest objects, keyed by an integer stored on
/// the object itself. Storing a plain integer (rather than a host pointer)
/// keeps the "object holds function holds object" graph acyclic across the
/// boundary.
pub struct HostSlots<T> {
    inner: Rc<RefCell<SlotsInner<T>>>,
}

struct SlotsInner<T> {
    next_id: u32,
    slots: HashMap<u32, T>,
}

impl<T> Clone for HostSlots<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> HostSlots<T> {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(SlotsInner {
                next_id: 1,
                slots: HashMap::new(),
            })),
        }
    }

    pub fn insert(&self, value: T) -> u32 {
        let mut inner = self.inner.borrow_mut();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.slots.insert(id, value);
        id
    }

    pub fn remove(&self, id: u32) -> Option<T> {
        self.inner.borrow_mut().slots.remove(&id)
    }

    pub fn with<R>(&self, id: u32, f: impl FnOnce(&mut T) -> R) -> anyhow::Result<R> {
        let mut inner = self.inner.borrow_mut();
        let value = inner
            .slots
            .get_mut(&id)
            .ok_or_else(|| anyhow!("no host state for slot {id}"))?;
        Ok(f(value))
    }

    /// Attach `value` to a guest object by slot id.
    pub fn attach(
        &self,
        vm: &mut EnteredVm<'_, '_>,
        object: &Handle,
        value: T,
    ) -> anyhow::Result<u32> {
        let id = self.insert(value);
        let id_handle = vm.new_number(id as f64);
        vm.set_prop(object, strings::cage_ref.rust_str(), &id_handle)?;
        Ok(id)
    }

    /// Recover the slot id a guest object carries, typically from a sandbox
    /// function's `this`.
    pub fn id_of(vm: &mut EnteredVm<'_, '_>, object: &Handle) -> anyhow::Result<u32> {
        let id = vm.get_prop(object, strings::cage_ref.rust_str())?;
        let dumped = vm.dump(&id)?;
        dumped
            .as_f64()
            .map(|n| n as u32)
            .ok_or_else(|| anyhow!("receiver carries no host slot"))
    }

    /// Look up the host state behind a guest object.
    pub fn with_instance<R>(
        &self,
        vm: &mut EnteredVm<'_, '_>,
        object: &Handle,
        f: impl FnOnce(&mut T) -> R,
    ) -> anyhow::Result<R> {
        let id = Self::id_of(vm, object)?;
        self.with(id, f)
    }
}
