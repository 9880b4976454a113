use std::{
    collections::{
        HashMap,
        HashSet,
    },
    rc::Rc,
};

use deno_core::{
    v8,
    ModuleSpecifier,
};
use futures::future::LocalBoxFuture;

use crate::{
    entered_context::EnteredVm,
    handle::Handle,
    loader::ModuleLoader,
    module_map::ModuleMap,
    scope::Scope,
};

pub type PromiseId = u64;

/// A host callback installed into the guest as a sandbox function. Receives
/// the receiver (`this`) and the call arguments as handles; the returned
/// handle becomes the call's return value.
pub type RawFnCallback =
    Box<dyn for<'a, 'b> FnMut(&mut EnteredVm<'a, 'b>, Handle, &[Handle]) -> anyhow::Result<Handle>>;

/// A closure delivered by the pump loop back into the guest once a host task
/// settles.
pub type GuestReentry = Box<dyn for<'a, 'b> FnOnce(&mut EnteredVm<'a, 'b>) -> anyhow::Result<()>>;

/// Host-side asynchronous work gating evaluation completion. Yields `None`
/// when the work was cancelled (or is a pure keep-alive) and needs no guest
/// re-entry.
pub type HostTask = LocalBoxFuture<'static, Option<GuestReentry>>;

pub type AfterScriptHook =
    Box<dyn for<'a, 'b> FnOnce(&mut EnteredVm<'a, 'b>) -> anyhow::Result<()>>;

/// Per-context state, stored in a slot on the guest context so both the
/// evaluation body and engine callbacks can reach it.
///
/// Sandbox functions are dispatched by integer id through `sandbox_fns`;
/// the id travels as the function's embedder data, which keeps guest-reachable
/// objects free of host pointers (and so free of host/guest ownership
/// cycles). Entries are taken out of the registry for the duration of a call,
/// so a function observing its own slot empty is a reentrant call.
pub struct ContextState {
    pub module_map: ModuleMap,
    pub loader: Option<Rc<dyn ModuleLoader>>,

    /// The evaluation-wide disposal scope. Every handle that escapes into the
    /// guest through the marshaller or the module-authoring helpers is
    /// managed here.
    pub scope: Scope,

    pub sandbox_fns: Vec<Option<RawFnCallback>>,

    pub next_promise_id: PromiseId,
    pub promise_resolvers: HashMap<PromiseId, v8::Global<v8::PromiseResolver>>,

    pub pending_tasks: Vec<HostTask>,
    pub pending_dynamic_imports: Vec<(ModuleSpecifier, v8::Global<v8::PromiseResolver>)>,

    /// See the promise-reject callback: a rejection lands here when it has no
    /// handler, and is removed again if the guest attaches one before the
    /// microtask queue drains. Whatever is still here after a drain is an
    /// unhandled rejection.
    pub unhandled_promise_rejections: HashMap<v8::Global<v8::Promise>, v8::Global<v8::Value>>,

    /// Module evaluation promises are observed through their state by the
    /// evaluation pipeline, never through guest handlers; the reject callback
    /// must not count them as unhandled.
    pub module_evaluation_promises: HashSet<v8::Global<v8::Promise>>,
}

impl ContextState {
    pub fn new() -> Self {
        Self {
            module_map: ModuleMap::new(),
            loader: None,
            scope: Scope::new(),
            sandbox_fns: Vec::new(),
            next_promise_id: 0,
            promise_resolvers: HashMap::new(),
            pending_tasks: Vec::new(),
            pending_dynamic_imports: Vec::new(),
            unhandled_promise_rejections: HashMap::new(),
            module_evaluation_promises: HashSet::new(),
        }
    }

    pub fn install(scope: &mut v8::HandleScope<'_>, context: v8::Local<'_, v8::Context>) {
        assert!(context.set_slot(scope, ContextState::new()));
    }

    pub fn take_promise(
        &mut self,
        promise_id: PromiseId,
    ) -> anyhow::Result<v8::Global<v8::PromiseResolver>> {
        self.promise_resolvers
            .remove(&promise_id)
            .ok_or_else(|| anyhow::anyhow!("Promise resolver {promise_id} not found"))
    }
}
