//! An embeddable sandbox host. Untrusted JavaScript runs inside an isolated
//! V8 runtime; the host projects capabilities (console, timers, fetch,
//! crypto, encoding, URL, blob, ESM loading) into the guest through
//! [`CageModule`]s, and the [`Cage`] runtime coordinates evaluation, the
//! guest job queue, host-side asynchronous work, and deterministic teardown
//! of every guest handle.

mod cage;
mod callback_context;
mod context_state;
mod entered_context;
mod error;
mod handle;
mod helpers;
mod is_instance_of_error;
mod isolate;
mod loader;
mod marshal;
mod module;
mod module_map;
pub mod modules;
mod scope;
mod strings;
#[cfg(test)]
mod tests;
mod value;

pub use self::{
    cage::{
        Cage,
        CageOptions,
    },
    context_state::{
        GuestReentry,
        HostTask,
        PromiseId,
        RawFnCallback,
    },
    entered_context::{
        EnteredVm,
        PropertyAttributes,
    },
    error::{
        CageError,
        EvalResult,
        GuestError,
        MarshalError,
    },
    handle::Handle,
    loader::{
        DenyAllLoader,
        ModuleLoader,
    },
    module::{
        module_from_fn,
        CageModule,
        HostSlots,
        ModuleContext,
        SandboxValue,
    },
    scope::Scope,
    value::GuestValue,
};
