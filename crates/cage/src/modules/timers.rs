use std::{
    cell::RefCell,
    collections::HashMap,
    rc::Rc,
    time::Duration,
};

use anyhow::anyhow;
use futures::{
    future::{
        AbortHandle,
        Abortable,
    },
    FutureExt,
};

use crate::{
    context_state::{
        GuestReentry,
        RawFnCallback,
    },
    entered_context::EnteredVm,
    error::GuestError,
    handle::Handle,
    module::{
        CageModule,
        ModuleContext,
    },
};

/// `setTimeout` / `clearTimeout` / `setInterval` / `clearInterval`.
///
/// Every scheduled timer is a host task gating evaluation completion, so a
/// script does not finish before its timers have fired. Clearing a timer
/// aborts the host sleep, which both cancels the callback and releases the
/// evaluation's wait on it.
pub struct TimersModule;

struct TimerState {
    next_id: u32,
    active: HashMap<u32, AbortHandle>,
}

impl TimerState {
    fn new() -> Self {
        Self {
            next_id: 1,
            active: HashMap::new(),
        }
    }
}

fn timer_args(
    vm: &mut EnteredVm<'_, '_>,
    args: &[Handle],
    name: &'static str,
) -> anyhow::Result<(Handle, Duration)> {
    let callback = args
        .first()
        .ok_or_else(|| anyhow!(GuestError::type_error(format!("{name} requires a callback"))))?;
    if !vm.is_function(callback)? {
        return Err(anyhow!(GuestError::type_error(format!(
            "{name} callback must be a function"
        ))));
    }
    let delay_ms = match args.get(1) {
        Some(arg) => vm.dump(arg)?.as_f64().unwrap_or(0.0).max(0.0),
        None => 0.0,
    };
    Ok((callback.dup(), Duration::from_millis(delay_ms as u64)))
}

fn timer_id_arg(vm: &mut EnteredVm<'_, '_>, args: &[Handle]) -> anyhow::Result<Option<u32>> {
    let Some(arg) = args.first() else {
        return Ok(None);
    };
    Ok(vm.dump(arg)?.as_f64().map(|n| n as u32))
}

fn schedule_timeout(
    vm: &mut EnteredVm<'_, '_>,
    state: &Rc<RefCell<TimerState>>,
    callback: Handle,
    delay: Duration,
) -> anyhow::Result<u32> {
    let id = {
        let mut state_mut = state.borrow_mut();
        let id = state_mut.next_id;
        state_mut.next_id += 1;
        id
    };
    let (abort_handle, abort_registration) = AbortHandle::new_pair();
    state.borrow_mut().active.insert(id, abort_handle);

    let state = state.clone();
    let task = Abortable::new(tokio::time::sleep(delay), abort_registration)
        .map(move |result| match result {
            Ok(()) => {
                let reentry: GuestReentry = Box::new(move |vm: &mut EnteredVm<'_, '_>| {
                    state.borrow_mut().active.remove(&id);
                    match vm.call_function(&callback, None, &[])? {
                        Ok(_) => Ok(()),
                        Err(e) => Err(anyhow!(crate::error::CageError::Guest(e))),
                    }
                });
                Some(reentry)
            },
            // Cleared before it fired.
            Err(_aborted) => None,
        })
        .boxed_local();
    vm.push_host_task(task)?;
    Ok(id)
}

fn schedule_interval(
    vm: &mut EnteredVm<'_, '_>,
    state: &Rc<RefCell<TimerState>>,
    callback: Handle,
    period: Duration,
) -> anyhow::Result<u32> {
    let id = {
        let mut state_mut = state.borrow_mut();
        let id = state_mut.next_id;
        state_mut.next_id += 1;
        id
    };
    arm_interval(vm, state, id, callback, period)?;
    Ok(id)
}

fn arm_interval(
    vm: &mut EnteredVm<'_, '_>,
    state: &Rc<RefCell<TimerState>>,
    id: u32,
    callback: Handle,
    period: Duration,
) -> anyhow::Result<()> {
    let (abort_handle, abort_registration) = AbortHandle::new_pair();
    state.borrow_mut().active.insert(id, abort_handle);

    let state = state.clone();
    let task = Abortable::new(tokio::time::sleep(period), abort_registration)
        .map(move |result| match result {
            Ok(()) => {
                let reentry: GuestReentry = Box::new(move |vm: &mut EnteredVm<'_, '_>| {
                    let invoke = vm.call_function(&callback, None, &[])?;
                    if let Err(e) = invoke {
                        state.borrow_mut().active.remove(&id);
                        return Err(anyhow!(crate::error::CageError::Guest(e)));
                    }
                    // Still armed? The callback may have cleared itself.
                    if state.borrow().active.contains_key(&id) {
                        arm_interval(vm, &state, id, callback, period)?;
                    }
                    Ok(())
                });
                Some(reentry)
            },
            Err(_aborted) => None,
        })
        .boxed_local();
    vm.push_host_task(task)
}

fn clear_timer(state: &Rc<RefCell<TimerState>>, id: Option<u32>) {
    let Some(id) = id else {
        return;
    };
    if let Some(abort_handle) = state.borrow_mut().active.remove(&id) {
        abort_handle.abort();
    }
}

impl CageModule for TimersModule {
    fn def(&self, ctx: &mut ModuleContext<'_, '_, '_>) -> anyhow::Result<()> {
        let state = Rc::new(RefCell::new(TimerState::new()));

        let st = state.clone();
        let set_timeout: RawFnCallback = Box::new(move |vm, _this, args| {
            let (callback, delay) = timer_args(vm, args, "setTimeout")?;
            let id = schedule_timeout(vm, &st, callback, delay)?;
            Ok(vm.new_number(id as f64))
        });
        ctx.define_sandbox_fn_raw("setTimeout", set_timeout)?;

        let st = state.clone();
        let set_interval: RawFnCallback = Box::new(move |vm, _this, args| {
            let (callback, period) = timer_args(vm, args, "setInterval")?;
            let id = schedule_interval(vm, &st, callback, period)?;
            Ok(vm.new_number(id as f64))
        });
        ctx.define_sandbox_fn_raw("setInterval", set_interval)?;

        let st = state.clone();
        let clear_timeout: RawFnCallback = Box::new(move |vm, _this, args| {
            clear_timer(&st, timer_id_arg(vm, args)?);
            Ok(vm.undefined())
        });
        ctx.define_sandbox_fn_raw("clearTimeout", clear_timeout)?;

        let st = state;
        let clear_interval: RawFnCallback = Box::new(move |vm, _this, args| {
            clear_timer(&st, timer_id_arg(vm, args)?);
            Ok(vm.undefined())
        });
        ctx.define_sandbox_fn_raw("clearInterval", clear_interval)?;

        Ok(())
    }
}
