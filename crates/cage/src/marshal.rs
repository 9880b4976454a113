use anyhow::anyhow;
use deno_core::v8;
use futures::FutureExt;

use crate::{
    entered_context::EnteredVm,
    error::{
        guest_error_from_exception,
        GuestError,
        MarshalError,
    },
    handle::Handle,
    helpers,
    is_instance_of_error::is_instance_of_error,
    value::GuestValue,
};

/// Dump and marshal refuse to walk deeper than this. Guest object graphs are
/// user-controlled; unbounded recursion here is a stack overflow on a cyclic
/// value.
const MAX_DEPTH: usize = 64;

impl<'a, 'b> EnteredVm<'a, 'b> {
    /// Structurally clone a guest value into the host representation.
    /// Functions (and other host-shapeless values) become opaque markers;
    /// callers that need to invoke them should keep the original handle.
    pub fn dump(&mut self, handle: &Handle) -> anyhow::Result<GuestValue> {
        let local = handle.open(self)?;
        self.dump_value(local, 0)
    }

    fn dump_value(
        &mut self,
        value: v8::Local<'b, v8::Value>,
        depth: usize,
    ) -> anyhow::Result<GuestValue> {
        if depth > MAX_DEPTH {
            return Err(anyhow!(MarshalError::DepthExceeded));
        }
        if value.is_undefined() {
            return Ok(GuestValue::Undefined);
        }
        if value.is_null() {
            return Ok(GuestValue::Null);
        }
        if value.is_boolean() {
            return Ok(GuestValue::Bool(value.is_true()));
        }
        if value.is_number() {
            let n = value
                .number_value(self)
                .ok_or_else(|| anyhow!("number_value on a number failed"))?;
            return Ok(GuestValue::Number(n));
        }
        if value.is_string() {
            let s: v8::Local<v8::String> = value.try_into()?;
            return Ok(GuestValue::String(helpers::to_rust_string(self, &s)?));
        }
        if value.is_function() {
            return Ok(GuestValue::Opaque("function"));
        }
        if let Ok(array) = v8::Local::<v8::Array>::try_from(value) {
            let mut items = Vec::with_capacity(array.length() as usize);
            for i in 0..array.length() {
                let element = array
                    .get_index(self, i)
                    .unwrap_or_else(|| v8::undefined(self).into());
                items.push(self.dump_value(element, depth + 1)?);
            }
            return Ok(GuestValue::Array(items));
        }
        if is_instance_of_error(self, value) {
            return Ok(GuestValue::Error(guest_error_from_exception(self, value)?));
        }
        if let Ok(object) = v8::Local::<v8::Object>::try_from(value) {
            let Some(keys) = object.get_own_property_names(self, Default::default()) else {
                return Ok(GuestValue::Object(Vec::new()));
            };
            let mut entries = Vec::with_capacity(keys.length() as usize);
            for i in 0..keys.length() {
                let Some(key) = keys.get_index(self, i) else {
                    continue;
                };
                let key_str = key
                    .to_string(self)
                    .ok_or_else(|| anyhow!("Failed to stringify property key"))?;
                let key_str = helpers::to_rust_string(self, &key_str)?;
                let Some(prop) = object.get(self, key) else {
                    continue;
                };
                entries.push((key_str, self.dump_value(prop, depth + 1)?));
            }
            return Ok(GuestValue::Object(entries));
        }
        // Symbols, BigInts: representable only as markers.
        Ok(GuestValue::Opaque("value"))
    }

    /// Marshal a host value into the guest. The returned handle is managed by
    /// the evaluation scope. Opaque values are rejected: host functions enter
    /// the guest only deliberately, as sandbox functions.
    pub fn to_guest(&mut self, value: &GuestValue) -> anyhow::Result<Handle> {
        let local = self.to_guest_value(value, 0)?;
        let handle = Handle::new(self, local);
        self.manage(handle)
    }

    fn to_guest_value(
        &mut self,
        value: &GuestValue,
        depth: usize,
    ) -> anyhow::Result<v8::Local<'b, v8::Value>> {
        if depth > MAX_DEPTH {
            return Err(anyhow!(MarshalError::DepthExceeded));
        }
        let local = match value {
            GuestValue::Undefined => v8::undefined(self).into(),
            GuestValue::Null => v8::null(self).into(),
            GuestValue::Bool(b) => v8::Boolean::new(self, *b).into(),
            GuestValue::Number(n) => v8::Number::new(self, *n).into(),
            GuestValue::String(s) => v8::String::new(self, s)
                .ok_or_else(|| anyhow!("Failed to create string"))?
                .into(),
            GuestValue::Array(items) => {
                let array = v8::Array::new(self, i32::try_from(items.len())?);
                for (i, item) in items.iter().enumerate() {
                    let element = self.to_guest_value(item, depth + 1)?;
                    array
                        .set_index(self, i as u32, element)
                        .ok_or_else(|| anyhow!("Failed to set array element"))?;
                }
                array.into()
            },
            GuestValue::Error(e) => self.new_error_local(e)?,
            GuestValue::Object(fields) => {
                let object = v8::Object::new(self);
                for (key, field) in fields {
                    let key = v8::String::new(self, key)
                        .ok_or_else(|| anyhow!("Failed to create property key"))?;
                    let field = self.to_guest_value(field, depth + 1)?;
                    object
                        .set(self, key.into(), field)
                        .ok_or_else(|| anyhow!("Failed to set object property"))?;
                }
                object.into()
            },
            GuestValue::Opaque(kind) => {
                return Err(anyhow!(MarshalError::Unmarshallable(*kind)));
            },
        };
        Ok(local)
    }

    /// Bridge a host future into a guest promise. The future runs as a host
    /// task; its completion re-enters the guest and settles the promise, and
    /// the bridging closures are dropped at settlement. A failed future
    /// rejects the promise with the error's name and message instead of
    /// surfacing as a host error, because the guest asked for the value.
    pub fn marshal_future(
        &mut self,
        future: impl std::future::Future<Output = Result<GuestValue, GuestError>> + 'static,
    ) -> anyhow::Result<Handle> {
        let (promise, promise_id) = self.new_promise()?;
        let task = future
            .map(move |result| {
                let reentry: crate::context_state::GuestReentry =
                    Box::new(move |vm: &mut EnteredVm<'_, '_>| {
                        let settled = match result {
                            Ok(value) => match vm.to_guest(&value) {
                                Ok(handle) => Ok(handle),
                                Err(e) => {
                                    Err(crate::error::guest_error_from_host_failure(&e))
                                },
                            },
                            Err(e) => Err(e),
                        };
                        vm.settle_promise(promise_id, settled)
                    });
                Some(reentry)
            })
            .boxed_local();
        self.push_host_task(task)?;
        Ok(promise)
    }
}
