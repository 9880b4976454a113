use anyhow::anyhow;
use bytes::Bytes;

use crate::{
    context_state::RawFnCallback,
    entered_context::EnteredVm,
    error::GuestError,
    handle::Handle,
    module::{
        CageModule,
        HostSlots,
        ModuleContext,
    },
    value::GuestValue,
};

/// Installs `Blob`, `atob`, and `btoa`.
///
/// Blob bytes live host-side in a slot store keyed off the instance; guest
/// code only ever sees the size, the type, and the async accessors.
pub struct BlobModule;

struct BlobState {
    bytes: Bytes,
    mime: String,
}

fn blob_part_bytes(
    vm: &mut EnteredVm<'_, '_>,
    slots: &HostSlots<BlobState>,
    part: &Handle,
) -> anyhow::Result<Vec<u8>> {
    let dumped = vm.dump(part)?;
    match dumped {
        GuestValue::String(s) => Ok(s.into_bytes()),
        GuestValue::Object(_) => {
            // Another Blob?
            if HostSlots::<BlobState>::id_of(vm, part).is_ok() {
                return slots.with_instance(vm, part, |state| state.bytes.to_vec());
            }
            vm.read_bytes(part)
        },
        other => Ok(other.to_string().into_bytes()),
    }
}

fn clamp_index(index: Option<f64>, len: usize, default: usize) -> usize {
    match index {
        None => default,
        Some(i) if i < 0.0 => len.saturating_sub((-i) as usize),
        Some(i) => (i as usize).min(len),
    }
}

fn atob(args: &[GuestValue]) -> anyhow::Result<GuestValue> {
    let mut encoded = args
        .first()
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow!(GuestError::type_error("atob requires a string")))?;
    encoded.retain(|c| !c.is_ascii_whitespace());
    let bytes = base64::decode(encoded).map_err(|e| {
        anyhow!(GuestError::new(
            "InvalidCharacterError",
            format!("Failed to decode base64: {e}"),
        ))
    })?;
    let decoded: String = bytes
        .into_iter()
        .map(|c| std::char::from_u32(c as u32).expect("all u8s are valid characters"))
        .collect();
    Ok(GuestValue::String(decoded))
}

fn btoa(args: &[GuestValue]) -> anyhow::Result<GuestValue> {
    let text = args
        .first()
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow!(GuestError::type_error("btoa requires a string")))?;
    let mut bytes = Vec::with_capacity(text.len());
    for char in text.chars() {
        if char as usize > u8::MAX as usize {
            return Err(anyhow!(GuestError::new(
                "InvalidCharacterError",
                "The string to be encoded contains characters outside of the Latin1 range.",
            )));
        }
        bytes.push(char as u8);
    }
    Ok(GuestValue::String(base64::encode(&bytes)))
}

fn build_blob(
    vm: &mut EnteredVm<'_, '_>,
    slots: &HostSlots<BlobState>,
    methods: &BlobMethods,
    this: &Handle,
    bytes: Bytes,
    mime: String,
) -> anyhow::Result<()> {
    let size = vm.new_number(bytes.len() as f64);
    vm.set_prop(this, "size", &size)?;
    let mime_handle = vm.new_string(&mime)?;
    vm.set_prop(this, "type", &mime_handle)?;
    vm.set_prop(this, "text", &methods.text)?;
    vm.set_prop(this, "arrayBuffer", &methods.array_buffer)?;
    vm.set_prop(this, "slice", &methods.slice)?;
    slots.attach(vm, this, BlobState { bytes, mime })?;
    Ok(())
}

struct BlobMethods {
    text: Handle,
    array_buffer: Handle,
    slice: Handle,
}

impl CageModule for BlobModule {
    fn def(&self, ctx: &mut ModuleContext<'_, '_, '_>) -> anyhow::Result<()> {
        ctx.define_sandbox_fn("atob", |args| atob(args))?;
        ctx.define_sandbox_fn("btoa", |args| btoa(args))?;

        let slots: HostSlots<BlobState> = HostSlots::new();

        let st = slots.clone();
        let text: RawFnCallback = Box::new(move |vm, this, _args| {
            let bytes = st.with_instance(vm, &this, |state| state.bytes.clone())?;
            let (promise, promise_id) = vm.new_promise()?;
            let settled = match String::from_utf8(bytes.to_vec()) {
                Ok(text) => Ok(vm.new_string(&text)?),
                Err(_) => Err(GuestError::type_error("Blob contents are not valid UTF-8")),
            };
            vm.settle_promise(promise_id, settled)?;
            Ok(promise)
        });
        let st = slots.clone();
        let array_buffer: RawFnCallback = Box::new(move |vm, this, _args| {
            let bytes = st.with_instance(vm, &this, |state| state.bytes.to_vec())?;
            let (promise, promise_id) = vm.new_promise()?;
            let buffer = vm.new_array_buffer(bytes);
            vm.settle_promise(promise_id, Ok(buffer))?;
            Ok(promise)
        });

        // `slice` builds a fresh Blob sharing the byte store; methods are
        // attached inside the callback, so it needs its own handles.
        let methods_for_slice: std::rc::Rc<std::cell::RefCell<Option<std::rc::Rc<BlobMethods>>>> =
            std::rc::Rc::new(std::cell::RefCell::new(None));
        let st = slots.clone();
        let mfs = methods_for_slice.clone();
        let slice: RawFnCallback = Box::new(move |vm, this, args| {
            let (bytes, mime) =
                st.with_instance(vm, &this, |state| (state.bytes.clone(), state.mime.clone()))?;
            let start = args.get(0).map(|a| vm.dump(a)).transpose()?.and_then(|v| v.as_f64());
            let end = args.get(1).map(|a| vm.dump(a)).transpose()?.and_then(|v| v.as_f64());
            let content_type = args
                .get(2)
                .map(|a| vm.dump(a))
                .transpose()?
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_else(|| mime.clone());
            let start = clamp_index(start, bytes.len(), 0);
            let end = clamp_index(end, bytes.len(), bytes.len());
            let sliced = if start < end {
                bytes.slice(start..end)
            } else {
                Bytes::new()
            };
            let blob = vm.new_object();
            let blob = vm.manage(blob)?;
            let methods = mfs
                .borrow()
                .clone()
                .ok_or_else(|| anyhow!("Blob methods not initialized"))?;
            build_blob(vm, &st, &methods, &blob, sliced, content_type)?;
            Ok(blob)
        });

        let methods = std::rc::Rc::new(BlobMethods {
            text: ctx.sandbox_fn_raw("text", text)?,
            array_buffer: ctx.sandbox_fn_raw("arrayBuffer", array_buffer)?,
            slice: ctx.sandbox_fn_raw("slice", slice)?,
        });
        *methods_for_slice.borrow_mut() = Some(methods.clone());

        let st = slots;
        let ctor: RawFnCallback = Box::new(move |vm, this, args| {
            let mut bytes = Vec::new();
            if let Some(parts) = args.first() {
                let dumped = vm.dump(parts)?;
                let GuestValue::Array(items) = dumped else {
                    return Err(anyhow!(GuestError::type_error(
                        "Blob parts must be an array"
                    )));
                };
                for i in 0..items.len() {
                    let part = vm.get_index(parts, i as u32)?;
                    bytes.extend_from_slice(&blob_part_bytes(vm, &st, &part)?);
                }
            }
            let mime = args
                .get(1)
                .map(|a| vm.dump(a))
                .transpose()?
                .and_then(|options| options.get("type").and_then(|v| v.as_str().map(str::to_string)))
                .unwrap_or_default();
            build_blob(vm, &st, &methods, &this, Bytes::from(bytes), mime)?;
            Ok(vm.undefined())
        });
        ctx.define_sandbox_fn_raw("Blob", ctor)?;

        Ok(())
    }
}
