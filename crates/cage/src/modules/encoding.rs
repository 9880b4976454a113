use anyhow::anyhow;
use encoding_rs::{
    CoderResult,
    DecoderResult,
    Encoding,
};

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
};

/// Installs `TextEncoder` and `TextDecoder` over `encoding_rs`.
///
/// Encoders are stateless; decoder instances carry their resolved encoding
/// and flags in a host slot recovered through the receiver.
pub struct EncodingModule;

struct DecoderConfig {
    encoding: &'static Encoding,
    fatal: bool,
    ignore_bom: bool,
}

fn encode(vm: &mut EnteredVm<'_, '_>, args: &[Handle]) -> anyhow::Result<Handle> {
    let text = match args.first() {
        Some(arg) => vm
            .dump(arg)?
            .as_str()
            .map(str::to_string)
            .unwrap_or_default(),
        None => String::new(),
    };
    vm.new_uint8_array(text.into_bytes())
}

fn encode_into(vm: &mut EnteredVm<'_, '_>, args: &[Handle]) -> anyhow::Result<Handle> {
    let input = args
        .first()
        .map(|a| vm.dump(a))
        .transpose()?
        .and_then(|v| v.as_str().map(str::to_string))
        .ok_or_else(|| anyhow!(GuestError::type_error("encodeInto source must be a string")))?;
    let dest = args
        .get(1)
        .ok_or_else(|| anyhow!(GuestError::type_error("encodeInto requires a Uint8Array")))?;
    let dest_size = vm.read_bytes(dest)?.len();

    let mut utf16_code_points_read = 0;
    let mut bytes_written = 0;
    for c in input.chars() {
        if bytes_written + c.len_utf8() > dest_size {
            break;
        }
        utf16_code_points_read += c.len_utf16();
        bytes_written += c.len_utf8();
    }
    vm.write_bytes_prefix(dest, input[0..bytes_written].as_bytes())?;

    let result = vm.new_object();
    let read = vm.new_number(utf16_code_points_read as f64);
    let written = vm.new_number(bytes_written as f64);
    vm.set_prop(&result, "read", &read)?;
    vm.set_prop(&result, "written", &written)?;
    Ok(result)
}

fn decode(
    vm: &mut EnteredVm<'_, '_>,
    slots: &HostSlots<DecoderConfig>,
    this: &Handle,
    args: &[Handle],
) -> anyhow::Result<Handle> {
    let data = match args.first() {
        Some(arg) => vm.read_bytes(arg)?,
        None => Vec::new(),
    };
    let (encoding, fatal, ignore_bom) = slots.with_instance(vm, this, |config| {
        (config.encoding, config.fatal, config.ignore_bom)
    })?;

    let mut decoder = if ignore_bom {
        encoding.new_decoder_without_bom_handling()
    } else {
        encoding.new_decoder_with_bom_removal()
    };
    let max_buffer_length = decoder
        .max_utf8_buffer_length(data.len())
        .ok_or_else(|| anyhow!(GuestError::type_error("Value too large to decode")))?;
    let mut output = vec![0; max_buffer_length];

    let written = if fatal {
        let (result, _, written) =
            decoder.decode_to_utf8_without_replacement(&data, &mut output, true);
        match result {
            DecoderResult::InputEmpty => written,
            DecoderResult::OutputFull => {
                return Err(anyhow!(GuestError::type_error("Provided buffer too small")));
            },
            DecoderResult::Malformed(..) => {
                return Err(anyhow!(GuestError::type_error(
                    "The encoded data is not valid"
                )));
            },
        }
    } else {
        let (result, _, written, _) = decoder.decode_to_utf8(&data, &mut output, true);
        match result {
            CoderResult::InputEmpty => written,
            CoderResult::OutputFull => {
                return Err(anyhow!(GuestError::type_error("Provided buffer too small")));
            },
        }
    };
    output.truncate(written);
    let text = std::str::from_utf8(&output)?;
    vm.new_string(text)
}

impl CageModule for EncodingModule {
    fn def(&self, ctx: &mut ModuleContext<'_, '_, '_>) -> anyhow::Result<()> {
        // TextEncoder: stateless, so every instance shares the same method
        // functions.
        let encode_fn = ctx.sandbox_fn_raw("encode", Box::new(|vm, _this, args| encode(vm, args)))?;
        let encode_into_fn =
            ctx.sandbox_fn_raw("encodeInto", Box::new(|vm, _this, args| encode_into(vm, args)))?;
        let encoder_ctor: RawFnCallback = Box::new(move |vm, this, _args| {
            let encoding = vm.new_string("utf-8")?;
            vm.set_prop(&this, "encoding", &encoding)?;
            vm.set_prop(&this, "encode", &encode_fn)?;
            vm.set_prop(&this, "encodeInto", &encode_into_fn)?;
            Ok(vm.undefined())
        });
        ctx.define_sandbox_fn_raw("TextEncoder", encoder_ctor)?;

        let slots: HostSlots<DecoderConfig> = HostSlots::new();
        let decode_slots = slots.clone();
        let decode_fn = ctx.sandbox_fn_raw(
            "decode",
            Box::new(move |vm, this, args| decode(vm, &decode_slots, &this, args)),
        )?;
        let decoder_ctor: RawFnCallback = Box::new(move |vm, this, args| {
            let label = match args.first() {
                Some(arg) => vm
                    .dump(arg)?
                    .as_str()
                    .map(str::to_string)
                    .unwrap_or_else(|| "utf-8".to_string()),
                None => "utf-8".to_string(),
            };
            let encoding = Encoding::for_label(label.as_bytes()).ok_or_else(|| {
                anyhow!(GuestError::range_error(format!(
                    "The encoding label provided ('{label}') is invalid."
                )))
            })?;
            let (fatal, ignore_bom) = match args.get(1) {
                Some(arg) => {
                    let options = vm.dump(arg)?;
                    (
                        matches!(options.get("fatal"), Some(crate::GuestValue::Bool(true))),
                        matches!(options.get("ignoreBOM"), Some(crate::GuestValue::Bool(true))),
                    )
                },
                None => (false, false),
            };
            slots.attach(
                vm,
                &this,
                DecoderConfig {
                    encoding,
                    fatal,
                    ignore_bom,
                },
            )?;
            let name = vm.new_string(&encoding.name().to_lowercase())?;
            vm.set_prop(&this, "encoding", &name)?;
            let fatal_handle = vm.boolean(fatal);
            vm.set_prop(&this, "fatal", &fatal_handle)?;
            let bom_handle = vm.boolean(ignore_bom);
            vm.set_prop(&this, "ignoreBOM", &bom_handle)?;
            vm.set_prop(&this, "decode", &decode_fn)?;
            Ok(vm.undefined())
        });
        ctx.define_sandbox_fn_raw("TextDecoder", decoder_ctor)?;

        Ok(())
    }
}
