use anyhow::anyhow;
use rand::RngCore;
use sha1::Sha1;
use sha2::{
    Digest,
    Sha256,
    Sha384,
    Sha512,
};

use crate::{
    context_state::RawFnCallback,
    entered_context::EnteredVm,
    error::GuestError,
    handle::Handle,
    module::{
        CageModule,
        ModuleContext,
        SandboxValue,
    },
};

/// The number of bytes of entropy `getRandomValues` hands out per call, per
/// the WebCrypto limit.
const MAX_RANDOM_BYTES: usize = 65536;

/// Installs `crypto.getRandomValues`, `crypto.randomUUID`, and
/// `crypto.subtle.digest` (SHA-1, SHA-256, SHA-384, SHA-512).
pub struct CryptoModule;

fn get_random_values(vm: &mut EnteredVm<'_, '_>, args: &[Handle]) -> anyhow::Result<Handle> {
    let array = args
        .first()
        .ok_or_else(|| anyhow!(GuestError::type_error("getRandomValues requires a typed array")))?;
    let current = vm.read_bytes(array)?;
    if current.len() > MAX_RANDOM_BYTES {
        return Err(anyhow!(GuestError::new(
            "QuotaExceededError",
            format!(
                "Byte length ({}) exceeds the number of bytes of entropy available via this API \
                 ({})",
                current.len(),
                MAX_RANDOM_BYTES
            ),
        )));
    }
    let mut bytes = vec![0u8; current.len()];
    rand::thread_rng().fill_bytes(&mut bytes);
    vm.write_bytes(array, &bytes)?;
    Ok(array.dup())
}

fn digest_bytes(algorithm: &str, data: &[u8]) -> anyhow::Result<Vec<u8>> {
    let digest = match algorithm {
        "SHA-1" => Sha1::digest(data).to_vec(),
        "SHA-256" => Sha256::digest(data).to_vec(),
        "SHA-384" => Sha384::digest(data).to_vec(),
        "SHA-512" => Sha512::digest(data).to_vec(),
        other => {
            return Err(anyhow!(GuestError::new(
                "NotSupportedError",
                format!("Unrecognized digest algorithm {other}"),
            )));
        },
    };
    Ok(digest)
}

fn subtle_digest(vm: &mut EnteredVm<'_, '_>, args: &[Handle]) -> anyhow::Result<Handle> {
    let algorithm = args
        .first()
        .map(|a| vm.dump(a))
        .transpose()?
        .and_then(|v| v.as_str().map(str::to_string))
        .ok_or_else(|| anyhow!(GuestError::type_error("digest algorithm must be a string")))?;
    let data = args
        .get(1)
        .ok_or_else(|| anyhow!(GuestError::type_error("digest requires data to hash")))?;
    let bytes = vm.read_bytes(data)?;
    // `subtle.digest` returns a promise even though the hash is computed
    // eagerly; the guest observes fulfillment on the next drain.
    let (promise, promise_id) = vm.new_promise()?;
    match digest_bytes(&algorithm, &bytes) {
        Ok(digest) => {
            let buffer = vm.new_array_buffer(digest);
            vm.settle_promise(promise_id, Ok(buffer))?;
        },
        Err(e) => {
            vm.settle_promise(promise_id, Err(crate::error::guest_error_from_host_failure(&e)))?;
        },
    }
    Ok(promise)
}

impl CageModule for CryptoModule {
    fn def(&self, ctx: &mut ModuleContext<'_, '_, '_>) -> anyhow::Result<()> {
        let get_random: RawFnCallback = Box::new(|vm, _this, args| get_random_values(vm, args));
        let get_random = ctx.sandbox_fn_raw("getRandomValues", get_random)?;

        let random_uuid: RawFnCallback = Box::new(|vm, _this, _args| {
            let uuid = uuid::Uuid::new_v4();
            vm.new_string(&uuid.to_string())
        });
        let random_uuid = ctx.sandbox_fn_raw("randomUUID", random_uuid)?;

        let digest: RawFnCallback = Box::new(|vm, _this, args| subtle_digest(vm, args));
        let digest = ctx.sandbox_fn_raw("digest", digest)?;

        ctx.define_sandbox_object(
            "crypto",
            SandboxValue::Object(vec![
                ("getRandomValues".to_string(), SandboxValue::Handle(get_random)),
                ("randomUUID".to_string(), SandboxValue::Handle(random_uuid)),
                (
                    "subtle".to_string(),
                    SandboxValue::Object(vec![(
                        "digest".to_string(),
                        SandboxValue::Handle(digest),
                    )]),
                ),
            ]),
        )
    }
}
