use anyhow::anyhow;
use async_trait::async_trait;
use deno_core::ModuleSpecifier;

/// Resolves and fetches ES module sources for guest `import`s.
///
/// `resolve` follows URL semantics: absolute `http(s)` specifiers pass
/// through, absolute paths resolve against the referrer's origin, and
/// relative paths resolve against the referrer. `fetch` retrieves the module
/// text; it is the only suspension point in module loading.
#[async_trait(?Send)]
pub trait ModuleLoader {
    fn resolve(
        &self,
        specifier: &str,
        referrer: &ModuleSpecifier,
    ) -> anyhow::Result<ModuleSpecifier> {
        Ok(deno_core::resolve_import(specifier, referrer.as_str())?)
    }

    async fn fetch(&self, specifier: &ModuleSpecifier) -> anyhow::Result<String>;
}

/// A loader that refuses every import, for hosts that want the refusal to be
/// explicit rather than "no loader installed".
pub struct DenyAllLoader;

#[async_trait(?Send)]
impl ModuleLoader for DenyAllLoader {
    async fn fetch(&self, specifier: &ModuleSpecifier) -> anyhow::Result<String> {
        Err(anyhow!("module loading is not enabled: {specifier}"))
    }
}
