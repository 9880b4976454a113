use std::rc::Rc;

use anyhow::anyhow;
use async_trait::async_trait;
use deno_core::ModuleSpecifier;

use crate::{
    loader::ModuleLoader,
    module::{
        CageModule,
        ModuleContext,
    },
};

/// Enables guest `import` (static and dynamic) from `http(s)://` URLs.
///
/// Resolution follows URL semantics: absolute `http(s)` specifiers pass
/// through, absolute paths resolve against the referrer's origin, relative
/// paths against the referrer. Only `http` and `https` sources are fetched.
pub struct EsmModule;

pub struct HttpModuleLoader {
    client: reqwest::Client,
}

impl HttpModuleLoader {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait(?Send)]
impl ModuleLoader for HttpModuleLoader {
    async fn fetch(&self, specifier: &ModuleSpecifier) -> anyhow::Result<String> {
        match specifier.scheme() {
            "http" | "https" => (),
            other => {
                return Err(anyhow!(
                    "cannot load module {specifier}: unsupported scheme {other}"
                ));
            },
        }
        let response = self
            .client
            .get(specifier.as_str())
            .send()
            .await?
            .error_for_status()?;
        Ok(response.text().await?)
    }
}

impl CageModule for EsmModule {
    fn def(&self, ctx: &mut ModuleContext<'_, '_, '_>) -> anyhow::Result<()> {
        ctx.set_module_loader(Rc::new(HttpModuleLoader::new()))
    }
}
