use std::collections::{
    BTreeMap,
    HashMap,
};

use deno_core::{
    v8,
    ModuleSpecifier,
};

/// Two-way map between module specifiers and the engine's module objects for
/// one evaluation.
pub struct ModuleMap {
    modules: BTreeMap<ModuleSpecifier, v8::Global<v8::Module>>,
    by_v8_module: HashMap<v8::Global<v8::Module>, ModuleSpecifier>,
}

impl ModuleMap {
    pub fn new() -> Self {
        Self {
            modules: BTreeMap::new(),
            by_v8_module: HashMap::new(),
        }
    }

    pub fn contains_module(&self, name: &ModuleSpecifier) -> bool {
        self.modules.contains_key(name)
    }

    pub fn register(
        &mut self,
        name: ModuleSpecifier,
        module: v8::Global<v8::Module>,
    ) -> anyhow::Result<()> {
        anyhow::ensure!(
            !self.modules.contains_key(&name),
            "Module already registered"
        );
        self.modules.insert(name.clone(), module.clone());
        self.by_v8_module.insert(module, name);
        Ok(())
    }

    pub fn lookup_module(&self, name: &ModuleSpecifier) -> Option<&v8::Global<v8::Module>> {
        self.modules.get(name)
    }

    pub fn lookup_by_v8_module(&self, module: &v8::Global<v8::Module>) -> Option<&ModuleSpecifier> {
        self.by_v8_module.get(module)
    }
}
