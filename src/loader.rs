//! Module loader for a surface's inline module scripts.
//!
//! A preview document is self-contained: the only modules that exist are
//! the document's own `<script type="module">` blocks, registered under
//! their synthetic specifiers. Remote imports are forbidden and nothing is
//! ever read from the filesystem.

use deno_core::{
    anyhow::{anyhow, Error},
    ModuleLoadResponse, ModuleLoader, ModuleSource, ModuleSourceCode, ModuleSpecifier,
    ModuleType, RequestedModuleType, ResolutionKind,
};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

const REMOTE_SCHEMES: &[&str] = &["http", "https", "data", "blob"];

#[derive(Default)]
pub struct InlineModuleLoader {
    modules: Rc<RefCell<HashMap<ModuleSpecifier, String>>>,
}

impl InlineModuleLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared view of the registry, for the surface to register into after
    /// the loader has been moved into the runtime.
    pub fn registry(&self) -> InlineModules {
        InlineModules(self.modules.clone())
    }
}

#[derive(Clone)]
pub struct InlineModules(Rc<RefCell<HashMap<ModuleSpecifier, String>>>);

impl InlineModules {
    pub fn register(&self, specifier: ModuleSpecifier, code: String) {
        self.0.borrow_mut().insert(specifier, code);
    }
}

impl ModuleLoader for InlineModuleLoader {
    fn resolve(
        &self,
        specifier: &str,
        _referrer: &str,
        _kind: ResolutionKind,
    ) -> Result<ModuleSpecifier, Error> {
        match ModuleSpecifier::parse(specifier) {
            Ok(url) if self.modules.borrow().contains_key(&url) => Ok(url),
            Ok(url) if REMOTE_SCHEMES.contains(&url.scheme()) => {
                Err(anyhow!("Remote imports are forbidden in sandbox: {}", specifier))
            }
            _ => Err(anyhow!("Module not available in sandbox: {}", specifier)),
        }
    }

    fn load(
        &self,
        module_specifier: &ModuleSpecifier,
        _maybe_referrer: Option<&ModuleSpecifier>,
        _is_dyn_import: bool,
        _requested_module_type: RequestedModuleType,
    ) -> ModuleLoadResponse {
        let result = match self.modules.borrow().get(module_specifier) {
            Some(code) => Ok(ModuleSource::new(
                ModuleType::JavaScript,
                ModuleSourceCode::String(code.clone().into()),
                module_specifier,
                None,
            )),
            None => Err(anyhow!("Module not available in sandbox: {}", module_specifier)),
        };
        ModuleLoadResponse::Sync(result)
    }
}
