//! Code cache
//!
//! Compiled methods indexed by method id. The runtime consults the cache
//! before compiling, so a method is compiled once per runtime even when the
//! entry cell of its `Method` is shared. The cache is bounded by method count;
//! once full, new code is still published to the method entry but is not
//! retained here.

use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::jit::compiler::CompiledMethod;
use crate::vm::method::MethodId;

/// Thread-safe cache of compiled methods
pub struct CodeCache {
    entries: RwLock<FxHashMap<MethodId, Arc<CompiledMethod>>>,
    max_methods: usize,
}

impl CodeCache {
    /// Create a cache holding at most `max_methods` entries
    pub fn new(max_methods: usize) -> Self {
        CodeCache {
            entries: RwLock::new(FxHashMap::default()),
            max_methods,
        }
    }

    /// Compiled code for a method
    pub fn get(&self, id: MethodId) -> Option<Arc<CompiledMethod>> {
        self.entries.read().get(&id).cloned()
    }

    /// Insert compiled code for a method
    ///
    /// Returns the code the cache holds for `id` afterwards: an earlier entry
    /// wins over `code`. `None` means the cache is full and nothing was kept.
    pub fn insert(&self, id: MethodId, code: Arc<CompiledMethod>) -> Option<Arc<CompiledMethod>> {
        let mut entries = self.entries.write();
        if let Some(existing) = entries.get(&id) {
            return Some(existing.clone());
        }
        if entries.len() >= self.max_methods {
            return None;
        }
        entries.insert(id, code.clone());
        Some(code)
    }

    /// Drop the entry for a method
    pub fn invalidate(&self, id: MethodId) -> bool {
        self.entries.write().remove(&id).is_some()
    }

    /// Whether a method has cached code
    pub fn contains(&self, id: MethodId) -> bool {
        self.entries.read().contains_key(&id)
    }

    /// Number of cached methods
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Maximum number of entries
    pub fn capacity(&self) -> usize {
        self.max_methods
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::jit::bytecode::asm::Assembler;
    use crate::jit::bytecode::Opcode;
    use crate::jit::compiler::MethodCompiler;
    use crate::vm::bootstrap::define_core_classes;
    use crate::vm::class::{ClassDef, ClassRegistry};
    use crate::vm::method::{Method, MethodDef, MethodFlags};

    fn compiled(names: &[&str]) -> Vec<(Arc<Method>, Arc<CompiledMethod>)> {
        let registry = ClassRegistry::new();
        define_core_classes(&registry).unwrap();
        let mut def = ClassDef::new("T");
        for name in names {
            let mut a = Assembler::new();
            a.push_int(1).op(Opcode::Ireturn);
            let code = a.finish_code(0, 1).unwrap();
            def = def.method(MethodDef::bytecode(name, "()I", MethodFlags::STATIC, code));
        }
        let class = registry.define(def).unwrap();
        let compiler = MethodCompiler::new(registry.clone(), EngineConfig::default());
        names
            .iter()
            .map(|name| {
                let method = class.declared_method(name, "()I").unwrap().clone();
                let code = Arc::new(compiler.compile(&method).unwrap());
                (method, code)
            })
            .collect()
    }

    #[test]
    fn test_first_insert_wins() {
        let mut methods = compiled(&["a"]);
        let (method, first) = methods.remove(0);
        let cache = CodeCache::new(4);
        assert!(cache.is_empty());

        let kept = cache.insert(method.id(), first.clone()).unwrap();
        assert!(Arc::ptr_eq(&kept, &first));

        let again = compiled(&["a"]).remove(0).1;
        let kept = cache.insert(method.id(), again).unwrap();
        assert!(Arc::ptr_eq(&kept, &first));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_full_cache_rejects() {
        let methods = compiled(&["a", "b"]);
        let cache = CodeCache::new(1);
        assert!(cache.insert(methods[0].0.id(), methods[0].1.clone()).is_some());
        assert!(cache.insert(methods[1].0.id(), methods[1].1.clone()).is_none());
        assert!(!cache.contains(methods[1].0.id()));
        assert_eq!(cache.capacity(), 1);
    }

    #[test]
    fn test_invalidate() {
        let methods = compiled(&["a"]);
        let cache = CodeCache::new(4);
        cache.insert(methods[0].0.id(), methods[0].1.clone());
        assert!(cache.invalidate(methods[0].0.id()));
        assert!(cache.get(methods[0].0.id()).is_none());
        assert!(!cache.invalidate(methods[0].0.id()));
    }
}
