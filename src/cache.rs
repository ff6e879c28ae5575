use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::ast::ComponentDefinition;
use crate::error::CompileFailure;
use crate::{compile_fingerprinted, CompileOptions, CompiledModule};

pub fn compute_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Content fingerprint of one compile request: compiler version, options and the
/// component itself. Stable across runs, so it doubles as the output header stamp.
pub fn fingerprint(component: &ComponentDefinition, options: &CompileOptions) -> String {
    let payload = serde_json::to_vec(&(env!("CARGO_PKG_VERSION"), options, component))
        .unwrap_or_else(|_| format!("{:?}{:?}", options, component).into_bytes());
    compute_hash(&payload)
}

/// In-memory memoization of successful compiles, keyed by fingerprint.
/// Safe to share across the threads of a batch build.
#[derive(Default)]
pub struct CompileCache {
    entries: Mutex<HashMap<String, CompiledModule>>,
    hits: AtomicUsize,
}

impl CompileCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, CompiledModule>> {
        // A panic while holding the lock cannot leave a half-written entry behind.
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, fingerprint: &str) -> Option<CompiledModule> {
        self.entries().get(fingerprint).cloned()
    }

    /// Failures are never cached; a failing component is re-analyzed on every call.
    pub fn get_or_compile(
        &self,
        component: &ComponentDefinition,
        options: &CompileOptions,
    ) -> Result<CompiledModule, CompileFailure> {
        let key = fingerprint(component, options);
        if let Some(hit) = self.get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            log::debug!("cache hit for `{}` ({})", component.name, &key[..12]);
            return Ok(hit);
        }

        let module = compile_fingerprinted(component, options, key.clone())?;
        self.entries().insert(key, module.clone());
        Ok(module)
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries().clear();
    }
}
