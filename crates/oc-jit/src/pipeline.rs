//! Module compilation pipeline
//!
//! `compile_module` validates a module, splits it into chunks, reuses cached
//! objects, compiles the rest on a scoped worker pool, and only then links
//! and publishes. Nothing reaches the executable-address table unless every
//! chunk compiled, verified and linked.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam::channel;
use oc_core::config::Config;
use oc_core::error::JitError;
use oc_core::{jit_debug, jit_trace};
use oc_memory::PageFlags;
use oc_ppu::module::GuestModule;
use oc_ppu::{ExecTable, LinkTable, NativeFunction};
use parking_lot::{Condvar, Mutex};

use crate::backend::{CodegenBackend, LinkContext, ObjectCode, ThreadedBackend, UnitSource};
use crate::cache::{CachedModule, ModuleRegistry, ObjectCache};
use crate::hash::{module_fingerprint, partition, CompilationUnit};
use crate::settings::CodegenSettings;

/// Largest module accepted, in bytes of code
pub const MAX_MODULE_BYTES: u64 = 0x1000_0000;

/// Cooperative cancellation flag shared with a running compile
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Counting semaphore bounding concurrent backend invocations
#[derive(Debug)]
pub struct CompilerSlots {
    free: Mutex<usize>,
    cond: Condvar,
}

impl CompilerSlots {
    pub fn new(slots: usize) -> Self {
        Self {
            free: Mutex::new(slots.max(1)),
            cond: Condvar::new(),
        }
    }

    pub fn acquire(&self) -> SlotGuard<'_> {
        let mut free = self.free.lock();
        while *free == 0 {
            self.cond.wait(&mut free);
        }
        *free -= 1;
        SlotGuard { slots: self }
    }

    pub fn available(&self) -> usize {
        *self.free.lock()
    }
}

pub struct SlotGuard<'a> {
    slots: &'a CompilerSlots,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        *self.slots.free.lock() += 1;
        self.slots.cond.notify_one();
    }
}

#[derive(Debug, Default)]
struct Counters {
    compiled: AtomicU64,
    cache_hits: AtomicU64,
    linked: AtomicU64,
}

/// Snapshot of pipeline counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompileStats {
    /// Chunks handed to the backend
    pub compiled: u64,
    /// Chunks served from the object cache
    pub cache_hits: u64,
    /// Native functions published
    pub linked: u64,
}

/// PPU module recompiler
pub struct Recompiler<B: CodegenBackend = ThreadedBackend> {
    backend: B,
    settings: CodegenSettings,
    table: Arc<ExecTable>,
    cache: ObjectCache,
    registry: ModuleRegistry,
    slots: CompilerSlots,
    links: LinkTable,
    threads: usize,
    max_chunk_bytes: u32,
    max_chunk_functions: usize,
    max_module_bytes: u64,
    cancel: CancelToken,
    counters: Counters,
}

impl Recompiler<ThreadedBackend> {
    pub fn new(config: &Config, table: Arc<ExecTable>) -> Self {
        Self::with_backend(config, table, ThreadedBackend::new())
    }
}

impl<B: CodegenBackend> Recompiler<B> {
    pub fn with_backend(config: &Config, table: Arc<ExecTable>, backend: B) -> Self {
        Self {
            backend,
            settings: CodegenSettings::from_config(&config.cpu),
            table,
            cache: ObjectCache::from_config(&config.cache),
            registry: ModuleRegistry::new(),
            slots: CompilerSlots::new(config.cpu.compiler_slots),
            links: LinkTable::new(),
            threads: config.compile_threads().max(1),
            max_chunk_bytes: config.cpu.max_chunk_bytes,
            max_chunk_functions: config.cpu.max_chunk_functions,
            max_module_bytes: MAX_MODULE_BYTES,
            cancel: CancelToken::new(),
            counters: Counters::default(),
        }
    }

    pub fn with_cache(mut self, cache: ObjectCache) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_module_limit(mut self, bytes: u64) -> Self {
        self.max_module_bytes = bytes;
        self
    }

    pub fn settings(&self) -> &CodegenSettings {
        &self.settings
    }

    pub fn cache(&self) -> &ObjectCache {
        &self.cache
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    pub fn table(&self) -> &Arc<ExecTable> {
        &self.table
    }

    /// Token that cancels compiles in progress
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn stats(&self) -> CompileStats {
        CompileStats {
            compiled: self.counters.compiled.load(Ordering::Relaxed),
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
            linked: self.counters.linked.load(Ordering::Relaxed),
        }
    }

    /// Compile and publish every function of `module`
    ///
    /// Returns whether any chunk had to be compiled.
    pub fn compile_module(&self, module: &GuestModule) -> Result<bool, JitError> {
        let settings = self.settings.encode();
        module.validate()?;
        let size = module.code_size();
        if size > self.max_module_bytes {
            return Err(JitError::ModuleTooLarge {
                module: module.name.clone(),
                size,
                limit: self.max_module_bytes,
            });
        }

        let cpu = self.backend.target_cpu();
        let units: Vec<CompilationUnit> = partition(module, self.max_chunk_bytes, self.max_chunk_functions)
            .into_iter()
            .map(|functions| CompilationUnit::new(module, functions, &self.settings, &cpu))
            .collect();
        let fingerprint = module_fingerprint(module, &units);
        if self.registry.contains(&module.name, settings, &fingerprint) {
            jit_debug!("{} already linked", module.name);
            return Ok(false);
        }

        let mut objects: Vec<Option<ObjectCode>> = units.iter().map(|unit| self.cached(unit)).collect();
        let pending: Vec<usize> = (0..units.len()).filter(|&i| objects[i].is_none()).collect();
        jit_debug!(
            "{}: {} chunks, {} cached",
            module.name,
            units.len(),
            units.len() - pending.len()
        );

        if !pending.is_empty() {
            for (index, object) in self.compile_units(module, &units, &pending)? {
                objects[index] = Some(object);
            }
        }

        if self.cancel.is_cancelled() {
            return Err(JitError::Cancelled);
        }

        let ctx = LinkContext {
            module,
            links: &self.links,
        };
        let mut linked: Vec<(String, Vec<NativeFunction>)> = Vec::with_capacity(units.len());
        for (unit, object) in units.iter().zip(&objects) {
            let object = object.as_ref().ok_or_else(|| JitError::Backend {
                chunk: unit.object.clone(),
                reason: "object missing after compilation".to_string(),
            })?;
            linked.push((unit.object.clone(), self.backend.load(object, &ctx)?));
        }

        let record = self.publish(module, settings, fingerprint, linked)?;
        tracing::info!(
            target: "jit",
            "Linked {} ({} functions, {} chunks compiled)",
            module.name,
            record.function_count(),
            pending.len()
        );
        if let Some(previous) = self.registry.insert(record) {
            jit_debug!("{} replaces an earlier load", module.name);
            self.retire(&previous);
        }
        Ok(!pending.is_empty())
    }

    /// Evict a module and return its code to the interpreter
    pub fn unload_module(&self, module: &GuestModule) -> bool {
        let removed = self.registry.remove(&module.name);
        for segment in module.segments.iter().filter(|s| s.flags.contains(PageFlags::EXECUTE)) {
            self.table.reset_segment(segment.addr, segment.size);
        }
        if let Some(record) = &removed {
            self.retire(record);
        }
        jit_debug!("unloaded {}", module.name);
        removed.is_some()
    }

    /// Unpublish a load's entries that nothing has replaced and free its ids
    fn retire(&self, record: &CachedModule) {
        let mut ids = Vec::with_capacity(record.function_count());
        for &(addr, id) in record.objects.values().flatten() {
            self.table.unpublish_native(addr, id);
            ids.push(id);
        }
        self.table.release_native(&ids);
    }

    /// Verified object from the cache, if any
    fn cached(&self, unit: &CompilationUnit) -> Option<ObjectCode> {
        let object = self.cache.load(&unit.object)?;
        if let Err(err) = self.backend.verify(&object) {
            tracing::warn!(target: "jit", "Cached object rejected: {}", err);
            self.cache.remove(&unit.object);
            return None;
        }
        self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
        Some(object)
    }

    fn compile_units(
        &self,
        module: &GuestModule,
        units: &[CompilationUnit],
        pending: &[usize],
    ) -> Result<Vec<(usize, ObjectCode)>, JitError> {
        let workers = self.threads.min(pending.len());
        let (job_tx, job_rx) = channel::unbounded::<usize>();
        for &index in pending {
            job_tx.send(index).map_err(|_| JitError::Cancelled)?;
        }
        drop(job_tx);

        let (result_tx, result_rx) = channel::unbounded();
        let failed = AtomicBool::new(false);
        std::thread::scope(|scope| {
            for _ in 0..workers {
                let jobs = job_rx.clone();
                let results = result_tx.clone();
                let failed = &failed;
                scope.spawn(move || {
                    while let Ok(index) = jobs.recv() {
                        if self.cancel.is_cancelled() || failed.load(Ordering::Acquire) {
                            break;
                        }
                        let result = self.compile_unit(module, &units[index]);
                        if result.is_err() {
                            failed.store(true, Ordering::Release);
                        }
                        if results.send((index, result)).is_err() {
                            break;
                        }
                    }
                });
            }
        });
        drop(result_tx);

        let mut compiled = Vec::with_capacity(pending.len());
        let mut first_error = None;
        for (index, result) in result_rx.try_iter() {
            match result {
                Ok(object) => compiled.push((index, object)),
                Err(err) => {
                    tracing::error!(target: "jit", "{}: {}", module.name, err);
                    first_error.get_or_insert(err);
                }
            }
        }
        if let Some(err) = first_error {
            return Err(err);
        }
        if self.cancel.is_cancelled() {
            return Err(JitError::Cancelled);
        }
        Ok(compiled)
    }

    fn compile_unit(&self, module: &GuestModule, unit: &CompilationUnit) -> Result<ObjectCode, JitError> {
        let _slot = self.slots.acquire();
        let source = UnitSource {
            object: &unit.object,
            module,
            functions: unit.functions.iter().map(|&i| &module.functions[i]).collect(),
        };
        let object = self.backend.compile(&source, &self.settings)?;
        self.backend.verify(&object)?;
        if let Err(err) = self.cache.store(&object) {
            tracing::warn!(target: "jit", "Failed to cache {}: {}", unit.object, err);
        }
        self.counters.compiled.fetch_add(1, Ordering::Relaxed);
        jit_trace!("compiled {} ({} functions)", unit.object, unit.functions.len());
        Ok(object)
    }

    /// Publish every linked function, or nothing when the arena cannot
    /// hold them all
    fn publish(
        &self,
        module: &GuestModule,
        settings: u16,
        fingerprint: String,
        mut linked: Vec<(String, Vec<NativeFunction>)>,
    ) -> Result<CachedModule, JitError> {
        for (_, functions) in &mut linked {
            functions.retain(|function| {
                let inside = self.table.contains(function.addr);
                if !inside {
                    tracing::warn!(target: "jit", "0x{:08x} is outside the executable table", function.addr);
                }
                inside
            });
        }
        let total: usize = linked.iter().map(|(_, functions)| functions.len()).sum();
        let mut ids = self
            .table
            .reserve_native(total)
            .ok_or_else(|| JitError::Backend {
                chunk: module.name.clone(),
                reason: format!("native function arena cannot hold {} more functions", total),
            })?
            .into_iter();

        let mut record = CachedModule {
            name: module.name.clone(),
            settings,
            fingerprint,
            objects: HashMap::with_capacity(linked.len()),
        };
        for (object, functions) in linked {
            let mut entries = Vec::with_capacity(functions.len());
            for (function, id) in functions.into_iter().zip(&mut ids) {
                let addr = function.addr;
                let reloc = module
                    .segment_of(addr, function.size)
                    .map(|(index, _)| index as u16)
                    .unwrap_or(0);
                self.table.fill_native(id, function);
                if !self.table.publish_native(addr, id, reloc) {
                    self.table.release_native(&[id]);
                    continue;
                }
                self.counters.linked.fetch_add(1, Ordering::Relaxed);
                entries.push((addr, id));
            }
            record.objects.insert(object, entries);
        }
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn test_cancel_token_is_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
        token.reset();
        assert!(!clone.is_cancelled());
    }

    #[test]
    fn test_slots_bound_concurrency() {
        let slots = CompilerSlots::new(2);
        let running = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        std::thread::scope(|scope| {
            for _ in 0..6 {
                scope.spawn(|| {
                    let _slot = slots.acquire();
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(5));
                    running.fetch_sub(1, Ordering::SeqCst);
                });
            }
        });
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(slots.available(), 2);
    }
}
