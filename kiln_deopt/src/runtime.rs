//! Shared VM services.
//!
//! [`Runtime`] bundles what every deoptimization and stack walk consults:
//! configuration, the code cache, the method table, the frame geometry,
//! and the heap and monitor services used while rebuilding frames.

use crate::geometry::{FrameGeometry, Word64Geometry};
use crate::heap::Heap;
use crate::interpreter::{DEOPT_HANDLER_PC, is_interpreter_pc};
use crate::monitors::MonitorService;
use kiln_code::{CodeCache, CollectorMode, CompiledMethod};
use kiln_core::{KilnConfig, Method, MethodId};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// What kind of code a pc belongs to.
#[derive(Debug, Clone)]
pub enum CodeKind {
    Interpreter,
    Compiled(Arc<CompiledMethod>),
    /// Return address patched for lazy deoptimization.
    DeoptHandler,
    /// Stubs, the VM itself and foreign code.
    Native,
}

/// VM-wide state shared by all threads.
pub struct Runtime {
    config: KilnConfig,
    code_cache: CodeCache,
    methods: RwLock<FxHashMap<MethodId, Arc<Method>>>,
    geometry: Box<dyn FrameGeometry>,
    heap: Arc<dyn Heap>,
    monitors: Arc<dyn MonitorService>,
    gc_active: AtomicBool,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.config)
            .field("code_cache", &self.code_cache.len())
            .field("methods", &self.methods.read().len())
            .finish_non_exhaustive()
    }
}

impl Runtime {
    pub fn new(config: KilnConfig, heap: Arc<dyn Heap>, monitors: Arc<dyn MonitorService>) -> Self {
        Self {
            config,
            code_cache: CodeCache::new(CollectorMode::default()),
            methods: RwLock::new(FxHashMap::default()),
            geometry: Box::new(Word64Geometry),
            heap,
            monitors,
            gc_active: AtomicBool::new(false),
        }
    }

    pub fn with_geometry(mut self, geometry: impl FrameGeometry + 'static) -> Self {
        self.geometry = Box::new(geometry);
        self
    }

    pub fn with_collector_mode(mut self, mode: CollectorMode) -> Self {
        self.code_cache = CodeCache::new(mode);
        self
    }

    #[inline]
    pub fn config(&self) -> &KilnConfig {
        &self.config
    }

    #[inline]
    pub fn code_cache(&self) -> &CodeCache {
        &self.code_cache
    }

    #[inline]
    pub fn geometry(&self) -> &dyn FrameGeometry {
        self.geometry.as_ref()
    }

    #[inline]
    pub fn heap(&self) -> &dyn Heap {
        self.heap.as_ref()
    }

    #[inline]
    pub fn monitors(&self) -> &dyn MonitorService {
        self.monitors.as_ref()
    }

    // =========================================================================
    // Methods and code
    // =========================================================================

    pub fn register_method(&self, method: Arc<Method>) {
        self.methods.write().insert(method.id(), method);
    }

    pub fn method(&self, id: MethodId) -> Option<Arc<Method>> {
        self.methods.read().get(&id).cloned()
    }

    /// Install compiled code, registering every method it inlines.
    pub fn install(&self, nm: CompiledMethod) -> Arc<CompiledMethod> {
        {
            let mut methods = self.methods.write();
            methods.entry(nm.method().id()).or_insert_with(|| nm.method().clone());
            for desc in nm.pc_descs().iter() {
                let Some(scope) = nm.debug_info().scope_at(desc) else {
                    continue;
                };
                for s in scope.chain() {
                    methods.entry(s.method().id()).or_insert_with(|| s.method().clone());
                }
            }
        }
        self.code_cache.install(nm)
    }

    pub fn code_kind(&self, pc: usize) -> CodeKind {
        if is_interpreter_pc(pc) {
            CodeKind::Interpreter
        } else if pc == DEOPT_HANDLER_PC {
            CodeKind::DeoptHandler
        } else if let Some(nm) = self.code_cache.find_by_pc(pc) {
            CodeKind::Compiled(nm)
        } else {
            CodeKind::Native
        }
    }

    // =========================================================================
    // Collector state
    // =========================================================================

    /// A collection is in progress; heap and frames may be inconsistent.
    #[inline]
    pub fn is_gc_active(&self) -> bool {
        self.gc_active.load(Ordering::Acquire)
    }

    pub fn set_gc_active(&self, active: bool) {
        self.gc_active.store(active, Ordering::Release);
    }
}
