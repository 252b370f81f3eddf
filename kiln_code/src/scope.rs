//! Debug information: scopes, values and eliminated objects.
//!
//! The compiler records, for every [`PcDesc`](crate::PcDesc), a chain of
//! scopes from the innermost inlined method out to the physical method.
//! Each scope says where every local, expression-stack entry and monitor
//! of that logical frame lives in the compiled frame. Objects removed by
//! escape analysis are described once per pc in an object pool and
//! referenced from scope values by id.

use crate::pc_desc::{PcDesc, SERIALIZED_NULL};
use kiln_core::{BasicType, Bci, ClassId, Method, ObjRef};
use std::sync::Arc;

// =============================================================================
// Values
// =============================================================================

/// Where a value lives in a compiled frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Location {
    /// Word offset from the frame's stack pointer.
    Stack(u32),
    /// Callee-saved register number.
    Register(u16),
}

/// One recorded value of a logical frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeValue {
    /// Value stored in the frame with the given type.
    Located { at: Location, ty: BasicType },
    ConstInt(i64),
    ConstRef(ObjRef),
    /// Scalar-replaced object, by id in the pc's object pool.
    Object(u32),
    /// Dead or conflicting value.
    Illegal,
}

impl ScopeValue {
    #[inline]
    pub const fn stack(offset: u32, ty: BasicType) -> Self {
        ScopeValue::Located { at: Location::Stack(offset), ty }
    }

    #[inline]
    pub const fn register(reg: u16, ty: BasicType) -> Self {
        ScopeValue::Located { at: Location::Register(reg), ty }
    }

    #[inline]
    pub const fn is_illegal(&self) -> bool {
        matches!(self, ScopeValue::Illegal)
    }
}

/// A monitor held by a logical frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorValue {
    /// The locked object.
    pub owner: ScopeValue,
    /// Stack slot of the lock record.
    pub basic_lock: Location,
    /// Locking was elided by the compiler and must be redone on deopt.
    pub eliminated: bool,
}

/// Shape of a scalar-replaced allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Instance,
    PrimitiveArray(BasicType),
    ReferenceArray,
}

/// A scalar-replaced object and the recorded values of its fields.
///
/// For instances, `field_values` follows declaration layout: supertype
/// fields first, each class's fields by offset, two values per long or
/// double field. For arrays it holds one value per element slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectValue {
    pub id: u32,
    pub class: ClassId,
    pub kind: ObjectKind,
    pub field_values: Vec<ScopeValue>,
}

// =============================================================================
// Scope records
// =============================================================================

/// Serialized description of one logical frame.
#[derive(Debug, Clone)]
pub struct ScopeRecord {
    pub method: Arc<Method>,
    pub bci: Bci,
    pub reexecute: bool,
    /// Decode offset of the calling scope, `SERIALIZED_NULL` for the outermost.
    pub sender: i32,
    pub locals: Vec<ScopeValue>,
    pub expressions: Vec<ScopeValue>,
    pub monitors: Vec<MonitorValue>,
}

impl ScopeRecord {
    pub fn new(method: Arc<Method>, bci: Bci) -> Self {
        Self {
            method,
            bci,
            reexecute: false,
            sender: SERIALIZED_NULL,
            locals: Vec::new(),
            expressions: Vec::new(),
            monitors: Vec::new(),
        }
    }

    pub fn with_sender(mut self, sender: i32) -> Self {
        self.sender = sender;
        self
    }

    pub fn with_locals(mut self, locals: Vec<ScopeValue>) -> Self {
        self.locals = locals;
        self
    }

    pub fn with_expressions(mut self, expressions: Vec<ScopeValue>) -> Self {
        self.expressions = expressions;
        self
    }

    pub fn with_monitors(mut self, monitors: Vec<MonitorValue>) -> Self {
        self.monitors = monitors;
        self
    }

    pub fn with_reexecute(mut self, reexecute: bool) -> Self {
        self.reexecute = reexecute;
        self
    }
}

/// All debug information of one compiled method.
#[derive(Debug, Clone, Default)]
pub struct DebugInfo {
    scopes: Vec<ScopeRecord>,
    object_pools: Vec<Vec<ObjectValue>>,
}

impl DebugInfo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a scope, returning its decode offset.
    pub fn add_scope(&mut self, scope: ScopeRecord) -> i32 {
        self.scopes.push(scope);
        (self.scopes.len() - 1) as i32
    }

    /// Append an eliminated-object pool, returning its decode offset.
    pub fn add_objects(&mut self, objects: Vec<ObjectValue>) -> i32 {
        self.object_pools.push(objects);
        (self.object_pools.len() - 1) as i32
    }

    pub fn scope(&self, decode_offset: i32) -> Option<&ScopeRecord> {
        usize::try_from(decode_offset).ok().and_then(|i| self.scopes.get(i))
    }

    pub fn objects(&self, decode_offset: i32) -> &[ObjectValue] {
        usize::try_from(decode_offset)
            .ok()
            .and_then(|i| self.object_pools.get(i))
            .map_or(&[], Vec::as_slice)
    }

    /// Decode the innermost scope recorded at `pc`.
    pub fn scope_at(&self, pc: &PcDesc) -> Option<ScopeDesc<'_>> {
        let record = self.scope(pc.scope_decode_offset)?;
        Some(ScopeDesc {
            info: self,
            decode_offset: pc.scope_decode_offset,
            obj_decode_offset: pc.obj_decode_offset,
            reexecute: record.reexecute || pc.should_reexecute(),
            record,
        })
    }

    /// Check that every sender chain terminates inside the table.
    pub fn verify(&self) -> Result<(), String> {
        for (i, scope) in self.scopes.iter().enumerate() {
            let mut hops = 0;
            let mut next = scope.sender;
            while next != SERIALIZED_NULL {
                if self.scope(next).is_none() {
                    return Err(format!("scope {i}: dangling sender {next}"));
                }
                hops += 1;
                if hops > self.scopes.len() {
                    return Err(format!("scope {i}: sender cycle"));
                }
                next = self.scopes[next as usize].sender;
            }
        }
        Ok(())
    }
}

// =============================================================================
// ScopeDesc
// =============================================================================

/// A decoded scope: one logical frame at one pc.
#[derive(Debug, Clone, Copy)]
pub struct ScopeDesc<'a> {
    info: &'a DebugInfo,
    record: &'a ScopeRecord,
    decode_offset: i32,
    obj_decode_offset: i32,
    reexecute: bool,
}

impl<'a> ScopeDesc<'a> {
    #[inline]
    pub fn method(&self) -> &'a Arc<Method> {
        &self.record.method
    }

    #[inline]
    pub fn bci(&self) -> Bci {
        self.record.bci
    }

    #[inline]
    pub fn should_reexecute(&self) -> bool {
        self.reexecute
    }

    #[inline]
    pub fn decode_offset(&self) -> i32 {
        self.decode_offset
    }

    #[inline]
    pub fn locals(&self) -> &'a [ScopeValue] {
        &self.record.locals
    }

    #[inline]
    pub fn expressions(&self) -> &'a [ScopeValue] {
        &self.record.expressions
    }

    #[inline]
    pub fn monitors(&self) -> &'a [MonitorValue] {
        &self.record.monitors
    }

    /// Eliminated objects visible at this pc. Shared by every scope of the chain.
    #[inline]
    pub fn objects(&self) -> &'a [ObjectValue] {
        self.info.objects(self.obj_decode_offset)
    }

    #[inline]
    pub fn is_outermost(&self) -> bool {
        self.record.sender == SERIALIZED_NULL
    }

    /// The calling scope, or `None` at the physical method.
    pub fn sender(&self) -> Option<ScopeDesc<'a>> {
        let record = self.info.scope(self.record.sender)?;
        Some(ScopeDesc {
            info: self.info,
            record,
            decode_offset: self.record.sender,
            obj_decode_offset: self.obj_decode_offset,
            reexecute: record.reexecute,
        })
    }

    /// This scope and all its senders, innermost first.
    pub fn chain(self) -> impl Iterator<Item = ScopeDesc<'a>> {
        std::iter::successors(Some(self), ScopeDesc::sender)
    }
}
