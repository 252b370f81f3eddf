//! Thread stack memory and physical frames.
//!
//! A thread stack is a block of machine words addressed by word index and
//! growing towards lower addresses. Next to every word the stack keeps a
//! [`SlotTag`] so the collector can tell references from integers in
//! interpreter frames.
//!
//! Every physical frame, whatever its kind, links to its caller the same
//! way:
//!
//! ```text
//!   fp + 1 │ return pc (caller's pc)  │
//!   fp     │ saved caller fp          │   0 in the entry frame
//!          │ ...frame body...         │
//!   sp     │ lowest word of the frame │
//! ```
//!
//! and the caller's stack pointer is `fp + 2`.

use kiln_core::{KilnError, KilnResult, SlotTag, StackSlot};
use std::fmt;

/// Lowest valid stack address. Anything below is never dereferenced.
pub const STACK_ORIGIN: usize = 0x1000;

/// Number of callee-saved registers in a [`RegisterMap`].
pub const REGISTER_COUNT: usize = 16;

// =============================================================================
// Frame
// =============================================================================

/// A physical activation, identified by its frame pointer.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Frame {
    pub sp: usize,
    pub fp: usize,
    pub pc: usize,
}

impl Frame {
    #[inline]
    pub const fn new(sp: usize, fp: usize, pc: usize) -> Self {
        Self { sp, fp, pc }
    }

    /// Stable id used by `deoptimize_frame`.
    #[inline]
    pub const fn id(&self) -> usize {
        self.fp
    }

    /// Stack pointer of the caller.
    #[inline]
    pub const fn sender_sp(&self) -> usize {
        self.fp + 2
    }

    /// Words between `sp` and the caller's stack pointer.
    #[inline]
    pub const fn size(&self) -> usize {
        self.sender_sp() - self.sp
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Frame(sp={:#x}, fp={:#x}, pc={:#x})", self.sp, self.fp, self.pc)
    }
}

/// Callee-saved register snapshot taken when compiled code traps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegisterMap {
    regs: [u64; REGISTER_COUNT],
}

impl RegisterMap {
    pub const fn new() -> Self {
        Self {
            regs: [0; REGISTER_COUNT],
        }
    }

    #[inline]
    pub fn get(&self, reg: u16) -> Option<u64> {
        self.regs.get(reg as usize).copied()
    }

    #[inline]
    pub fn set(&mut self, reg: u16, value: u64) {
        self.regs[reg as usize] = value;
    }
}

// =============================================================================
// ThreadStack
// =============================================================================

/// Word-addressed stack memory with a parallel tag map.
pub struct ThreadStack {
    words: Vec<u64>,
    tags: Vec<SlotTag>,
    sp: usize,
}

impl fmt::Debug for ThreadStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadStack")
            .field("capacity", &self.words.len())
            .field("sp", &format_args!("{:#x}", self.sp))
            .finish()
    }
}

impl ThreadStack {
    pub fn new(capacity: usize) -> Self {
        Self {
            words: vec![0; capacity],
            tags: vec![SlotTag::Dead; capacity],
            sp: STACK_ORIGIN + capacity,
        }
    }

    #[inline]
    pub fn origin(&self) -> usize {
        STACK_ORIGIN
    }

    /// One past the highest word.
    #[inline]
    pub fn top(&self) -> usize {
        STACK_ORIGIN + self.words.len()
    }

    #[inline]
    pub fn sp(&self) -> usize {
        self.sp
    }

    /// Move the stack pointer.
    ///
    /// # Panics
    ///
    /// Panics if `sp` lies outside the stack.
    pub fn set_sp(&mut self, sp: usize) {
        assert!(
            (self.origin()..=self.top()).contains(&sp),
            "stack pointer {sp:#x} outside [{:#x}, {:#x}]",
            self.origin(),
            self.top()
        );
        self.sp = sp;
    }

    /// Words free below the stack pointer.
    #[inline]
    pub fn available(&self) -> usize {
        self.sp - self.origin()
    }

    /// Check that `words` more words fit and return the new stack pointer.
    pub fn reserve(&self, words: usize) -> KilnResult<usize> {
        if words > self.available() {
            return Err(KilnError::StackOverflow {
                needed: words,
                available: self.available(),
            });
        }
        Ok(self.sp - words)
    }

    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        (self.origin()..self.top()).contains(&addr)
    }

    #[inline]
    fn index(&self, addr: usize) -> Option<usize> {
        self.contains(addr).then(|| addr - STACK_ORIGIN)
    }

    /// Read a word; `None` outside the stack.
    #[inline]
    pub fn read(&self, addr: usize) -> Option<u64> {
        self.index(addr).map(|i| self.words[i])
    }

    #[inline]
    pub fn tag(&self, addr: usize) -> Option<SlotTag> {
        self.index(addr).map(|i| self.tags[i])
    }

    /// Write an untagged (integer) word.
    ///
    /// # Panics
    ///
    /// Panics when `addr` is outside the stack.
    pub fn write(&mut self, addr: usize, word: u64) {
        self.write_tagged(addr, SlotTag::Int, word);
    }

    fn write_tagged(&mut self, addr: usize, tag: SlotTag, word: u64) {
        let Some(i) = self.index(addr) else {
            panic!("stack write at {addr:#x} outside [{:#x}, {:#x})", self.origin(), self.top());
        };
        self.words[i] = word;
        self.tags[i] = tag;
    }

    /// Store a tagged slot. Dead slots are zeroed when `zap` is set,
    /// otherwise only their tag changes.
    pub fn write_slot(&mut self, addr: usize, slot: StackSlot, zap: bool) {
        match slot {
            StackSlot::Dead if !zap => {
                if let Some(i) = self.index(addr) {
                    self.tags[i] = SlotTag::Dead;
                } else {
                    panic!("stack write at {addr:#x} outside stack");
                }
            }
            _ => self.write_tagged(addr, slot.tag(), slot.to_word()),
        }
    }

    /// Read a tagged slot.
    pub fn read_slot(&self, addr: usize) -> Option<StackSlot> {
        let i = self.index(addr)?;
        Some(StackSlot::from_word(self.tags[i], self.words[i]))
    }

    /// Link a new frame below `sp`: store the return pc and saved frame
    /// pointer and return the new frame pointer.
    pub fn push_link(&mut self, sp: usize, return_pc: usize, saved_fp: usize) -> usize {
        let fp = sp - 2;
        self.write(fp + 1, return_pc as u64);
        self.write(fp, saved_fp as u64);
        fp
    }
}
