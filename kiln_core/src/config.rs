//! Runtime tuning for deoptimization and stack walking.
//!
//! Trap limits decide how quickly a misbehaving compiled method is thrown
//! away; walk limits bound asynchronous stack sampling.

/// Configuration for the deoptimization runtime.
///
/// # Example
///
/// ```
/// use kiln_core::KilnConfig;
///
/// // Recompile after the first repeated trap at a bytecode.
/// let config = KilnConfig {
///     per_bytecode_trap_limit: 1,
///     ..Default::default()
/// };
/// assert_eq!(config.per_method_trap_limit, 100);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KilnConfig {
    // =========================================================================
    // Trap policy
    // =========================================================================
    /// Traps at a single bytecode before its compiled method is invalidated.
    ///
    /// The first trap at a bytecode only records the reason. Once a trap
    /// repeats and the per-bytecode count reaches this limit, the method is
    /// made not entrant so the compiler can see the failed speculation.
    ///
    /// Default: 4
    pub per_bytecode_trap_limit: u32,

    /// Traps of one reason anywhere in a method before it is invalidated.
    ///
    /// Default: 100
    pub per_method_trap_limit: u32,

    /// Repeated recompilations at one bytecode before giving up on the method.
    ///
    /// Default: 200
    pub per_bytecode_recompilation_cutoff: u32,

    /// Total decompilations of a method before giving up on it.
    ///
    /// Default: 400
    pub per_method_recompilation_cutoff: u32,

    // =========================================================================
    // Stack walking
    // =========================================================================
    /// Native frames skipped while looking for the first Java frame.
    ///
    /// Asynchronous samplers stop with `NoJavaFrame` once this many
    /// non-Java frames have been seen at the top of the stack.
    ///
    /// Default: 30
    pub max_c_frames_skip: usize,

    /// Upper bound on frames produced by one walk.
    ///
    /// Default: 1024
    pub max_walk_depth: usize,

    // =========================================================================
    // Frame reconstruction
    // =========================================================================
    /// Write zero into dead interpreter slots.
    ///
    /// Disabling this leaves whatever the skeletal frame contained, which
    /// the collector must then never scan.
    ///
    /// Default: true
    pub zap_dead_slots: bool,
}

impl Default for KilnConfig {
    fn default() -> Self {
        Self {
            per_bytecode_trap_limit: 4,
            per_method_trap_limit: 100,
            per_bytecode_recompilation_cutoff: 200,
            per_method_recompilation_cutoff: 400,
            max_c_frames_skip: 30,
            max_walk_depth: 1024,
            zap_dead_slots: true,
        }
    }
}

impl KilnConfig {
    /// Low limits that reach every policy outcome within a handful of traps.
    pub fn aggressive() -> Self {
        Self {
            per_bytecode_trap_limit: 2,
            per_method_trap_limit: 8,
            per_bytecode_recompilation_cutoff: 2,
            per_method_recompilation_cutoff: 4,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let c = KilnConfig::default();
        assert_eq!(c.per_bytecode_trap_limit, 4);
        assert_eq!(c.max_c_frames_skip, 30);
        assert!(c.zap_dead_slots);
    }

    #[test]
    fn test_aggressive_keeps_walk_defaults() {
        let c = KilnConfig::aggressive();
        assert_eq!(c.per_bytecode_trap_limit, 2);
        assert_eq!(c.max_walk_depth, KilnConfig::default().max_walk_depth);
    }
}
