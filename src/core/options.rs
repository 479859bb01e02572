//! Compile-time configuration.

/// Switches recognized by `Program::compile`.
///
/// All options default to the conservative setting; the builder-style setters
/// make it easy to flip one or two in tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileOptions {
    /// Let the allocator hand out RBP as a general-purpose register.
    pub allow_frame_pointer_register: bool,
    /// Equalize register state at loop back edges and branch merges.
    pub enable_shuffling: bool,
    /// Break register move cycles through the spill slot instead of swaps.
    pub enable_memory_shuffling: bool,
    /// Move spills up to the last write of their register.
    pub enable_total_bubbling: bool,
    /// Report frame slots as negative offsets from the frame base.
    pub use_negative_stack_offsets: bool,
    /// Vector operators have a separate destination (VEX encoding).
    pub use_extended_simd_isa: bool,
    /// Register moves always copy the full register.
    pub avoid_narrow_moves: bool,
    /// Arena budget in bytes.
    pub memory_limit: Option<usize>,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            allow_frame_pointer_register: false,
            enable_shuffling: true,
            enable_memory_shuffling: true,
            enable_total_bubbling: false,
            use_negative_stack_offsets: false,
            use_extended_simd_isa: false,
            avoid_narrow_moves: false,
            memory_limit: None,
        }
    }
}

impl CompileOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_frame_pointer_register(mut self, allow: bool) -> Self {
        self.allow_frame_pointer_register = allow;
        self
    }

    pub fn with_shuffling(mut self, enable: bool) -> Self {
        self.enable_shuffling = enable;
        self
    }

    pub fn with_memory_shuffling(mut self, enable: bool) -> Self {
        self.enable_memory_shuffling = enable;
        self
    }

    pub fn with_total_bubbling(mut self, enable: bool) -> Self {
        self.enable_total_bubbling = enable;
        self
    }

    pub fn with_negative_stack_offsets(mut self, enable: bool) -> Self {
        self.use_negative_stack_offsets = enable;
        self
    }

    pub fn with_extended_simd_isa(mut self, enable: bool) -> Self {
        self.use_extended_simd_isa = enable;
        self
    }

    pub fn with_avoid_narrow_moves(mut self, enable: bool) -> Self {
        self.avoid_narrow_moves = enable;
        self
    }

    pub fn with_memory_limit(mut self, limit: usize) -> Self {
        self.memory_limit = Some(limit);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = CompileOptions::default();
        assert!(options.enable_shuffling);
        assert!(options.enable_memory_shuffling);
        assert!(!options.allow_frame_pointer_register);
        assert!(!options.enable_total_bubbling);
        assert_eq!(options.memory_limit, None);
    }

    #[test]
    fn test_builder_setters() {
        let options = CompileOptions::new()
            .with_frame_pointer_register(true)
            .with_shuffling(false)
            .with_memory_limit(4096);
        assert!(options.allow_frame_pointer_register);
        assert!(!options.enable_shuffling);
        assert_eq!(options.memory_limit, Some(4096));
    }
}
