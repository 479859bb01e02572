//! Arena helpers for unit tests.

#[cfg(test)]
pub mod test {
    use super::super::session::CompilationSession;
    use bumpalo::Bump;

    /// Owns the arena a test session borrows from.
    pub struct TestContext {
        arena: Bump,
    }

    impl TestContext {
        pub fn new() -> Self {
            Self { arena: Bump::new() }
        }

        /// Unlimited session on this context's arena.
        pub fn create_session(&self) -> CompilationSession<'_> {
            CompilationSession::new(&self.arena)
        }

        /// Session that fails with out-of-memory once `limit` bytes are charged.
        pub fn create_limited_session(&self, limit: usize) -> CompilationSession<'_> {
            CompilationSession::with_memory_limit(&self.arena, limit)
        }
    }

    impl Default for TestContext {
        fn default() -> Self {
            Self::new()
        }
    }

    pub fn with_test_context<F, R>(f: F) -> R
    where
        F: FnOnce(&TestContext) -> R,
    {
        let ctx = TestContext::new();
        f(&ctx)
    }

    mod tests {
        use super::*;

        #[test]
        fn test_limited_session() {
            with_test_context(|ctx| {
                let session = ctx.create_limited_session(16);
                assert!(session.charge(8).is_ok());
                assert!(session.charge(16).is_err());
                assert_eq!(session.memory_limit(), Some(16));
            });
        }
    }
}
