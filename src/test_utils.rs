//! Test utilities and global setup

/// Test logging utilities
#[cfg(all(test, feature = "test-logging"))]
pub mod logging {
    use std::sync::Once;
    use tracing_subscriber::{EnvFilter, fmt};

    static INIT: Once = Once::new();

    /// Initialize test logging globally; safe to call multiple times
    ///
    /// Respects `RUST_LOG`, defaulting to debug for this crate. Install it for
    /// a whole test module with:
    ///
    /// ```rust,ignore
    /// #[cfg(feature = "test-logging")]
    /// #[ctor::ctor]
    /// fn init_test_logging() {
    ///     crate::test_utils::logging::init();
    /// }
    /// ```
    ///
    /// ```bash
    /// RUST_LOG=lsp_session_manager::workspace=trace cargo test --features test-logging
    /// ```
    pub fn init() {
        INIT.call_once(|| {
            let env_filter = EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("debug,tokio=info"));

            fmt()
                .with_env_filter(env_filter)
                .with_test_writer()
                .with_target(true)
                .with_thread_ids(true)
                .compact()
                .try_init()
                .ok();
        });
    }
}

/// Install test logging for every test in the invoking module
#[cfg(all(test, feature = "test-logging"))]
#[macro_export]
macro_rules! setup_test_logging {
    () => {
        #[ctor::ctor]
        fn init_test_logging() {
            $crate::test_utils::logging::init();
        }
    };
}
