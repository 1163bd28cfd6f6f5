use std::sync::Once;

pub static INIT_TEST_ONCE: Once = Once::new();

pub struct TestContext {
    pub crate_root: String,
    pub test_name: String,
}

/// Loads `.env` files and installs the tracing subscriber once per test binary.
#[macro_export]
macro_rules! setup_test {
    () => {{
        $crate::test_utils::helpers::INIT_TEST_ONCE.call_once(|| {
            $crate::env::load_optional_env_files();
            $crate::logging::configure_logging().unwrap();
        });

        let cur_thread = std::thread::current();

        $crate::test_utils::helpers::TestContext {
            crate_root: env!("CARGO_MANIFEST_DIR").to_string(),
            test_name: cur_thread.name().unwrap_or("unknown").to_string(),
        }
    }};
}
