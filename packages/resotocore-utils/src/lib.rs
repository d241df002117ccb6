pub mod context;
pub mod entity_store;

pub use context::AppContext;
pub use entity_store::{Collection, CollectionHandle, EntityCollection, EntityStore, EntityStoreError};

/// The test version of tracing init does not take a config since config
/// itself is tested and modified from different parallel tests; it only
/// uses the default directives. Guarded so repeated calls across tests in
/// one process don't panic on a double-init.
#[cfg(any(test, feature = "test-utils"))]
pub fn init_tracing_tests() {
    use std::sync::LazyLock;

    static INIT: LazyLock<std::sync::Mutex<bool>> = LazyLock::new(|| std::sync::Mutex::new(false));
    let mut init = INIT.lock().unwrap();
    if !*init {
        *init = true;
        let _ = tracing_subscriber::fmt::try_init();
    }
}
