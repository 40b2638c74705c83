pub mod client;
pub mod relay;

/// Initialize tracing for tests (only once per process).
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("imrelay_server=debug,imrelay_store=debug")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// Extract a string value from a nested JSON path.
pub fn extract_str(data: &Option<serde_json::Value>, path: &[&str]) -> String {
    let mut v = data.as_ref().unwrap().clone();
    for key in path {
        v = v.get(*key).unwrap().clone();
    }
    v.as_str().unwrap().to_string()
}
