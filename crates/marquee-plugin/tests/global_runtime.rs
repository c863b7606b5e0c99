mod common;

use marquee_plugin::{global, NativeEngine};
use std::sync::Arc;

#[test]
fn global_manager_serves_routes_until_shutdown() {
    let manager = global::init(common::test_manager()).unwrap();
    let engine = NativeEngine::new();
    common::titled_route(&engine, "hello", "hello:.*", "Hello");
    manager.register_engine(Arc::new(engine.clone()));
    common::load_native(&manager, "hello", &engine);

    let page = global::get().unwrap().open("hello:world");
    assert_eq!(common::title_of(&page).as_deref(), Some("Hello"));

    global::shutdown();
    assert!(global::get().is_none());
    assert!(manager.is_empty());
}
