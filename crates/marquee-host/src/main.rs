use std::process::ExitCode;
use std::sync::Arc;

use marquee_plugin::{global, ContextManager, NativeEngine, RuntimeConfig, WasmEngine};
use serde::Serialize;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Serialize)]
struct RouteInfo {
    pattern: String,
    plugin: String,
}

#[derive(Serialize)]
struct Report {
    version: &'static str,
    contexts: Vec<marquee_plugin::ContextInfo>,
    routes: Vec<RouteInfo>,
}

fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = RuntimeConfig::from_env();
    tracing::info!(
        plugin_dir = %config.plugin_dir.display(),
        memory_limit_mb = config.sandbox.memory_limit / (1024 * 1024),
        fuel_limit = config.sandbox.fuel_limit,
        "starting plugin runtime"
    );

    let manager = ContextManager::new(config.clone());
    manager.register_engine(Arc::new(WasmEngine::new(config.sandbox.clone())));
    manager.register_engine(Arc::new(NativeEngine::new()));
    let manager = match global::init(manager) {
        Ok(manager) => manager,
        Err(e) => {
            tracing::error!("failed to install runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match manager.load_all() {
        Ok(running) => tracing::info!(running, total = manager.len(), "plugins loaded"),
        Err(e) => tracing::warn!(
            path = %config.plugin_dir.display(),
            "could not scan plugin directory: {e}"
        ),
    }

    // Each argument is a URL to open; its page tree is printed.
    for url in std::env::args().skip(1) {
        let page = manager.open(&url);
        println!("── {url}");
        print!("{}", page.dump());
        page.destroy();
    }

    let report = Report {
        version: env!("CARGO_PKG_VERSION"),
        contexts: manager.contexts(),
        routes: manager
            .routes()
            .into_iter()
            .map(|(pattern, plugin)| RouteInfo { pattern, plugin })
            .collect(),
    };
    match serde_json::to_string_pretty(&report) {
        Ok(json) => println!("{json}"),
        Err(e) => tracing::error!("failed to serialize runtime report: {e}"),
    }

    global::shutdown();
    ExitCode::SUCCESS
}
