//! Host bindings exposed to extension code.
//!
//! A [`HostApi`] is handed to every interpreter heap. It refers to its
//! context weakly, so a heap never keeps its own context alive. Every
//! resource it creates is rooted in that context and torn down at unload.

use std::path::PathBuf;
use std::sync::Weak;
use std::time::Duration;

use marquee_prop::{Prop, SubscriptionOptions};

use crate::context::{Context, ContextInner};
use crate::engine::ScriptFn;
use crate::error::PluginError;
use crate::resource::Resource;
use crate::{route, service, subscription, timer};

/// Maximum log message length from plugins.
const MAX_LOG_MESSAGE_LEN: usize = 2048;

/// Strip control characters (except newline/tab) and truncate.
pub(crate) fn sanitize_log_message(message: &str) -> String {
    let mut chars = message
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t');
    let cleaned: String = chars.by_ref().take(MAX_LOG_MESSAGE_LEN).collect();
    if chars.next().is_some() {
        format!("{cleaned}… (truncated)")
    } else {
        cleaned
    }
}

/// Host side of one context's interpreter.
#[derive(Clone)]
pub struct HostApi {
    ctx: Weak<ContextInner>,
    id: String,
}

impl std::fmt::Debug for HostApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostApi").field("plugin", &self.id).finish()
    }
}

impl HostApi {
    pub(crate) fn new(ctx: &Context) -> Self {
        Self {
            ctx: ctx.downgrade(),
            id: ctx.id().to_string(),
        }
    }

    fn context(&self) -> Result<Context, PluginError> {
        Context::upgrade(&self.ctx).ok_or_else(|| PluginError::NotFound(self.id.clone()))
    }

    /// Identifier of the owning context.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn storage_path(&self) -> Option<PathBuf> {
        Context::upgrade(&self.ctx).map(|ctx| ctx.storage_path().to_path_buf())
    }

    /// Serve URLs matching `pattern` with `handler(page, captures...)`.
    pub fn register_route(&self, pattern: &str, handler: ScriptFn) -> Result<Resource, PluginError> {
        route::register(&self.context()?, pattern, handler)
    }

    /// Call `handler(kind, payload...)` for events on `prop`.
    pub fn subscribe(
        &self,
        prop: &Prop,
        handler: ScriptFn,
        options: SubscriptionOptions,
    ) -> Result<Resource, PluginError> {
        subscription::subscribe(&self.context()?, prop, handler, options)
    }

    /// Call `handler()` after `delay`, once or every `delay` when `repeat`.
    pub fn set_timeout(
        &self,
        delay: Duration,
        handler: ScriptFn,
        repeat: bool,
    ) -> Result<Resource, PluginError> {
        timer::set_timeout(&self.context()?, delay, handler, repeat)
    }

    /// Publish an entry in the global service list.
    pub fn add_service(
        &self,
        title: &str,
        url: &str,
        icon: Option<&str>,
    ) -> Result<Resource, PluginError> {
        service::add_service(&self.context()?, title, url, icon)
    }

    pub fn destroy_resource(&self, resource: &Resource) {
        resource.destroy();
    }

    /// The global service directory.
    pub fn services(&self) -> Result<Prop, PluginError> {
        Ok(self.context()?.shared().services.clone())
    }

    // ── Logging ─────────────────────────────────────────────────────────

    pub fn log_info(&self, message: &str) {
        let msg = sanitize_log_message(message);
        tracing::info!(plugin = %self.id, "{msg}");
    }

    pub fn log_warn(&self, message: &str) {
        let msg = sanitize_log_message(message);
        tracing::warn!(plugin = %self.id, "{msg}");
    }

    pub fn log_error(&self, message: &str) {
        let msg = sanitize_log_message(message);
        tracing::error!(plugin = %self.id, "{msg}");
    }
}
