//! URL routes and navigation dispatch.
//!
//! Routes live in one process-wide list ordered by registration time; the
//! first pattern that matches the whole URL wins. Each route is a rooted
//! resource of the context that registered it.

use std::sync::{Arc, PoisonError, RwLock, Weak};

use marquee_prop::Prop;
use regex::Regex;

use crate::context::{Context, ContextInner, ContextState};
use crate::engine::{ScriptFn, ScriptValue};
use crate::error::PluginError;
use crate::manager::Shared;
use crate::resource::{Resource, ResourceClass};

pub static ROUTE_CLASS: ResourceClass = ResourceClass {
    name: "route",
    destroy: destroy_route,
    size: std::mem::size_of::<RoutePayload>(),
};

struct RoutePayload {
    shared: Weak<Shared>,
}

fn destroy_route(resource: &Resource) {
    let Some(payload) = resource.payload::<RoutePayload>() else {
        return;
    };
    if let Some(shared) = payload.shared.upgrade() {
        shared.routes.remove(resource.id());
    }
}

pub(crate) struct RouteEntry {
    resource_id: u64,
    pattern: String,
    regex: Regex,
    handler: ScriptFn,
    ctx: Weak<ContextInner>,
}

/// Ordered match list shared by every context of one manager.
#[derive(Default)]
pub(crate) struct RouteTable {
    entries: RwLock<Vec<Arc<RouteEntry>>>,
}

impl RouteTable {
    fn push(&self, entry: RouteEntry) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(entry));
    }

    fn remove(&self, resource_id: u64) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|e| e.resource_id != resource_id);
    }

    fn contains(&self, entry: &Arc<RouteEntry>) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|e| Arc::ptr_eq(e, entry))
    }

    fn snapshot(&self) -> Vec<Arc<RouteEntry>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Registered patterns in match order, with their owning context.
    pub(crate) fn patterns(&self) -> Vec<(String, String)> {
        self.snapshot()
            .iter()
            .map(|e| {
                let owner = Context::upgrade(&e.ctx)
                    .map(|c| c.id().to_string())
                    .unwrap_or_default();
                (e.pattern.clone(), owner)
            })
            .collect()
    }

    /// First live route matching `url`, with its capture groups.
    fn find(&self, url: &str) -> Option<(Arc<RouteEntry>, Context, Vec<ScriptValue>)> {
        self.snapshot().into_iter().find_map(|entry| {
            let ctx = Context::upgrade(&entry.ctx)?;
            if ctx.state() != ContextState::Running {
                return None;
            }
            let caps = entry.regex.captures(url)?;
            let groups = caps
                .iter()
                .skip(1)
                .map(|g| match g {
                    Some(m) => ScriptValue::String(m.as_str().to_string()),
                    None => ScriptValue::Undefined,
                })
                .collect();
            Some((entry, ctx, groups))
        })
    }
}

/// Register `pattern` for `ctx`. The route takes effect immediately but
/// only matches once the context is running.
pub(crate) fn register(ctx: &Context, pattern: &str, handler: ScriptFn) -> Result<Resource, PluginError> {
    let regex = Regex::new(&format!("^(?:{pattern})$"))?;
    let resource = Resource::alloc(
        &ROUTE_CLASS,
        ctx,
        RoutePayload {
            shared: Arc::downgrade(ctx.shared()),
        },
    );
    if let Err(e) = resource.root() {
        let _ = resource.release();
        return Err(e);
    }
    ctx.shared().routes.push(RouteEntry {
        resource_id: resource.id(),
        pattern: pattern.to_string(),
        regex,
        handler,
        ctx: ctx.downgrade(),
    });
    tracing::debug!(plugin = %ctx.id(), route = %pattern, "route registered");
    Ok(resource)
}

/// Run the handler of the first route matching `url` on a fresh page.
pub(crate) fn dispatch(table: &RouteTable, url: &str) -> Result<Prop, PluginError> {
    loop {
        let (entry, ctx, groups) = table
            .find(url)
            .ok_or_else(|| PluginError::NoMatch(url.to_string()))?;

        let guard = ctx.begin();
        // The route may have been destroyed, or its context stopped, while
        // this thread waited for the lock.
        if !table.contains(&entry) || ctx.state() != ContextState::Running {
            tracing::debug!(
                plugin = %ctx.id(),
                route = %entry.pattern,
                url = %url,
                "route went away before dispatch, matching again"
            );
            continue;
        }

        let page = Prop::create_root(Some("page"));
        let mut args = Vec::with_capacity(groups.len() + 1);
        args.push(ScriptValue::Prop(page.clone()));
        args.extend(groups);

        tracing::debug!(plugin = %ctx.id(), route = %entry.pattern, url = %url, "dispatching");
        let outcome = guard.call(entry.handler, &args).map_err(PluginError::from);
        drop(guard);

        return match outcome {
            Ok(_) => Ok(page),
            Err(e) => {
                tracing::error!(
                    plugin = %ctx.id(),
                    route = %entry.pattern,
                    url = %url,
                    "route handler failed: {e}"
                );
                page.destroy();
                Err(e)
            }
        };
    }
}

/// Like [`dispatch`], but failures are rendered as an error page.
pub(crate) fn open(table: &RouteTable, url: &str) -> Prop {
    match dispatch(table, url) {
        Ok(page) => page,
        Err(e) => error_page(url, &e),
    }
}

fn error_page(url: &str, err: &PluginError) -> Prop {
    let page = Prop::create_root(Some("page"));
    for (name, value) in [
        ("type", "openerror".to_string()),
        ("error", err.to_string()),
        ("url", url.to_string()),
    ] {
        if let Err(e) = page.set_path(&[name], value) {
            tracing::warn!(url = %url, "failed to build error page: {e}");
        }
    }
    page
}
