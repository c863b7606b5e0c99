//! Services: entries a context publishes in the global service directory.

use std::sync::atomic::{AtomicU64, Ordering};

use marquee_prop::Prop;

use crate::context::Context;
use crate::error::PluginError;
use crate::resource::{Resource, ResourceClass};

static NEXT_SERVICE: AtomicU64 = AtomicU64::new(1);

pub static SERVICE_CLASS: ResourceClass = ResourceClass {
    name: "service",
    destroy: destroy_service,
    size: std::mem::size_of::<ServicePayload>(),
};

struct ServicePayload {
    node: Prop,
}

fn destroy_service(resource: &Resource) {
    if let Some(payload) = resource.payload::<ServicePayload>() {
        payload.node.destroy();
    }
}

/// Publish `title`/`url` under the services directory, owned by `ctx`.
pub(crate) fn add_service(
    ctx: &Context,
    title: &str,
    url: &str,
    icon: Option<&str>,
) -> Result<Resource, PluginError> {
    let name = format!("{}-{}", ctx.id(), NEXT_SERVICE.fetch_add(1, Ordering::Relaxed));
    let node = Prop::create_root(Some(&name));
    node.set_path(&["title"], title)?;
    node.set_path(&["url"], url)?;
    if let Some(icon) = icon {
        node.set_path(&["icon"], icon)?;
    }
    node.set_path(&["origin"], ctx.id())?;
    node.set_path(&["enabled"], true)?;

    let resource = Resource::alloc(&SERVICE_CLASS, ctx, ServicePayload { node: node.clone() });
    if let Err(e) = resource.root() {
        resource.destroy();
        let _ = resource.release();
        return Err(e);
    }
    if let Err(e) = ctx.shared().services.add_child(&node) {
        resource.destroy();
        return Err(e.into());
    }
    tracing::info!(plugin = %ctx.id(), service = %title, url = %url, "service added");
    Ok(resource)
}
