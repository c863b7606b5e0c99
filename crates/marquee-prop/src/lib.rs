//! Shared, observable property tree.
//!
//! Every node is a [`Prop`]: a named value with ordered children and an
//! ordered list of subscribers. Mutations are serialized by one tree-wide
//! re-entrant lock and subscribers are notified synchronously, in
//! registration order, before the mutating call returns.
//!
//! ```
//! use marquee_prop::{Prop, PropEvent, SubscriptionOptions};
//!
//! let page = Prop::create_root(Some("page"));
//! let _sub = page
//!     .subscribe(SubscriptionOptions::default(), |event: &PropEvent| {
//!         println!("{event:?}");
//!     })
//!     .unwrap();
//! page.set_path(&["model", "title"], "Hello").unwrap();
//! ```

pub mod sync;

mod error;
mod prop;
mod subscription;

pub use error::PropError;
pub use prop::{Notification, Prop, PropEvent, PropValue, WeakProp};
pub use subscription::{PropCallback, Subscription, SubscriptionOptions};
