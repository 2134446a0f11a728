//! # crank-dispatch
//!
//! The routing core: resolves handler specs into invocable instances and
//! routes raw `(source, key, payload)` events to them.
//!
//! Build a [`Router`] with [`Router::from_config`] and a [`Resolver`], then
//! feed it with [`Router::dispatch`] (notification feeds) and
//! [`Router::dispatch_path`] (filesystem change streams).

pub mod catalog;
pub mod error;
pub mod invocation;
pub mod log_list;
pub mod resolver;
pub mod restart;
pub mod router;
pub mod shell;
pub mod watch;

pub use catalog::{Catalog, HandlerObject, SharedObject};
pub use error::{DispatchError, HandlerError};
pub use invocation::Invocation;
pub use resolver::{HandlerInstance, Outcome, Resolver, SingletonRegistry};
pub use restart::{ExecRestarter, RestartWatcher, Restarter};
pub use router::{DispatchReport, RawEvent, Router, Subscription, Subscriptions};
pub use shell::{CommandExecutor, ShellCommand, ShellExecutor};
pub use watch::{PathChange, PathEvent, WatchCallback, WatchFlags, WatchTable};
