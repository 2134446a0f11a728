//! Turns [`HandlerSpec`]s into invocable [`HandlerInstance`]s.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError};

use crank_core::types::APPLICATION_NAME_KEY;
use regex::Regex;
use crank_core::{ConfigError, EventKey, HandlerMode, HandlerSpec, Payload, SourceKind};

use crate::catalog::{Catalog, HandlerFn, SharedObject};
use crate::error::HandlerError;
use crate::invocation::Invocation;
use crate::shell::{CommandExecutor, ShellCommand};
use crate::watch::{PathChange, WatchCallback};

/// Class name → the one object built for it.
#[derive(Default)]
pub struct SingletonRegistry {
    objects: HashMap<String, SharedObject>,
    constructed: usize,
}

impl SingletonRegistry {
    /// The shared instance of `class`, building it on first use.
    pub fn get_or_create(
        &mut self,
        class: &str,
        catalog: &Catalog,
    ) -> Result<SharedObject, ConfigError> {
        if let Some(object) = self.objects.get(class) {
            return Ok(Arc::clone(object));
        }
        let factory = catalog.class(class)?;
        let object: SharedObject = Arc::new(std::sync::Mutex::new(factory()));
        self.constructed += 1;
        self.objects.insert(class.to_string(), Arc::clone(&object));
        tracing::debug!(class, "instantiated handler object");
        Ok(object)
    }

    pub fn get(&self, class: &str) -> Option<SharedObject> {
        self.objects.get(class).cloned()
    }

    /// How many objects were ever built.
    pub fn constructed(&self) -> usize {
        self.constructed
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

/// What a handler asks of the router after running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Done,
    /// A relaunch watcher fired: subscribe `key` on `source` again.
    Rearm { source: SourceKind, key: EventKey },
}

enum Action {
    Shell {
        command: String,
        executor: Arc<dyn CommandExecutor>,
    },
    Function(HandlerFn),
    Method {
        object: SharedObject,
        method: String,
    },
    Relaunch {
        process: String,
    },
}

/// A resolved handler, built once per event key and reused for every firing.
pub struct HandlerInstance {
    context: String,
    source: SourceKind,
    key: EventKey,
    spec: HandlerSpec,
    action: Action,
}

impl HandlerInstance {
    pub fn context(&self) -> &str {
        &self.context
    }

    pub fn source(&self) -> SourceKind {
        self.source
    }

    /// The configured key this instance was resolved for.
    pub fn key(&self) -> &EventKey {
        &self.key
    }

    pub fn spec(&self) -> &HandlerSpec {
        &self.spec
    }

    pub fn is_relaunch_watcher(&self) -> bool {
        matches!(self.action, Action::Relaunch { .. })
    }

    /// Short description of what this handler does, for status output.
    pub fn describe(&self) -> String {
        match &self.action {
            Action::Shell { command, .. } => format!("command: {command}"),
            Action::Function(_) => format!(
                "function: {}",
                self.spec.function.as_deref().unwrap_or_default()
            ),
            Action::Method { method, .. } => {
                let class = self
                    .spec
                    .method
                    .as_ref()
                    .map(|(class, _)| class.as_str())
                    .or(self.spec.class.as_deref())
                    .unwrap_or_default();
                format!("method: {class}.{method}")
            }
            Action::Relaunch { process } => format!("process: {process}"),
        }
    }

    /// Builds the invocation for one firing.
    pub fn invocation(&self, key: &EventKey, payload: Payload, pattern: Option<&Regex>) -> Invocation {
        Invocation {
            context: self.context.clone(),
            source: self.source,
            key: key.clone(),
            spec: self.spec.clone(),
            payload,
            pattern: pattern.cloned(),
        }
    }

    pub fn invoke(&self, invocation: &Invocation) -> Result<Outcome, HandlerError> {
        match &self.action {
            Action::Shell { command, executor } => {
                executor.execute(ShellCommand::for_invocation(command, invocation))?;
                Ok(Outcome::Done)
            }
            Action::Function(function) => {
                function(invocation)?;
                Ok(Outcome::Done)
            }
            Action::Method { object, method } => {
                let mut object = object.lock().unwrap_or_else(PoisonError::into_inner);
                object.call(method, invocation)?;
                Ok(Outcome::Done)
            }
            Action::Relaunch { process } => {
                let launched = invocation
                    .payload
                    .user_info()
                    .and_then(|info| info.get(APPLICATION_NAME_KEY))
                    .and_then(|name| name.as_str());
                if launched != Some(process.as_str()) {
                    return Ok(Outcome::Done);
                }
                tracing::info!(
                    context = %self.context,
                    process = %process,
                    "reloading handler {}",
                    self.key,
                );
                Ok(Outcome::Rearm {
                    source: self.source,
                    key: self.key.clone(),
                })
            }
        }
    }
}

impl std::fmt::Debug for HandlerInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerInstance")
            .field("context", &self.context)
            .field("key", &self.key)
            .field("handler", &self.describe())
            .finish()
    }
}

impl WatchCallback for HandlerInstance {
    fn label(&self) -> &str {
        &self.context
    }

    fn on_change(&mut self, change: &PathChange<'_>) -> Result<(), HandlerError> {
        let payload = Payload::Path {
            watch: change.watch.to_path_buf(),
            path: change.path.to_path_buf(),
            recursive: change.recursive,
        };
        let invocation = self.invocation(&self.key, payload, None);
        self.invoke(&invocation).map(|_| ())
    }
}

/// Resolves specs against a [`Catalog`], sharing class instances through a
/// [`SingletonRegistry`].
pub struct Resolver {
    catalog: Catalog,
    singletons: SingletonRegistry,
    executor: Arc<dyn CommandExecutor>,
}

impl Resolver {
    pub fn new(catalog: Catalog, executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            catalog,
            singletons: SingletonRegistry::default(),
            executor,
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn singletons(&self) -> &SingletonRegistry {
        &self.singletons
    }

    /// Resolve the handler for `key` in `source`.
    ///
    /// Fails when the spec does not have exactly one mode, when a name is not
    /// in the catalog, or when an object lacks the method it is bound to.
    pub fn resolve(
        &mut self,
        source: SourceKind,
        key: &EventKey,
        spec: &HandlerSpec,
    ) -> Result<HandlerInstance, ConfigError> {
        let action = match spec.mode(key)? {
            HandlerMode::Command(command) => Action::Shell {
                command: command.to_string(),
                executor: Arc::clone(&self.executor),
            },
            HandlerMode::Function(name) => Action::Function(self.catalog.function(name)?),
            HandlerMode::Method { class, method } => Action::Method {
                object: self.bound_object(key, class, method)?,
                method: method.to_string(),
            },
            HandlerMode::Class(class) => {
                if !source.supports_class() {
                    return Err(ConfigError::ClassNotAllowed {
                        key: key.clone(),
                        section: source,
                    });
                }
                let method = format!("on{key}");
                Action::Method {
                    object: self.bound_object(key, class, &method)?,
                    method,
                }
            }
            HandlerMode::Process(process) => Action::Relaunch {
                process: process.to_string(),
            },
        };

        Ok(HandlerInstance {
            context: source.context_label(key),
            source,
            key: key.clone(),
            spec: spec.clone(),
            action,
        })
    }

    fn bound_object(
        &mut self,
        key: &EventKey,
        class: &str,
        method: &str,
    ) -> Result<SharedObject, ConfigError> {
        let object = self.singletons.get_or_create(class, &self.catalog)?;
        let responds = object
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .responds_to(method);
        if !responds {
            return Err(ConfigError::MissingMethod {
                key: key.clone(),
                class: class.to_string(),
                method: method.to_string(),
            });
        }
        Ok(object)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::HandlerObject;
    use serde_json::{json, Map};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Arc<Mutex<Vec<ShellCommand>>>);

    impl CommandExecutor for Recorder {
        fn execute(&self, command: ShellCommand) -> Result<(), HandlerError> {
            self.0.lock().expect("lock").push(command);
            Ok(())
        }
    }

    struct OnlyWake;

    impl HandlerObject for OnlyWake {
        fn responds_to(&self, method: &str) -> bool {
            method == "onNSWorkspaceDidWakeNotification"
        }

        fn call(&mut self, _method: &str, _invocation: &Invocation) -> Result<(), HandlerError> {
            Err(HandlerError::new("boom"))
        }
    }

    fn resolver() -> Resolver {
        let mut catalog = Catalog::with_builtins();
        catalog.register_class("OnlyWake", || Box::new(OnlyWake) as Box<dyn HandlerObject>);
        Resolver::new(catalog, Arc::new(Recorder::default()))
    }

    #[test]
    fn class_handler_needs_callback_for_its_event() {
        let mut resolver = resolver();
        let wake = EventKey::from("NSWorkspaceDidWakeNotification");
        let sleep = EventKey::from("NSWorkspaceWillSleepNotification");

        assert!(resolver
            .resolve(SourceKind::Workspace, &wake, &HandlerSpec::class("OnlyWake"))
            .is_ok());
        let err = resolver
            .resolve(SourceKind::Workspace, &sleep, &HandlerSpec::class("OnlyWake"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::MissingMethod { .. }), "got: {err}");
        assert!(err.to_string().contains("onNSWorkspaceWillSleepNotification"));
    }

    #[test]
    fn class_handler_rejected_outside_notification_sources() {
        let mut resolver = resolver();
        let err = resolver
            .resolve(
                SourceKind::DynamicStore,
                &EventKey::from("State:/Network/Global/IPv4"),
                &HandlerSpec::class("crank.Tally"),
            )
            .unwrap_err();
        assert!(matches!(err, ConfigError::ClassNotAllowed { .. }));
    }

    #[test]
    fn method_handler_errors_surface_to_caller() {
        let mut resolver = resolver();
        let key = EventKey::from("NSWorkspaceDidWakeNotification");
        let instance = resolver
            .resolve(
                SourceKind::Workspace,
                &key,
                &HandlerSpec::method("OnlyWake", "onNSWorkspaceDidWakeNotification"),
            )
            .expect("resolve");
        let err = instance
            .invoke(&instance.invocation(&key, Payload::None, None))
            .unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }

    #[test]
    fn relaunch_watcher_rearms_only_for_its_process() {
        let mut resolver = resolver();
        let key = EventKey::from("com.apple.iTunes.playerInfo");
        let instance = resolver
            .resolve(SourceKind::Distributed, &key, &HandlerSpec::process("iTunes"))
            .expect("resolve");
        assert!(instance.is_relaunch_watcher());

        let launch = |name: &str| {
            let mut user_info = Map::new();
            user_info.insert(APPLICATION_NAME_KEY.to_string(), json!(name));
            instance.invocation(&key, Payload::UserInfo { user_info }, None)
        };

        assert_eq!(instance.invoke(&launch("Mail")).expect("invoke"), Outcome::Done);
        assert_eq!(
            instance.invoke(&launch("iTunes")).expect("invoke"),
            Outcome::Rearm {
                source: SourceKind::Distributed,
                key: key.clone()
            }
        );
    }

    #[test]
    fn describe_names_the_handler() {
        let mut resolver = resolver();
        let key = EventKey::from("_ssh._tcp.");
        let instance = resolver
            .resolve(
                SourceKind::NetService,
                &key,
                &HandlerSpec::method("crank.Tally", "record"),
            )
            .expect("resolve");
        assert_eq!(instance.describe(), "method: crank.Tally.record");
        assert_eq!(instance.context(), "net service type: _ssh._tcp.");
    }
}
