//! Routes raw `(source, key, payload)` events to resolved handlers.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize, Serializer};

use crank_core::types::APPLICATION_LAUNCHED;
use crank_core::{Config, ConfigError, EventKey, HandlerSpec, LocationInfo, Payload, SourceKind};

use crate::error::DispatchError;
use crate::invocation::{anchored, Invocation};
use crate::log_list::log_list;
use crate::resolver::{HandlerInstance, Outcome, Resolver};
use crate::watch::{PathEvent, WatchFlags, WatchTable};

/// An event as delivered by a source feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    pub source: SourceKind,
    pub key: EventKey,
    #[serde(default)]
    pub payload: Payload,
}

impl RawEvent {
    pub fn new(source: SourceKind, key: impl Into<EventKey>, payload: Payload) -> Self {
        Self {
            source,
            key: key.into(),
            payload,
        }
    }
}

/// What happened to one event.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchReport {
    /// Handlers invoked.
    pub matched: usize,
    /// Handlers that returned an error.
    pub failed: usize,
    /// Subscriptions re-armed by relaunch watchers.
    pub rearmed: usize,
    /// The event repeated the previous location fix and was not delivered.
    pub suppressed: bool,
}

impl DispatchReport {
    pub fn is_unhandled(&self) -> bool {
        self.matched == 0 && !self.suppressed
    }
}

/// One entry of the subscription table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub source: SourceKind,
    pub key: EventKey,
    pub handler: String,
    /// How many times the feed was asked to subscribe this key.
    pub armed: u32,
}

/// De-duplicated `(source, key)` subscriptions, in source then key order.
#[derive(Debug, Default, Clone)]
pub struct Subscriptions(BTreeMap<(SourceKind, EventKey), Subscription>);

impl Subscriptions {
    /// Record a subscription. Returns `false` if it was already present.
    pub fn insert(&mut self, source: SourceKind, key: &EventKey, handler: String) -> bool {
        let slot = (source, key.clone());
        if self.0.contains_key(&slot) {
            return false;
        }
        self.0.insert(
            slot,
            Subscription {
                source,
                key: key.clone(),
                handler,
                armed: 1,
            },
        );
        true
    }

    pub fn rearm(&mut self, source: SourceKind, key: &EventKey) -> Option<u32> {
        let subscription = self.0.get_mut(&(source, key.clone()))?;
        subscription.armed += 1;
        Some(subscription.armed)
    }

    pub fn get(&self, source: SourceKind, key: &EventKey) -> Option<&Subscription> {
        self.0.get(&(source, key.clone()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Subscription> {
        self.0.values()
    }

    pub fn keys_for(&self, source: SourceKind) -> Vec<&str> {
        self.iter()
            .filter(|s| s.source == source)
            .map(|s| s.key.as_str())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Serialize for Subscriptions {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.0.values())
    }
}

struct PatternHandler {
    regex: Regex,
    instance: HandlerInstance,
}

/// The routing table built from a [`Config`].
#[derive(Default)]
pub struct Router {
    literal: HashMap<(SourceKind, EventKey), HandlerInstance>,
    patterns: Vec<PatternHandler>,
    location: Vec<HandlerInstance>,
    last_fix: Option<LocationInfo>,
    relaunch: Vec<HandlerInstance>,
    watches: WatchTable,
    subscriptions: Subscriptions,
    resubscribe: Vec<(SourceKind, EventKey)>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve and register every entry of `config`. The first invalid entry
    /// aborts with its configuration error.
    pub fn from_config(config: &Config, resolver: &mut Resolver) -> Result<Self, ConfigError> {
        let mut router = Self::new();
        for (source, key, spec) in config.entries() {
            router.register(source, key, spec, resolver)?;
        }
        for source in SourceKind::ALL {
            let keys = router.subscriptions.keys_for(source);
            if !keys.is_empty() {
                log_list(&format!("Listening for {}", source.section()), &keys);
            }
        }
        Ok(router)
    }

    /// Resolve `spec` and subscribe it to `key` on `source`.
    pub fn register(
        &mut self,
        source: SourceKind,
        key: &EventKey,
        spec: &HandlerSpec,
        resolver: &mut Resolver,
    ) -> Result<(), ConfigError> {
        let instance = resolver.resolve(source, key, spec)?;
        if instance.is_relaunch_watcher() {
            self.add_relaunch_watcher(source, key, instance);
            return Ok(());
        }
        let handler = instance.describe();

        match (source, key.pattern()) {
            (SourceKind::FileSystem, _) => {
                self.watches.register(Path::new(key.as_str()), Box::new(instance))?;
            }
            (SourceKind::Location, _) => self.location.push(instance),
            (SourceKind::DynamicStore, Some(pattern)) => {
                let regex =
                    Regex::new(&anchored(pattern)).map_err(|err| ConfigError::InvalidPattern {
                        key: key.clone(),
                        reason: err.to_string(),
                    })?;
                self.patterns.push(PatternHandler { regex, instance });
            }
            _ => {
                self.literal.insert((source, key.clone()), instance);
            }
        }
        self.subscriptions.insert(source, key, handler);
        Ok(())
    }

    fn add_relaunch_watcher(&mut self, source: SourceKind, key: &EventKey, instance: HandlerInstance) {
        let handler = instance.describe();
        if !self.subscriptions.insert(source, key, handler.clone()) {
            tracing::debug!(key = %key, "relaunch watcher already registered");
            return;
        }
        tracing::info!("adding process monitor: {handler}");
        self.subscriptions.insert(
            SourceKind::Workspace,
            &EventKey::from(APPLICATION_LAUNCHED),
            "relaunch watchers".to_string(),
        );
        self.relaunch.push(instance);
    }

    /// The watch table, e.g. to add restart watchers.
    pub fn watches_mut(&mut self) -> &mut WatchTable {
        &mut self.watches
    }

    /// Directories the filesystem feed must watch.
    pub fn watch_paths(&self) -> Vec<PathBuf> {
        self.watches.paths()
    }

    pub fn subscriptions(&self) -> &Subscriptions {
        &self.subscriptions
    }

    /// Subscriptions the feeds must (re)establish since the last call.
    pub fn take_resubscriptions(&mut self) -> Vec<(SourceKind, EventKey)> {
        std::mem::take(&mut self.resubscribe)
    }

    /// Deliver one event to every handler it matches.
    pub fn dispatch(&mut self, event: &RawEvent) -> DispatchReport {
        tracing::debug!(source = %event.source, key = %event.key, "dispatching");
        if event.source == SourceKind::FileSystem {
            return self.dispatch_path(&path_event(event));
        }

        let mut report = DispatchReport::default();
        let mut rearm = Vec::new();
        let literal = self.literal.get(&(event.source, event.key.clone()));

        match event.source {
            SourceKind::Location => {
                if let Some(fix) = event.payload.location() {
                    if self.last_fix.is_some_and(|last| last.same_fix(fix)) {
                        tracing::debug!("location unchanged");
                        report.suppressed = true;
                        return report;
                    }
                    self.last_fix = Some(*fix);
                }
                for instance in &self.location {
                    fire(instance, event, None, &mut report, &mut rearm);
                }
            }
            SourceKind::DynamicStore if literal.is_none() => {
                let matches: Vec<&PatternHandler> = self
                    .patterns
                    .iter()
                    .filter(|p| p.regex.is_match(event.key.as_str()))
                    .collect();
                if matches.len() > 1 {
                    tracing::warn!(
                        key = %event.key,
                        count = matches.len(),
                        "key matches several patterns; invoking all of them",
                    );
                }
                for handler in matches {
                    fire(
                        &handler.instance,
                        event,
                        Some(&handler.regex),
                        &mut report,
                        &mut rearm,
                    );
                }
            }
            SourceKind::Distributed => {
                if let Some(instance) = literal {
                    fire(instance, event, None, &mut report, &mut rearm);
                }
                if !event.key.is_wildcard() {
                    let wildcard = (SourceKind::Distributed, EventKey::from("*"));
                    if let Some(instance) = self.literal.get(&wildcard) {
                        fire(instance, event, None, &mut report, &mut rearm);
                    }
                }
            }
            _ => {
                if let Some(instance) = literal {
                    fire(instance, event, None, &mut report, &mut rearm);
                }
            }
        }

        if event.source == SourceKind::Workspace && event.key.as_str() == APPLICATION_LAUNCHED {
            for watcher in &self.relaunch {
                fire(watcher, event, None, &mut report, &mut rearm);
            }
        }

        for (source, key) in rearm {
            if let Some(armed) = self.subscriptions.rearm(source, &key) {
                tracing::debug!(source = %source, key = %key, armed, "re-armed subscription");
            }
            self.resubscribe.push((source, key));
            report.rearmed += 1;
        }

        if report.is_unhandled() {
            tracing::error!(
                "dropped event; no handler for {}",
                event.source.context_label(&event.key)
            );
        }
        report
    }

    /// Deliver a filesystem change to every watch above it.
    pub fn dispatch_path(&mut self, event: &PathEvent) -> DispatchReport {
        let delivery = self.watches.deliver(event);
        let report = DispatchReport {
            matched: delivery.invoked,
            failed: delivery.failed,
            ..DispatchReport::default()
        };
        if report.is_unhandled() {
            tracing::debug!(path = %event.path.display(), "no watch covers changed path");
        }
        report
    }
}

fn fire(
    instance: &HandlerInstance,
    event: &RawEvent,
    pattern: Option<&Regex>,
    report: &mut DispatchReport,
    rearm: &mut Vec<(SourceKind, EventKey)>,
) {
    report.matched += 1;
    let invocation: Invocation = instance.invocation(&event.key, event.payload.clone(), pattern);
    match instance.invoke(&invocation) {
        Ok(Outcome::Done) => {}
        Ok(Outcome::Rearm { source, key }) => rearm.push((source, key)),
        Err(source) => {
            report.failed += 1;
            let err = DispatchError::Handler {
                context: instance.context().to_string(),
                source,
            };
            tracing::error!(error = %err, "handler failed");
        }
    }
}

fn path_event(event: &RawEvent) -> PathEvent {
    let (path, recursive) = match &event.payload {
        Payload::Path {
            path, recursive, ..
        } => (path.clone(), *recursive),
        _ => (PathBuf::from(event.key.as_str()), false),
    };
    PathEvent {
        path,
        flags: WatchFlags {
            must_scan_subdirs: recursive,
            ..WatchFlags::default()
        },
        is_dir: None,
    }
}
