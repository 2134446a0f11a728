//! Named functions and handler classes that config entries can refer to.
//!
//! There is no runtime import: `function: crank.log` and
//! `method: [crank.Tally, record]` resolve against a [`Catalog`] filled at
//! startup. [`Catalog::with_builtins`] carries the handlers shipped with the
//! daemon; embedders register their own on top.

use std::collections::{BTreeMap, HashMap};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde_json::json;

use crank_core::ConfigError;

use crate::error::HandlerError;
use crate::invocation::Invocation;

/// A free handler function.
pub type HandlerFn = Arc<dyn Fn(&Invocation) -> Result<(), HandlerError> + Send + Sync>;

/// Builds a fresh handler object. Called at most once per class name.
pub type ObjectFactory = Arc<dyn Fn() -> Box<dyn HandlerObject> + Send + Sync>;

/// The single shared instance of a handler class.
pub type SharedObject = Arc<Mutex<Box<dyn HandlerObject>>>;

/// A stateful handler. Methods are looked up by name: `[class, method]`
/// entries name them directly, `class:` entries call `on<EventName>`.
pub trait HandlerObject: Send {
    fn responds_to(&self, method: &str) -> bool;

    fn call(&mut self, method: &str, invocation: &Invocation) -> Result<(), HandlerError>;
}

/// The resolvable namespace of functions and classes.
#[derive(Clone, Default)]
pub struct Catalog {
    functions: HashMap<String, HandlerFn>,
    classes: HashMap<String, ObjectFactory>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// A catalog with `crank.log` (alias `log`), `crank.Tally` and
    /// `crank.Journal` registered.
    pub fn with_builtins() -> Self {
        let mut catalog = Self::new();
        catalog
            .register_function("crank.log", log_event)
            .register_function("log", log_event)
            .register_class("crank.Tally", || {
                Box::new(Tally::default()) as Box<dyn HandlerObject>
            })
            .register_class("crank.Journal", || {
                Box::new(Journal::default_location()) as Box<dyn HandlerObject>
            });
        catalog
    }

    pub fn register_function<F>(&mut self, name: impl Into<String>, function: F) -> &mut Self
    where
        F: Fn(&Invocation) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.functions.insert(name.into(), Arc::new(function));
        self
    }

    pub fn register_class<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn() -> Box<dyn HandlerObject> + Send + Sync + 'static,
    {
        self.classes.insert(name.into(), Arc::new(factory));
        self
    }

    pub fn function(&self, name: &str) -> Result<HandlerFn, ConfigError> {
        check_name(name)?;
        self.functions
            .get(name)
            .cloned()
            .ok_or_else(|| unresolvable(name, "no such function", self.functions.keys()))
    }

    pub fn class(&self, name: &str) -> Result<ObjectFactory, ConfigError> {
        check_name(name)?;
        self.classes
            .get(name)
            .cloned()
            .ok_or_else(|| unresolvable(name, "no such class", self.classes.keys()))
    }

    /// Registered function names, sorted.
    pub fn function_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Registered class names, sorted.
    pub fn class_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.classes.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for Catalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Catalog")
            .field("functions", &self.function_names())
            .field("classes", &self.class_names())
            .finish()
    }
}

fn check_name(name: &str) -> Result<(), ConfigError> {
    if name.trim_matches('.').is_empty() {
        return Err(ConfigError::Unresolvable {
            name: name.to_string(),
            reason: "couldn't be converted to a function or class name".to_string(),
        });
    }
    Ok(())
}

fn unresolvable<'a>(
    name: &str,
    reason: &str,
    known: impl Iterator<Item = &'a String>,
) -> ConfigError {
    let mut known: Vec<&str> = known.map(String::as_str).collect();
    known.sort_unstable();
    ConfigError::Unresolvable {
        name: name.to_string(),
        reason: format!("{reason} (known: {})", known.join(", ")),
    }
}

// ---------------------------------------------------------------------------
// Builtins
// ---------------------------------------------------------------------------

/// `crank.log`: record the event in the daemon log, with the pattern's
/// captures when a `regexp:` key matched.
pub fn log_event(invocation: &Invocation) -> Result<(), HandlerError> {
    let captures = invocation.captures();
    if captures.is_empty() {
        tracing::info!(
            context = %invocation.context,
            source = %invocation.source,
            key = %invocation.key,
            payload = ?invocation.payload,
            "event received",
        );
    } else {
        tracing::info!(
            context = %invocation.context,
            source = %invocation.source,
            key = %invocation.key,
            payload = ?invocation.payload,
            captures = ?captures,
            "event received",
        );
    }
    Ok(())
}

/// `crank.Tally`: counts calls per method name. Answers `record` and every
/// `on<EventName>` callback.
#[derive(Debug, Default)]
pub struct Tally {
    counts: BTreeMap<String, u64>,
}

impl Tally {
    pub fn count(&self, method: &str) -> u64 {
        self.counts.get(method).copied().unwrap_or(0)
    }
}

impl HandlerObject for Tally {
    fn responds_to(&self, method: &str) -> bool {
        method == "record" || is_callback_name(method)
    }

    fn call(&mut self, method: &str, invocation: &Invocation) -> Result<(), HandlerError> {
        let count = self.counts.entry(method.to_string()).or_insert(0);
        *count += 1;
        tracing::info!(
            context = %invocation.context,
            method,
            count = *count,
            "tally",
        );
        Ok(())
    }
}

/// `crank.Journal`: appends one JSON line per event to a file
/// (`~/.crank/journal.jsonl` by default).
#[derive(Debug)]
pub struct Journal {
    path: PathBuf,
}

impl Journal {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn default_location() -> Self {
        let home = dirs::home_dir().unwrap_or_default();
        Self::at(crank_core::config::journal_path_at(&home))
    }
}

impl HandlerObject for Journal {
    fn responds_to(&self, method: &str) -> bool {
        method == "record" || is_callback_name(method)
    }

    fn call(&mut self, method: &str, invocation: &Invocation) -> Result<(), HandlerError> {
        let line = json!({
            "at": Utc::now().to_rfc3339(),
            "method": method,
            "context": invocation.context,
            "source": invocation.source,
            "key": invocation.key,
            "payload": invocation.payload,
        });
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", serde_json::to_string(&line)?)?;
        Ok(())
    }
}

fn is_callback_name(method: &str) -> bool {
    method.len() > 2 && method.starts_with("on")
}
