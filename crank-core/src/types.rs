//! Domain types for crank.
//!
//! Config sections keep the order of the file: pattern keys are matched in
//! that order, so [`Section`] is a list of pairs rather than a map.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::error::ConfigError;

/// Prefix marking a dynamic-store key as a regular expression.
pub const PATTERN_PREFIX: &str = "regexp:";

/// Distributed-notification key that observes every notification name.
pub const WILDCARD_KEY: &str = "*";

/// Workspace notification that relaunch watchers listen on.
pub const APPLICATION_LAUNCHED: &str = "NSWorkspaceDidLaunchApplicationNotification";

/// User-info entry carrying the launched application's name.
pub const APPLICATION_NAME_KEY: &str = "NSApplicationName";

/// Workspace notifications every supported platform binding delivers.
pub const STANDARD_WORKSPACE_NOTIFICATIONS: &[&str] = &[
    "NSWorkspaceDidLaunchApplicationNotification",
    "NSWorkspaceDidMountNotification",
    "NSWorkspaceDidPerformFileOperationNotification",
    "NSWorkspaceDidTerminateApplicationNotification",
    "NSWorkspaceDidUnmountNotification",
    "NSWorkspaceDidWakeNotification",
    "NSWorkspaceSessionDidBecomeActiveNotification",
    "NSWorkspaceSessionDidResignActiveNotification",
    "NSWorkspaceWillLaunchApplicationNotification",
    "NSWorkspaceWillPowerOffNotification",
    "NSWorkspaceWillSleepNotification",
    "NSWorkspaceWillUnmountNotification",
];

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// Identifier of a subscribable condition: a dynamic-store path, a
/// notification name, a filesystem path or a service type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventKey(pub String);

impl EventKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The regular expression of a `regexp:` key, without the prefix.
    pub fn pattern(&self) -> Option<&str> {
        self.0.strip_prefix(PATTERN_PREFIX)
    }

    pub fn is_wildcard(&self) -> bool {
        self.0 == WILDCARD_KEY
    }
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for EventKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for EventKey {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

/// The notification feeds crank can route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// System-configuration dynamic store (network state and friends).
    DynamicStore,
    /// Application lifecycle, sleep/wake and mount notifications.
    Workspace,
    /// Distributed notifications posted by any process.
    Distributed,
    /// Service discovery browsing.
    NetService,
    /// Location updates.
    Location,
    /// Filesystem change streams.
    #[serde(rename = "fs_events")]
    FileSystem,
}

impl SourceKind {
    pub const ALL: [SourceKind; 6] = [
        SourceKind::DynamicStore,
        SourceKind::Workspace,
        SourceKind::Distributed,
        SourceKind::NetService,
        SourceKind::Location,
        SourceKind::FileSystem,
    ];

    /// Config section name, also the wire name on the control socket.
    pub fn section(&self) -> &'static str {
        match self {
            SourceKind::DynamicStore => "dynamic_store",
            SourceKind::Workspace => "workspace",
            SourceKind::Distributed => "distributed",
            SourceKind::NetService => "net_service",
            SourceKind::Location => "location",
            SourceKind::FileSystem => "fs_events",
        }
    }

    /// Whether `class:` delegate handlers are accepted for this source.
    pub fn supports_class(&self) -> bool {
        matches!(self, SourceKind::Workspace | SourceKind::Distributed)
    }

    /// Whether `regexp:` keys are matched for this source.
    pub fn supports_patterns(&self) -> bool {
        matches!(self, SourceKind::DynamicStore)
    }

    /// Label used in logs and exported to shell handlers as `CRANK_CONTEXT`.
    pub fn context_label(&self, key: &EventKey) -> String {
        match self {
            SourceKind::DynamicStore => format!("dynamic store: {key}"),
            SourceKind::Workspace => format!("workspace notification {key}"),
            SourceKind::Distributed => format!("distributed notification {key}"),
            SourceKind::NetService => format!("net service type: {key}"),
            SourceKind::Location => "location".to_string(),
            SourceKind::FileSystem => format!("fs event: {key}"),
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.section())
    }
}

impl FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SourceKind::ALL
            .into_iter()
            .find(|kind| kind.section() == s)
            .ok_or_else(|| {
                let known: Vec<&str> = SourceKind::ALL.iter().map(|k| k.section()).collect();
                format!("unknown source '{s}'; expected one of: {}", known.join(", "))
            })
    }
}

// ---------------------------------------------------------------------------
// Handler specs
// ---------------------------------------------------------------------------

/// How an event is turned into a call. Exactly one field must be set.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HandlerSpec {
    /// Shell command run through `/bin/sh -c`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Name of a catalog function.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    /// `[class, method]` on the single shared instance of `class`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<(String, String)>,
    /// Re-arm this subscription whenever the named process launches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process: Option<String>,
    /// Delegate object receiving `on<EventName>` calls.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<String>,
}

/// The single resolution mode of a [`HandlerSpec`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerMode<'a> {
    Command(&'a str),
    Function(&'a str),
    Method { class: &'a str, method: &'a str },
    Process(&'a str),
    Class(&'a str),
}

impl HandlerSpec {
    pub fn command(command: impl Into<String>) -> Self {
        Self {
            command: Some(command.into()),
            ..Self::default()
        }
    }

    pub fn function(name: impl Into<String>) -> Self {
        Self {
            function: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn method(class: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            method: Some((class.into(), method.into())),
            ..Self::default()
        }
    }

    pub fn process(name: impl Into<String>) -> Self {
        Self {
            process: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn class(name: impl Into<String>) -> Self {
        Self {
            class: Some(name.into()),
            ..Self::default()
        }
    }

    /// Returns the one mode present, or a configuration error naming `key`
    /// when there are none or several.
    pub fn mode(&self, key: &EventKey) -> Result<HandlerMode<'_>, ConfigError> {
        let mut present: Vec<(&'static str, HandlerMode<'_>)> = Vec::new();
        if let Some(command) = &self.command {
            present.push(("command", HandlerMode::Command(command)));
        }
        if let Some(function) = &self.function {
            present.push(("function", HandlerMode::Function(function)));
        }
        if let Some((class, method)) = &self.method {
            present.push(("method", HandlerMode::Method { class, method }));
        }
        if let Some(process) = &self.process {
            present.push(("process", HandlerMode::Process(process)));
        }
        if let Some(class) = &self.class {
            present.push(("class", HandlerMode::Class(class)));
        }

        match present.len() {
            0 => Err(ConfigError::NoHandlerMode { key: key.clone() }),
            1 => Ok(present[0].1),
            _ => Err(ConfigError::ConflictingHandlerModes {
                key: key.clone(),
                modes: present
                    .iter()
                    .map(|(name, _)| *name)
                    .collect::<Vec<_>>()
                    .join(", "),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// A resolved (or failed) service-discovery result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ServiceInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub service_type: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_name: Option<String>,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(default)]
    pub resolved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub txt_record: Option<String>,
}

/// A single location fix.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocationInfo {
    pub latitude: f64,
    pub longitude: f64,
    pub horizontal_accuracy: f64,
}

impl LocationInfo {
    /// Same coordinates and accuracy; such a repeat fix is not an event.
    pub fn same_fix(&self, other: &LocationInfo) -> bool {
        self.latitude == other.latitude
            && self.longitude == other.longitude
            && self.horizontal_accuracy == other.horizontal_accuracy
    }
}

/// Source-specific data carried with an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    #[default]
    None,
    /// Dynamic-store value for the changed key.
    Info { info: Value },
    /// Notification user-info dictionary.
    UserInfo { user_info: Map<String, Value> },
    Service(ServiceInfo),
    Location(LocationInfo),
    /// Filesystem change under the watch directory `watch`.
    Path {
        watch: PathBuf,
        path: PathBuf,
        recursive: bool,
    },
}

impl Payload {
    pub fn user_info(&self) -> Option<&Map<String, Value>> {
        match self {
            Payload::UserInfo { user_info } => Some(user_info),
            _ => None,
        }
    }

    pub fn info(&self) -> Option<&Value> {
        match self {
            Payload::Info { info } => Some(info),
            _ => None,
        }
    }

    pub fn location(&self) -> Option<&LocationInfo> {
        match self {
            Payload::Location(location) => Some(location),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// One config section: event keys and their handlers, in file order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Section(Vec<(EventKey, HandlerSpec)>);

impl Section {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces the handler for `key`, keeping its original position.
    pub fn insert(&mut self, key: impl Into<EventKey>, spec: HandlerSpec) {
        let key = key.into();
        match self.0.iter_mut().find(|(existing, _)| *existing == key) {
            Some(entry) => entry.1 = spec,
            None => self.0.push((key, spec)),
        }
    }

    pub fn get(&self, key: &EventKey) -> Option<&HandlerSpec> {
        self.0
            .iter()
            .find(|(existing, _)| existing == key)
            .map(|(_, spec)| spec)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&EventKey, &HandlerSpec)> {
        self.0.iter().map(|(key, spec)| (key, spec))
    }

    pub fn keys(&self) -> impl Iterator<Item = &EventKey> {
        self.0.iter().map(|(key, _)| key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<EventKey>> FromIterator<(K, HandlerSpec)> for Section {
    fn from_iter<I: IntoIterator<Item = (K, HandlerSpec)>>(iter: I) -> Self {
        let mut section = Section::new();
        for (key, spec) in iter {
            section.insert(key, spec);
        }
        section
    }
}

impl Serialize for Section {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (key, spec) in &self.0 {
            map.serialize_entry(key.as_str(), spec)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Section {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct SectionVisitor;

        impl<'de> Visitor<'de> for SectionVisitor {
            type Value = Section;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a mapping of event keys to handlers")
            }

            fn visit_unit<E: serde::de::Error>(self) -> Result<Section, E> {
                Ok(Section::new())
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Section, A::Error> {
                let mut entries: Vec<(EventKey, HandlerSpec)> =
                    Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((key, spec)) = access.next_entry::<String, HandlerSpec>()? {
                    let key = EventKey(key);
                    if entries.iter().any(|(existing, _)| *existing == key) {
                        return Err(serde::de::Error::custom(format!(
                            "duplicate event key '{key}'"
                        )));
                    }
                    entries.push((key, spec));
                }
                Ok(Section(entries))
            }
        }

        deserializer.deserialize_any(SectionVisitor)
    }
}

/// Root of the crank YAML config.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default, skip_serializing_if = "Section::is_empty")]
    pub dynamic_store: Section,
    #[serde(default, skip_serializing_if = "Section::is_empty")]
    pub workspace: Section,
    #[serde(default, skip_serializing_if = "Section::is_empty")]
    pub distributed: Section,
    #[serde(default, skip_serializing_if = "Section::is_empty")]
    pub net_service: Section,
    #[serde(default, skip_serializing_if = "Section::is_empty")]
    pub location: Section,
    #[serde(default, skip_serializing_if = "Section::is_empty")]
    pub fs_events: Section,
}

impl Config {
    pub fn section(&self, source: SourceKind) -> &Section {
        match source {
            SourceKind::DynamicStore => &self.dynamic_store,
            SourceKind::Workspace => &self.workspace,
            SourceKind::Distributed => &self.distributed,
            SourceKind::NetService => &self.net_service,
            SourceKind::Location => &self.location,
            SourceKind::FileSystem => &self.fs_events,
        }
    }

    pub fn section_mut(&mut self, source: SourceKind) -> &mut Section {
        match source {
            SourceKind::DynamicStore => &mut self.dynamic_store,
            SourceKind::Workspace => &mut self.workspace,
            SourceKind::Distributed => &mut self.distributed,
            SourceKind::NetService => &mut self.net_service,
            SourceKind::Location => &mut self.location,
            SourceKind::FileSystem => &mut self.fs_events,
        }
    }

    /// Every configured entry, section by section in [`SourceKind::ALL`] order.
    pub fn entries(&self) -> impl Iterator<Item = (SourceKind, &EventKey, &HandlerSpec)> {
        SourceKind::ALL.into_iter().flat_map(move |source| {
            self.section(source)
                .iter()
                .map(move |(key, spec)| (source, key, spec))
        })
    }

    pub fn is_empty(&self) -> bool {
        SourceKind::ALL
            .iter()
            .all(|source| self.section(*source).is_empty())
    }

    /// The starter config written when none exists yet.
    pub fn example() -> Self {
        let mut config = Config::default();
        config.dynamic_store.insert(
            "State:/Network/Global/IPv4",
            HandlerSpec::command("/bin/echo \"Global IPv4 config changed\""),
        );
        config.dynamic_store.insert(
            "regexp:State:/Network/Interface/([^/]+)/Link",
            HandlerSpec::command("/bin/echo \"Network interface link state changed\""),
        );
        config.workspace.insert(
            "NSWorkspaceDidMountNotification",
            HandlerSpec::command("/bin/echo \"A new volume was mounted!\""),
        );
        config.workspace.insert(
            "NSWorkspaceDidWakeNotification",
            HandlerSpec::command("/bin/echo \"The system woke from sleep!\""),
        );
        config.workspace.insert(
            "NSWorkspaceWillSleepNotification",
            HandlerSpec::command("/bin/echo \"The system is about to go to sleep!\""),
        );
        config.net_service.insert(
            "_ssh._tcp.",
            HandlerSpec::command("/bin/echo \"new ssh server seen!\""),
        );
        config
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
