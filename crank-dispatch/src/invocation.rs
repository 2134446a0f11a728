//! The call contract every handler receives, whatever its source.

use crank_core::{EventKey, HandlerSpec, Payload, SourceKind};
use regex::Regex;

/// One firing of a handler.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Human-readable label of the subscription, e.g. `dynamic store: State:/…`.
    pub context: String,
    pub source: SourceKind,
    /// The key as reported by the event source. For pattern handlers this is
    /// the concrete key that matched, not the pattern.
    pub key: EventKey,
    /// The handler's own config entry.
    pub spec: HandlerSpec,
    pub payload: Payload,
    /// The compiled, anchored pattern that matched, for pattern handlers.
    pub pattern: Option<Regex>,
}

impl Invocation {
    /// Captures of the matched pattern against the key, if this is a pattern
    /// invocation. Group 0 is the whole match.
    pub fn captures(&self) -> Vec<String> {
        let Some(pattern) = &self.pattern else {
            return Vec::new();
        };
        pattern
            .captures(self.key.as_str())
            .map(|caps| {
                caps.iter()
                    .map(|m| m.map(|m| m.as_str().to_string()).unwrap_or_default())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Pattern keys match from the start of the key, like a prefix match.
pub(crate) fn anchored(pattern: &str) -> String {
    format!("^(?:{pattern})")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_expose_pattern_groups() {
        let invocation = Invocation {
            context: "dynamic store".into(),
            source: SourceKind::DynamicStore,
            key: EventKey::from("State:/Network/Interface/en0/Link"),
            spec: HandlerSpec::function("log"),
            payload: Payload::None,
            pattern: Some(
                Regex::new(&anchored("State:/Network/Interface/([^/]+)/Link")).expect("regex"),
            ),
        };
        assert_eq!(
            invocation.captures(),
            vec!["State:/Network/Interface/en0/Link".to_string(), "en0".to_string()]
        );
    }

    #[test]
    fn literal_invocation_has_no_captures() {
        let invocation = Invocation {
            context: "workspace".into(),
            source: SourceKind::Workspace,
            key: EventKey::from("NSWorkspaceDidWakeNotification"),
            spec: HandlerSpec::command("true"),
            payload: Payload::None,
            pattern: None,
        };
        assert!(invocation.captures().is_empty());
    }
}
