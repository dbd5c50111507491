//! Capability tokens for host function authorization.
//!
//! A [`Capability`] is an immutable, parsed permission unit. Handlers only
//! receive capabilities granted out-of-band on the execution request; every
//! host function call is checked against that list before any side effect
//! is recorded.
//!
//! Tokens serialize to a canonical string form:
//!
//! - `state:read:<key>` / `state:write:<key>`
//! - `events:emit:<name>`
//! - `view:update:<component-id>`
//! - `ext:<extension-name>`
//!
//! where the final segment may be `*` to match any scope in that
//! domain/action.
//!
//! # Security Philosophy
//!
//! We follow the principle of least privilege:
//! - By default, nothing is allowed
//! - Each capability must be explicitly granted
//! - Malformed capability strings grant nothing, never a wildcard

use serde::{Deserialize, Serialize};

/// Scope of a capability: one concrete target, or every target in the
/// token's domain/action.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CapabilityScope {
    /// Matches exactly one key / name / component id.
    Exact(String),
    /// Matches any scope in the token's domain and action.
    Wildcard,
}

impl CapabilityScope {
    fn parse(raw: &str) -> Option<Self> {
        if raw.is_empty() {
            return None;
        }
        if raw == "*" {
            Some(Self::Wildcard)
        } else {
            Some(Self::Exact(raw.to_string()))
        }
    }

    fn covers(&self, target: &str) -> bool {
        match self {
            Self::Wildcard => true,
            Self::Exact(scope) => scope == target,
        }
    }

    fn as_str(&self) -> &str {
        match self {
            Self::Wildcard => "*",
            Self::Exact(scope) => scope,
        }
    }
}

/// An immutable, parsed permission unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Capability {
    /// Read a state key (`state:read:<key>`).
    StateRead(CapabilityScope),
    /// Write or delete a state key (`state:write:<key>`).
    StateWrite(CapabilityScope),
    /// Emit a named event (`events:emit:<name>`).
    EventsEmit(CapabilityScope),
    /// Issue a command against a view component (`view:update:<id>`).
    ViewUpdate(CapabilityScope),
    /// Call into a named extension (`ext:<name>`).
    ExtensionAccess(CapabilityScope),
}

impl Capability {
    /// Parse a canonical capability string.
    ///
    /// Returns `None` for anything malformed: unknown domains or actions,
    /// missing segments, empty scopes. Callers must treat `None` as "no
    /// permission".
    pub fn parse(raw: &str) -> Option<Self> {
        let mut parts = raw.splitn(3, ':');
        let domain = parts.next()?;

        match domain {
            "state" => {
                let action = parts.next()?;
                let scope = CapabilityScope::parse(parts.next()?)?;
                match action {
                    "read" => Some(Self::StateRead(scope)),
                    "write" => Some(Self::StateWrite(scope)),
                    _ => None,
                }
            }
            "events" => {
                if parts.next()? != "emit" {
                    return None;
                }
                Some(Self::EventsEmit(CapabilityScope::parse(parts.next()?)?))
            }
            "view" => {
                if parts.next()? != "update" {
                    return None;
                }
                Some(Self::ViewUpdate(CapabilityScope::parse(parts.next()?)?))
            }
            "ext" => {
                // Two-segment form: `ext:<name>` or `ext:*`.
                let scope = parts.next()?;
                if parts.next().is_some() {
                    return None;
                }
                Some(Self::ExtensionAccess(CapabilityScope::parse(scope)?))
            }
            _ => None,
        }
    }

    /// Convert an out-of-band `{type, scope}` declaration into a token.
    ///
    /// Declaration types use the hyphenated names of the panel-definition
    /// layer: `state-read`, `state-write`, `events-emit`, `view-update`,
    /// `extension-access`.
    pub fn from_declaration(kind: &str, scope: &str) -> Option<Self> {
        let scope = CapabilityScope::parse(scope)?;
        match kind {
            "state-read" => Some(Self::StateRead(scope)),
            "state-write" => Some(Self::StateWrite(scope)),
            "events-emit" => Some(Self::EventsEmit(scope)),
            "view-update" => Some(Self::ViewUpdate(scope)),
            "extension-access" => Some(Self::ExtensionAccess(scope)),
            _ => None,
        }
    }

    /// Canonical string form of this token.
    pub fn canonical(&self) -> String {
        match self {
            Self::StateRead(s) => format!("state:read:{}", s.as_str()),
            Self::StateWrite(s) => format!("state:write:{}", s.as_str()),
            Self::EventsEmit(s) => format!("events:emit:{}", s.as_str()),
            Self::ViewUpdate(s) => format!("view:update:{}", s.as_str()),
            Self::ExtensionAccess(s) => format!("ext:{}", s.as_str()),
        }
    }

    /// Scope of this token.
    pub fn scope(&self) -> &CapabilityScope {
        match self {
            Self::StateRead(s)
            | Self::StateWrite(s)
            | Self::EventsEmit(s)
            | Self::ViewUpdate(s)
            | Self::ExtensionAccess(s) => s,
        }
    }

    /// Returns `true` if this token is a wildcard for its domain/action.
    pub fn is_wildcard(&self) -> bool {
        matches!(self.scope(), CapabilityScope::Wildcard)
    }

    /// Check whether this token satisfies a required capability string.
    ///
    /// The required string is in canonical form with a concrete scope
    /// (e.g. `state:read:count`). Domain and action must match exactly;
    /// the scope matches exactly or via this token's wildcard. A malformed
    /// required string matches nothing.
    pub fn matches(&self, required: &str) -> bool {
        let Some(required) = Capability::parse(required) else {
            return false;
        };
        match (self, &required) {
            (Self::StateRead(have), Self::StateRead(want))
            | (Self::StateWrite(have), Self::StateWrite(want))
            | (Self::EventsEmit(have), Self::EventsEmit(want))
            | (Self::ViewUpdate(have), Self::ViewUpdate(want))
            | (Self::ExtensionAccess(have), Self::ExtensionAccess(want)) => match want {
                CapabilityScope::Exact(target) => have.covers(target),
                // Requiring the wildcard itself (e.g. `state:read:*` for
                // `keys()`) is only satisfied by the wildcard token.
                CapabilityScope::Wildcard => matches!(have, CapabilityScope::Wildcard),
            },
            _ => false,
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.canonical())
    }
}

impl TryFrom<String> for Capability {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Capability::parse(&value).ok_or_else(|| format!("malformed capability `{value}`"))
    }
}

impl From<Capability> for String {
    fn from(value: Capability) -> Self {
        value.canonical()
    }
}

/// Checks required capability strings against a granted token list.
#[derive(Debug, Clone, Default)]
pub struct CapabilityChecker {
    granted: Vec<Capability>,
}

impl CapabilityChecker {
    /// Create a checker over a granted token list.
    pub fn new(granted: Vec<Capability>) -> Self {
        Self { granted }
    }

    /// Parse a list of capability strings, silently dropping malformed
    /// entries (they grant nothing).
    pub fn from_strings<I, S>(raw: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            granted: raw
                .into_iter()
                .filter_map(|s| Capability::parse(s.as_ref()))
                .collect(),
        }
    }

    /// Check whether any granted token satisfies the required string.
    pub fn check(&self, required: &str) -> bool {
        self.granted.iter().any(|token| token.matches(required))
    }

    /// The granted token list.
    pub fn granted(&self) -> &[Capability] {
        &self.granted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_canonical_roundtrip() {
        for raw in [
            "state:read:count",
            "state:write:*",
            "events:emit:saved",
            "view:update:chart-1",
            "ext:http",
            "ext:*",
        ] {
            let token = Capability::parse(raw).unwrap();
            assert_eq!(token.canonical(), raw);
        }
    }

    #[test]
    fn test_parse_malformed() {
        for raw in [
            "",
            "state",
            "state:read",
            "state:read:",
            "state:enumerate:count",
            "events:publish:saved",
            "view:render:chart",
            "ext:http:get",
            "network:read:*",
            ":::",
        ] {
            assert!(Capability::parse(raw).is_none(), "parsed `{raw}`");
        }
    }

    #[test]
    fn test_exact_match() {
        let token = Capability::parse("state:read:count").unwrap();
        assert!(token.matches("state:read:count"));
        assert!(!token.matches("state:read:other"));
        assert!(!token.matches("state:write:count"));
        assert!(!token.matches("events:emit:count"));
    }

    #[test]
    fn test_wildcard_match() {
        let token = Capability::parse("state:write:*").unwrap();
        assert!(token.is_wildcard());
        assert!(!Capability::parse("state:write:count").unwrap().is_wildcard());
        assert!(token.matches("state:write:count"));
        assert!(token.matches("state:write:anything"));
        assert!(!token.matches("state:read:count"));

        let token = Capability::parse("ext:*").unwrap();
        assert!(token.matches("ext:http"));
        assert!(token.matches("ext:kv"));
    }

    #[test]
    fn test_wildcard_requirement_needs_wildcard_grant() {
        // `keys()` requires `state:read:*` specifically; a concrete token
        // must not satisfy it.
        let concrete = Capability::parse("state:read:count").unwrap();
        assert!(!concrete.matches("state:read:*"));

        let wildcard = Capability::parse("state:read:*").unwrap();
        assert!(wildcard.matches("state:read:*"));
    }

    #[test]
    fn test_malformed_required_matches_nothing() {
        let token = Capability::parse("state:read:*").unwrap();
        assert!(!token.matches("state:read"));
        assert!(!token.matches("not a capability"));
    }

    #[test]
    fn test_from_declaration() {
        let token = Capability::from_declaration("state-read", "count").unwrap();
        assert_eq!(token.canonical(), "state:read:count");

        let token = Capability::from_declaration("extension-access", "*").unwrap();
        assert_eq!(token.canonical(), "ext:*");

        assert!(Capability::from_declaration("state-read", "").is_none());
        assert!(Capability::from_declaration("http-access", "api").is_none());
    }

    #[test]
    fn test_checker() {
        let checker =
            CapabilityChecker::from_strings(["state:read:count", "events:emit:*", "garbage"]);

        assert!(checker.check("state:read:count"));
        assert!(!checker.check("state:read:other"));
        assert!(checker.check("events:emit:saved"));
        assert!(!checker.check("view:update:chart-1"));
        // Malformed grants were dropped, not widened.
        assert_eq!(checker.granted().len(), 2);
    }

    #[test]
    fn test_serde_string_form() {
        let token: Capability = serde_json::from_str(r#""state:write:counter""#).unwrap();
        assert_eq!(token, Capability::parse("state:write:counter").unwrap());

        let json = serde_json::to_string(&token).unwrap();
        assert_eq!(json, r#""state:write:counter""#);

        assert!(serde_json::from_str::<Capability>(r#""bogus""#).is_err());
    }
}
