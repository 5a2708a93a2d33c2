//! Runtime selection.
//!
//! Maps an image reference (plus an optional explicit override) to the
//! backend family that will execute it. Selection is a pure function over an
//! ordered rule table: no I/O, no platform probing, and identical input
//! always yields the identical [`RuntimeKind`]. Whether the chosen backend is
//! actually usable on this host is decided later by the driver's own probe.
//!
//! ```text
//!   override? ──yes──▶ compiled in? ──yes──▶ kind
//!      │no                  │no
//!      ▼                    ▼
//!   rule 1 … rule n     UnsupportedRuntime
//!   (first match wins)
//!      │no match
//!      ▼
//!    native
//! ```

use crate::constants::validate_image_reference;
use crate::error::{Error, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

// =============================================================================
// Runtime Kind
// =============================================================================

/// Backend family selected to execute a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuntimeKind {
    /// Local OCI runtime (in-process library or its CLI).
    Native,
    /// Container whose lifecycle is delegated to the host's management CLI.
    ManagedContainer,
    /// Virtual machine driven through the virtualization manager API.
    VirtualMachine,
}

impl RuntimeKind {
    /// All kinds, in dispatch order.
    pub const ALL: [RuntimeKind; 3] = [Self::Native, Self::ManagedContainer, Self::VirtualMachine];

    /// Returns the canonical name used in state documents and CLI output.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Native => "native",
            Self::ManagedContainer => "managed-container",
            Self::VirtualMachine => "virtual-machine",
        }
    }

    /// Returns true if this backend was compiled into the binary.
    pub const fn is_compiled_in(self) -> bool {
        match self {
            Self::Native => true,
            Self::ManagedContainer => cfg!(feature = "managed"),
            Self::VirtualMachine => cfg!(feature = "vm"),
        }
    }

    /// Returns the kinds compiled into this binary.
    pub fn compiled_in() -> Vec<RuntimeKind> {
        Self::ALL.into_iter().filter(|k| k.is_compiled_in()).collect()
    }
}

impl std::fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RuntimeKind {
    type Err = Error;

    /// Parses a runtime name, accepting the common aliases.
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "native" | "oci" => Ok(Self::Native),
            "managed" | "managed-container" | "lxc" => Ok(Self::ManagedContainer),
            "vm" | "virtual-machine" | "qemu" => Ok(Self::VirtualMachine),
            _ => Err(Error::UnsupportedRuntime(s.to_string())),
        }
    }
}

// =============================================================================
// Rules
// =============================================================================

/// How a rule matches an image reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleMatcher {
    /// Reference starts with the given string.
    Prefix(String),
    /// Reference ends with the given string.
    Suffix(String),
    /// Reference equals the given string.
    Exact(String),
    /// Reference matches the regular expression (anchored at both ends).
    Pattern(String),
}

/// One entry of the selection table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectorRule {
    /// Matching condition.
    #[serde(rename = "match")]
    pub matcher: RuleMatcher,
    /// Kind selected when the condition holds.
    pub runtime: RuntimeKind,
}

impl SelectorRule {
    /// Rule matching references that start with `prefix`.
    pub fn prefix(prefix: impl Into<String>, runtime: RuntimeKind) -> Self {
        Self {
            matcher: RuleMatcher::Prefix(prefix.into()),
            runtime,
        }
    }

    /// Rule matching references against an anchored regular expression.
    pub fn pattern(pattern: impl Into<String>, runtime: RuntimeKind) -> Self {
        Self {
            matcher: RuleMatcher::Pattern(pattern.into()),
            runtime,
        }
    }

    /// The rules used when configuration supplies none.
    pub fn defaults() -> Vec<SelectorRule> {
        vec![
            Self::prefix("lxc/", RuntimeKind::ManagedContainer),
            Self::prefix("db-", RuntimeKind::ManagedContainer),
            Self::prefix("vm-", RuntimeKind::VirtualMachine),
        ]
    }
}

#[derive(Debug, Clone)]
enum CompiledMatcher {
    Prefix(String),
    Suffix(String),
    Exact(String),
    Pattern(Regex),
}

impl CompiledMatcher {
    fn matches(&self, image: &str) -> bool {
        match self {
            Self::Prefix(p) => image.starts_with(p.as_str()),
            Self::Suffix(s) => image.ends_with(s.as_str()),
            Self::Exact(e) => image == e,
            Self::Pattern(re) => re.is_match(image),
        }
    }
}

/// Ordered, pre-compiled selection table.
#[derive(Debug, Clone)]
pub struct RuleTable {
    rules: Vec<(CompiledMatcher, RuntimeKind)>,
}

impl RuleTable {
    /// Compiles a rule list. Invalid patterns are rejected up front so that
    /// [`select`] itself cannot fail on a well-formed reference.
    pub fn new(rules: &[SelectorRule]) -> Result<Self> {
        let rules = rules
            .iter()
            .map(|rule| {
                let matcher = match &rule.matcher {
                    RuleMatcher::Prefix(p) => CompiledMatcher::Prefix(p.clone()),
                    RuleMatcher::Suffix(s) => CompiledMatcher::Suffix(s.clone()),
                    RuleMatcher::Exact(e) => CompiledMatcher::Exact(e.clone()),
                    RuleMatcher::Pattern(p) => {
                        let re = Regex::new(&format!("^(?:{p})$")).map_err(|e| {
                            Error::InvalidRequest(format!("invalid selector pattern '{p}': {e}"))
                        })?;
                        CompiledMatcher::Pattern(re)
                    }
                };
                Ok((matcher, rule.runtime))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { rules })
    }

    /// Number of rules in the table.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Returns true if the table has no rules.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    fn first_match(&self, image: &str) -> Option<RuntimeKind> {
        self.rules
            .iter()
            .find(|(matcher, _)| matcher.matches(image))
            .map(|(_, kind)| *kind)
    }
}

impl Default for RuleTable {
    fn default() -> Self {
        Self {
            rules: SelectorRule::defaults()
                .into_iter()
                .filter_map(|rule| match rule.matcher {
                    RuleMatcher::Prefix(p) => Some((CompiledMatcher::Prefix(p), rule.runtime)),
                    _ => None,
                })
                .collect(),
        }
    }
}

// =============================================================================
// Selection
// =============================================================================

/// Selects the runtime kind for an image.
///
/// # Errors
///
/// - [`Error::InvalidImageReference`] if the reference is empty or malformed
/// - [`Error::UnsupportedRuntime`] if the override names an unknown backend
///   or one that was not compiled in
pub fn select(image: &str, override_kind: Option<&str>, rules: &RuleTable) -> Result<RuntimeKind> {
    validate_image_reference(image).map_err(|reason| Error::InvalidImageReference {
        reference: image.to_string(),
        reason: reason.to_string(),
    })?;

    if let Some(name) = override_kind {
        let kind: RuntimeKind = name.parse()?;
        if !kind.is_compiled_in() {
            return Err(Error::UnsupportedRuntime(format!(
                "{kind} backend is not compiled into this binary"
            )));
        }
        return Ok(kind);
    }

    Ok(rules.first_match(image).unwrap_or(RuntimeKind::Native))
}
