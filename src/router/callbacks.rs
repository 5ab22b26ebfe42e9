//! The callback token grammar.
//!
//! Tokens are opaque colon-separated strings `<namespace>:<verb>[:<arg>]`
//! over a closed namespace set. Every namespace routes to exactly one
//! handler; parsing failures are validation errors rendered through the
//! catalog, never silent drops.

use crate::types::{CoreError, CoreResult};

/// The closed set of callback namespaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    Action,
    Confirm,
    Recover,
    Page,
    Search,
    Pref,
    Oracle,
    Toggle,
    Retry,
    Help,
    GetFile,
}

impl Namespace {
    pub const ALL: [Namespace; 11] = [
        Namespace::Action,
        Namespace::Confirm,
        Namespace::Recover,
        Namespace::Page,
        Namespace::Search,
        Namespace::Pref,
        Namespace::Oracle,
        Namespace::Toggle,
        Namespace::Retry,
        Namespace::Help,
        Namespace::GetFile,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::Action => "action",
            Namespace::Confirm => "confirm",
            Namespace::Recover => "recover",
            Namespace::Page => "page",
            Namespace::Search => "search",
            Namespace::Pref => "pref",
            Namespace::Oracle => "oracle",
            Namespace::Toggle => "toggle",
            Namespace::Retry => "retry",
            Namespace::Help => "help",
            Namespace::GetFile => "get_file",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|ns| ns.as_str() == s)
    }
}

impl std::fmt::Display for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed callback token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackToken {
    pub namespace: Namespace,
    pub verb: String,
    pub arg: Option<String>,
}

impl CallbackToken {
    pub fn new(namespace: Namespace, verb: impl Into<String>) -> Self {
        Self {
            namespace,
            verb: verb.into(),
            arg: None,
        }
    }

    pub fn with_arg(namespace: Namespace, verb: impl Into<String>, arg: impl Into<String>) -> Self {
        Self {
            namespace,
            verb: verb.into(),
            arg: Some(arg.into()),
        }
    }

    /// Parse a raw token. `get_file` verbs may themselves contain
    /// colons (relative paths), so the remainder after the namespace of
    /// that one namespace is taken whole.
    pub fn parse(raw: &str) -> CoreResult<Self> {
        let invalid =
            || CoreError::validation("invalid_token", format!("unroutable callback '{raw}'"));

        let (ns, rest) = raw.split_once(':').ok_or_else(invalid)?;
        let namespace = Namespace::parse(ns).ok_or_else(invalid)?;
        if rest.is_empty() {
            return Err(invalid());
        }

        if namespace == Namespace::GetFile {
            return Ok(Self::new(namespace, rest));
        }

        let (verb, arg) = match rest.split_once(':') {
            Some((verb, arg)) if !arg.is_empty() => (verb, Some(arg.to_string())),
            Some((verb, _)) => (verb, None),
            None => (rest, None),
        };
        if verb.is_empty() {
            return Err(invalid());
        }
        Ok(Self {
            namespace,
            verb: verb.to_string(),
            arg,
        })
    }

    /// Render back to the wire form.
    pub fn render(&self) -> String {
        match &self.arg {
            Some(arg) => format!("{}:{}:{}", self.namespace, self.verb, arg),
            None => format!("{}:{}", self.namespace, self.verb),
        }
    }
}

impl std::fmt::Display for CallbackToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.render())
    }
}
