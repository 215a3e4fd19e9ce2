//! `${name}` template substitution.
//!
//! A [`VariableResolver`] owns an ordered table of [`ResolveRule`]s and an
//! optional parent. Each `${...}` occurrence in the input is matched against
//! the rules in order; the first matching rule produces the replacement. When
//! no local rule matches, the parent is consulted, so a child resolver can
//! shadow variables of its parent without mutating it.
//!
//! Tokens that no rule recognizes are left in the output unchanged.
//!
//! # Example
//!
//! ```
//! use testmate::resolver::{ResolveRule, VariableResolver};
//!
//! # tokio_test::block_on(async {
//! let resolver = VariableResolver::new(vec![
//!     ResolveRule::literal("${cmd}", "gtest"),
//!     ResolveRule::list("${argsFlat}", ["--a", "--b"]).flat(),
//! ]);
//!
//! let args = resolver
//!     .resolve_args(&["${cmd}".to_string(), "${argsFlat}".to_string()])
//!     .await;
//! assert_eq!(args, vec!["gtest", "--a", "--b"]);
//! # });
//! ```

use std::fmt;
use std::path::Path;
use std::sync::{Arc, LazyLock};

use futures::future::BoxFuture;
use regex::Regex;

static TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{[^{}]*\}").unwrap_or_else(|e| panic!("invalid token regex: {e}"))
});

/// Value produced by a rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleValue {
    Str(String),
    List(Vec<String>),
}

impl RuleValue {
    fn into_joined(self) -> String {
        match self {
            RuleValue::Str(s) => s,
            RuleValue::List(items) => items.join(" "),
        }
    }
}

impl From<&str> for RuleValue {
    fn from(s: &str) -> Self {
        RuleValue::Str(s.to_string())
    }
}

impl From<String> for RuleValue {
    fn from(s: String) -> Self {
        RuleValue::Str(s)
    }
}

/// The token that matched a rule, plus regex captures when the rule pattern
/// is a regex (index 0 is the whole token).
#[derive(Debug, Clone)]
pub struct RuleMatch {
    pub token: String,
    pub captures: Vec<Option<String>>,
}

impl RuleMatch {
    /// Returns capture group `i`, if it participated in the match.
    pub fn group(&self, i: usize) -> Option<&str> {
        self.captures.get(i).and_then(|c| c.as_deref())
    }
}

pub type SyncRuleFn = Arc<dyn Fn(&RuleMatch) -> Option<RuleValue> + Send + Sync>;
pub type AsyncRuleFn =
    Arc<dyn Fn(RuleMatch) -> BoxFuture<'static, Option<RuleValue>> + Send + Sync>;

/// How a matched token is turned into a value.
#[derive(Clone)]
pub enum Rule {
    Value(RuleValue),
    Sync(SyncRuleFn),
    Async(AsyncRuleFn),
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rule::Value(v) => f.debug_tuple("Value").field(v).finish(),
            Rule::Sync(_) => f.write_str("Sync(..)"),
            Rule::Async(_) => f.write_str("Async(..)"),
        }
    }
}

/// Which tokens a rule applies to.
#[derive(Debug, Clone)]
pub enum Pattern {
    /// Exact token text, e.g. `${cmd}`.
    Token(String),
    /// Regex that must match the whole token.
    Regex(Regex),
}

impl Pattern {
    fn matches(&self, token: &str) -> Option<RuleMatch> {
        match self {
            Pattern::Token(t) if t == token => Some(RuleMatch {
                token: token.to_string(),
                captures: vec![Some(token.to_string())],
            }),
            Pattern::Token(_) => None,
            Pattern::Regex(re) => {
                let caps = re.captures(token)?;
                let whole = caps.get(0)?;
                if whole.start() != 0 || whole.end() != token.len() {
                    return None;
                }
                Some(RuleMatch {
                    token: token.to_string(),
                    captures: caps
                        .iter()
                        .map(|c| c.map(|m| m.as_str().to_string()))
                        .collect(),
                })
            }
        }
    }
}

/// One entry of a resolver's rule table.
#[derive(Debug, Clone)]
pub struct ResolveRule {
    pub pattern: Pattern,
    pub rule: Rule,
    /// List values are spliced into argument arrays instead of joined.
    pub is_flat: bool,
}

impl ResolveRule {
    pub fn new(pattern: Pattern, rule: Rule) -> Self {
        Self {
            pattern,
            rule,
            is_flat: false,
        }
    }

    /// `token` resolves to a fixed string.
    pub fn literal(token: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(
            Pattern::Token(token.into()),
            Rule::Value(RuleValue::Str(value.into())),
        )
    }

    /// `token` resolves to a fixed list.
    pub fn list<I, S>(token: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            Pattern::Token(token.into()),
            Rule::Value(RuleValue::List(values.into_iter().map(Into::into).collect())),
        )
    }

    /// `token` resolves through a synchronous function.
    pub fn sync<F>(token: impl Into<String>, f: F) -> Self
    where
        F: Fn(&RuleMatch) -> Option<RuleValue> + Send + Sync + 'static,
    {
        Self::new(Pattern::Token(token.into()), Rule::Sync(Arc::new(f)))
    }

    /// `token` resolves through an asynchronous function.
    pub fn async_fn<F>(token: impl Into<String>, f: F) -> Self
    where
        F: Fn(RuleMatch) -> BoxFuture<'static, Option<RuleValue>> + Send + Sync + 'static,
    {
        Self::new(Pattern::Token(token.into()), Rule::Async(Arc::new(f)))
    }

    /// Tokens matching `re` resolve through a synchronous function of the
    /// captures.
    pub fn regex<F>(re: Regex, f: F) -> Self
    where
        F: Fn(&RuleMatch) -> Option<RuleValue> + Send + Sync + 'static,
    {
        Self::new(Pattern::Regex(re), Rule::Sync(Arc::new(f)))
    }

    /// Marks the rule as flat.
    pub fn flat(mut self) -> Self {
        self.is_flat = true;
        self
    }

    async fn evaluate(&self, m: RuleMatch) -> Option<RuleValue> {
        match &self.rule {
            Rule::Value(v) => Some(v.clone()),
            Rule::Sync(f) => f(&m),
            Rule::Async(f) => f(m).await,
        }
    }
}

/// Ordered rule table with an optional parent resolver.
#[derive(Debug, Clone, Default)]
pub struct VariableResolver {
    rules: Vec<ResolveRule>,
    parent: Option<Arc<VariableResolver>>,
}

impl VariableResolver {
    pub fn new(rules: Vec<ResolveRule>) -> Self {
        Self {
            rules,
            parent: None,
        }
    }

    /// Creates a resolver whose unresolved tokens fall through to `parent`.
    pub fn with_parent(rules: Vec<ResolveRule>, parent: Arc<VariableResolver>) -> Self {
        Self {
            rules,
            parent: Some(parent),
        }
    }

    /// Variables available everywhere: path separators and `${env:NAME}`.
    pub fn global() -> Self {
        let env_re = Regex::new(r"^\$\{env:([^}]+)\}$")
            .unwrap_or_else(|e| panic!("invalid env regex: {e}"));
        Self::new(vec![
            ResolveRule::literal("${osPathSep}", std::path::MAIN_SEPARATOR.to_string()),
            ResolveRule::literal("${osPathEnvSep}", if cfg!(windows) { ";" } else { ":" }),
            ResolveRule::regex(env_re, |m| {
                // An unset variable resolves to the empty string.
                let name = m.group(1)?;
                Some(RuleValue::Str(std::env::var(name).unwrap_or_default()))
            }),
        ])
    }

    /// Rules describing a path: `${<prefix>}` is the path itself, and
    /// `${<prefix>Filename}`/`${<prefix>Dirpath}` its components. Used for the
    /// per-executable variables.
    pub fn path_rules(name: &str, path: &Path) -> Vec<ResolveRule> {
        let file = path
            .file_name()
            .map(|f| f.to_string_lossy().to_string())
            .unwrap_or_default();
        let dir = path
            .parent()
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_default();
        vec![
            ResolveRule::literal(format!("${{{}}}", name), path.to_string_lossy()),
            ResolveRule::literal(format!("${{{}Filename}}", name), file),
            ResolveRule::literal(format!("${{{}Dirpath}}", name), dir),
        ]
    }

    /// Finds the value for a single token, walking up the parent chain.
    /// Returns the value and whether the producing rule is flat.
    fn lookup<'a>(&'a self, token: &'a str) -> BoxFuture<'a, Option<(RuleValue, bool)>> {
        Box::pin(async move {
            for rule in &self.rules {
                if let Some(m) = rule.pattern.matches(token) {
                    // First match wins even if it declines to produce a value.
                    return rule.evaluate(m).await.map(|v| (v, rule.is_flat));
                }
            }
            match &self.parent {
                Some(parent) => parent.lookup(token).await,
                None => None,
            }
        })
    }

    /// Replaces every recognized token in `input`.
    pub async fn resolve_str(&self, input: &str) -> String {
        let mut out = String::with_capacity(input.len());
        let mut last = 0;
        for m in TOKEN_RE.find_iter(input) {
            out.push_str(&input[last..m.start()]);
            match self.lookup(m.as_str()).await {
                Some((value, _)) => out.push_str(&value.into_joined()),
                None => out.push_str(m.as_str()),
            }
            last = m.end();
        }
        out.push_str(&input[last..]);
        out
    }

    /// Resolves an argument array. An element consisting solely of a flat
    /// list-valued token expands to one element per list item.
    pub async fn resolve_args(&self, args: &[String]) -> Vec<String> {
        let mut out = Vec::with_capacity(args.len());
        for arg in args {
            let is_single_token = TOKEN_RE
                .find(arg)
                .is_some_and(|m| m.start() == 0 && m.end() == arg.len());

            if is_single_token {
                match self.lookup(arg).await {
                    Some((RuleValue::List(items), true)) => out.extend(items),
                    Some((value, _)) => out.push(value.into_joined()),
                    None => out.push(arg.clone()),
                }
            } else {
                out.push(self.resolve_str(arg).await);
            }
        }
        out
    }

    /// Resolves the values of environment pairs (keys are left as-is).
    pub async fn resolve_env(&self, env: &[(String, String)]) -> Vec<(String, String)> {
        let mut out = Vec::with_capacity(env.len());
        for (key, value) in env {
            out.push((key.clone(), self.resolve_str(value).await));
        }
        out
    }
}
