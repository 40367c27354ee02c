//! CmdStan method selection and hierarchical method arguments.
//!
//! CmdStan's command line is a tree: `max_depth` only exists once
//! `algorithm=hmc engine=nuts` has been chosen, `delta` only inside the
//! `adapt` group. [`ArgBuilder`] checks every token against that tree in the
//! order given and produces a validated [`MethodArgs`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StanError};

/// The CmdStan method to invoke.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    /// MCMC sampling (NUTS by default).
    #[default]
    Sample,

    /// Posterior mode via optimization.
    Optimize,

    /// Approximate posterior via ADVI.
    Variational,
}

impl Method {
    /// The method keyword on the command line.
    pub fn token(&self) -> &'static str {
        match self {
            Method::Sample => "sample",
            Method::Optimize => "optimize",
            Method::Variational => "variational",
        }
    }

    /// The method-level option that receives the run's iteration count.
    pub fn iteration_key(&self) -> &'static str {
        match self {
            Method::Sample => "num_samples",
            Method::Optimize => "iter",
            Method::Variational => "output_samples",
        }
    }

    /// Method-level options driven by [`crate::RunConfig`] rather than by the caller.
    fn managed_keys(&self) -> &'static [&'static str] {
        match self {
            Method::Sample => &["num_samples", "num_warmup"],
            Method::Optimize => &["iter"],
            Method::Variational => &["output_samples"],
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

impl FromStr for Method {
    type Err = StanError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sample" => Ok(Method::Sample),
            "optimize" => Ok(Method::Optimize),
            "variational" => Ok(Method::Variational),
            other => Err(StanError::InvalidArgument {
                token: other.to_string(),
                reason: "method must be one of sample, optimize, variational".to_string(),
            }),
        }
    }
}

/// Where an option sits in the argument tree.
#[derive(Debug, Clone, Copy)]
enum Parent {
    /// Directly under the method keyword.
    Method,
    /// Inside a keyword group such as `adapt`.
    Group(&'static str),
    /// Only once `key` has been set to one of `values`.
    Choice(&'static str, &'static [&'static str]),
}

impl fmt::Display for Parent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Parent::Method => f.write_str("method"),
            Parent::Group(g) => f.write_str(g),
            Parent::Choice(key, values) => write!(f, "{key}={}", values.join("|")),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Kind {
    /// Bare keyword opening a group, e.g. `adapt`.
    Group,
    /// `key=value` restricted to a fixed set.
    Choice(&'static [&'static str]),
    /// `key=value` with a free value.
    Value,
}

#[derive(Debug, Clone, Copy)]
struct OptionSpec {
    method: Method,
    parent: Parent,
    name: &'static str,
    kind: Kind,
}

const fn opt(method: Method, parent: Parent, name: &'static str, kind: Kind) -> OptionSpec {
    OptionSpec {
        method,
        parent,
        name,
        kind,
    }
}

const HMC: Parent = Parent::Choice("algorithm", &["hmc"]);
const NUTS: Parent = Parent::Choice("engine", &["nuts"]);
const STATIC: Parent = Parent::Choice("engine", &["static"]);
const QUASI_NEWTON: Parent = Parent::Choice("algorithm", &["bfgs", "lbfgs"]);
const LBFGS: Parent = Parent::Choice("algorithm", &["lbfgs"]);
const ADAPT: Parent = Parent::Group("adapt");

use Kind::{Choice, Group, Value};
use Method::{Optimize, Sample, Variational};

static GRAMMAR: &[OptionSpec] = &[
    // sample
    opt(Sample, Parent::Method, "save_warmup", Value),
    opt(Sample, Parent::Method, "thin", Value),
    opt(Sample, Parent::Method, "adapt", Group),
    opt(Sample, ADAPT, "engaged", Value),
    opt(Sample, ADAPT, "gamma", Value),
    opt(Sample, ADAPT, "delta", Value),
    opt(Sample, ADAPT, "kappa", Value),
    opt(Sample, ADAPT, "t0", Value),
    opt(Sample, ADAPT, "init_buffer", Value),
    opt(Sample, ADAPT, "term_buffer", Value),
    opt(Sample, ADAPT, "window", Value),
    opt(Sample, ADAPT, "save_metric", Value),
    opt(Sample, Parent::Method, "algorithm", Choice(&["hmc", "fixed_param"])),
    opt(Sample, HMC, "engine", Choice(&["nuts", "static"])),
    opt(Sample, HMC, "metric", Choice(&["unit_e", "diag_e", "dense_e"])),
    opt(Sample, HMC, "metric_file", Value),
    opt(Sample, HMC, "stepsize", Value),
    opt(Sample, HMC, "stepsize_jitter", Value),
    opt(Sample, NUTS, "max_depth", Value),
    opt(Sample, STATIC, "int_time", Value),
    // optimize
    opt(Optimize, Parent::Method, "algorithm", Choice(&["lbfgs", "bfgs", "newton"])),
    opt(Optimize, Parent::Method, "jacobian", Value),
    opt(Optimize, Parent::Method, "save_iterations", Value),
    opt(Optimize, QUASI_NEWTON, "init_alpha", Value),
    opt(Optimize, QUASI_NEWTON, "tol_obj", Value),
    opt(Optimize, QUASI_NEWTON, "tol_rel_obj", Value),
    opt(Optimize, QUASI_NEWTON, "tol_grad", Value),
    opt(Optimize, QUASI_NEWTON, "tol_rel_grad", Value),
    opt(Optimize, QUASI_NEWTON, "tol_param", Value),
    opt(Optimize, LBFGS, "history_size", Value),
    // variational
    opt(Variational, Parent::Method, "algorithm", Choice(&["meanfield", "fullrank"])),
    opt(Variational, Parent::Method, "iter", Value),
    opt(Variational, Parent::Method, "grad_samples", Value),
    opt(Variational, Parent::Method, "elbo_samples", Value),
    opt(Variational, Parent::Method, "eta", Value),
    opt(Variational, Parent::Method, "tol_rel_obj", Value),
    opt(Variational, Parent::Method, "eval_elbo", Value),
    opt(Variational, Parent::Method, "adapt", Group),
    opt(Variational, ADAPT, "engaged", Value),
    opt(Variational, ADAPT, "iter", Value),
];

/// A single `name` or `name=value` token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgToken {
    pub name: String,
    pub value: Option<String>,
}

impl ArgToken {
    /// Split a raw `name=value` or bare `name` token.
    pub fn parse(raw: &str) -> Self {
        match raw.split_once('=') {
            Some((name, value)) => ArgToken {
                name: name.to_string(),
                value: Some(value.to_string()),
            },
            None => ArgToken {
                name: raw.to_string(),
                value: None,
            },
        }
    }
}

impl fmt::Display for ArgToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Some(v) => write!(f, "{}={}", self.name, v),
            None => f.write_str(&self.name),
        }
    }
}

/// Method arguments that passed grammar validation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MethodArgs {
    method: Method,
    tokens: Vec<ArgToken>,
}

impl MethodArgs {
    /// No extra arguments for `method`.
    pub fn empty(method: Method) -> Self {
        Self {
            method,
            tokens: Vec::new(),
        }
    }

    /// Parse and validate a whitespace-separated argument string such as
    /// `"adapt delta=0.95"` or `"algorithm=hmc engine=nuts max_depth=20"`.
    pub fn parse(method: Method, text: &str) -> Result<Self> {
        text.split_whitespace()
            .fold(ArgBuilder::new(method), |b, raw| b.token(ArgToken::parse(raw)))
            .build()
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn tokens(&self) -> &[ArgToken] {
        &self.tokens
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Render as command-line arguments.
    pub fn to_args(&self) -> Vec<String> {
        self.tokens.iter().map(ToString::to_string).collect()
    }
}

/// Builder for [`MethodArgs`]; tokens are validated in insertion order on [`build`](Self::build).
#[derive(Debug, Clone)]
pub struct ArgBuilder {
    method: Method,
    tokens: Vec<ArgToken>,
}

impl ArgBuilder {
    pub fn new(method: Method) -> Self {
        Self {
            method,
            tokens: Vec::new(),
        }
    }

    /// Open a keyword group such as `adapt`.
    pub fn group(self, name: impl Into<String>) -> Self {
        self.token(ArgToken {
            name: name.into(),
            value: None,
        })
    }

    /// Set `name=value`.
    pub fn set(self, name: impl Into<String>, value: impl fmt::Display) -> Self {
        self.token(ArgToken {
            name: name.into(),
            value: Some(value.to_string()),
        })
    }

    pub fn token(mut self, token: ArgToken) -> Self {
        self.tokens.push(token);
        self
    }

    /// Validate every token against the argument tree.
    pub fn build(self) -> Result<MethodArgs> {
        let mut state = GrammarState::default();
        for token in &self.tokens {
            state.accept(self.method, token)?;
        }
        Ok(MethodArgs {
            method: self.method,
            tokens: self.tokens,
        })
    }
}

/// Tracks which groups and choices are active while walking tokens.
#[derive(Debug, Default)]
struct GrammarState {
    /// Activated contexts in order: group names and `key=value` choices.
    active: Vec<(String, Option<String>)>,
    seen: Vec<String>,
}

impl GrammarState {
    /// Depth of the activation satisfying `parent`: `Some(0)` for the method
    /// level, `Some(i + 1)` for the i-th activation, `None` if inactive.
    fn activation(&self, parent: Parent) -> Option<usize> {
        match parent {
            Parent::Method => Some(0),
            Parent::Group(g) => self
                .active
                .iter()
                .rposition(|(name, value)| name == g && value.is_none())
                .map(|i| i + 1),
            Parent::Choice(key, values) => self
                .active
                .iter()
                .rposition(|(name, value)| {
                    name == key && value.as_deref().is_some_and(|v| values.contains(&v))
                })
                .map(|i| i + 1),
        }
    }

    fn accept(&mut self, method: Method, token: &ArgToken) -> Result<()> {
        let invalid = |reason: String| StanError::InvalidArgument {
            token: token.to_string(),
            reason,
        };

        if token.name.is_empty() {
            return Err(invalid("empty option name".to_string()));
        }
        if method.managed_keys().contains(&token.name.as_str()) {
            return Err(invalid(format!(
                "'{}' is set from the run configuration",
                token.name
            )));
        }

        let candidates: Vec<&OptionSpec> = GRAMMAR
            .iter()
            .filter(|s| s.method == method && s.name == token.name)
            .collect();
        if candidates.is_empty() {
            return Err(invalid(format!("not a {method} option")));
        }

        // Innermost (most recently activated) parent wins.
        let entry = candidates
            .iter()
            .filter_map(|s| self.activation(s.parent).map(|pos| (pos, *s)))
            .max_by_key(|(pos, _)| *pos)
            .map(|(_, s)| s)
            .ok_or_else(|| {
                let parents: Vec<String> = candidates.iter().map(|s| s.parent.to_string()).collect();
                invalid(format!("requires {} to be set first", parents.join(" or ")))
            })?;

        match (entry.kind, &token.value) {
            (Kind::Group, Some(_)) => {
                return Err(invalid(format!("'{}' is a group and takes no value", entry.name)))
            }
            (Kind::Choice(_) | Kind::Value, None) => {
                return Err(invalid(format!("'{}' requires a value", entry.name)))
            }
            (Kind::Choice(allowed), Some(v)) if !allowed.contains(&v.as_str()) => {
                return Err(invalid(format!("expected one of {}", allowed.join(", "))))
            }
            (Kind::Value, Some(v)) if v.is_empty() => {
                return Err(invalid(format!("'{}' requires a value", entry.name)))
            }
            _ => {}
        }

        let scope = format!("{}/{}", entry.parent, entry.name);
        if self.seen.contains(&scope) {
            return Err(invalid("option given more than once".to_string()));
        }
        self.seen.push(scope);

        if matches!(entry.kind, Kind::Group | Kind::Choice(_)) {
            self.active.push((token.name.clone(), token.value.clone()));
        }
        Ok(())
    }
}
