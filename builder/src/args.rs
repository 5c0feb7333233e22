//! Build-time arguments (`ARG`) and `$VAR` substitution.
//!
//! Arguments are declared in instruction order. A declaration may carry a
//! default; values supplied by the caller (`--build-arg KEY=VALUE`)
//! override it. Referencing a name that was never declared is an error.

use std::collections::HashMap;

use a3s_build_core::error::{BuildError, Result};

/// Declared build arguments plus externally supplied values.
#[derive(Debug, Clone, Default)]
pub struct BuildArgs {
    /// Declarations in order: name → default
    declared: Vec<(String, Option<String>)>,
    /// Caller-supplied values
    overrides: HashMap<String, String>,
}

impl BuildArgs {
    /// Create an empty argument set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an argument set from `KEY=VALUE` overrides.
    ///
    /// A bare `KEY` takes its value from the process environment.
    pub fn from_overrides(pairs: &[String]) -> Result<Self> {
        let mut overrides = HashMap::new();
        for pair in pairs {
            let (key, value) = match pair.split_once('=') {
                Some((k, v)) => (k.to_string(), v.to_string()),
                None => {
                    let value = std::env::var(pair).map_err(|_| {
                        BuildError::BuildArg(format!(
                            "malformed build argument '{}': expected KEY=VALUE",
                            pair
                        ))
                    })?;
                    (pair.clone(), value)
                }
            };
            validate_name(&key)?;
            overrides.insert(key, value);
        }

        Ok(Self {
            declared: Vec::new(),
            overrides,
        })
    }

    /// Declare `name`, optionally with a default value.
    ///
    /// Re-declaring a name keeps its position and replaces the default.
    pub fn declare(&mut self, name: &str, default: Option<String>) -> Result<()> {
        validate_name(name)?;
        match self.declared.iter_mut().find(|(n, _)| n == name) {
            Some(entry) => entry.1 = default,
            None => self.declared.push((name.to_string(), default)),
        }
        Ok(())
    }

    /// Whether `name` has been declared.
    pub fn is_declared(&self, name: &str) -> bool {
        self.declared.iter().any(|(n, _)| n == name)
    }

    /// Resolve the value of a declared argument.
    pub fn value(&self, name: &str) -> Result<String> {
        let default = self
            .declared
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, d)| d)
            .ok_or_else(|| {
                BuildError::BuildArg(format!("undeclared build argument {}", name))
            })?;

        if let Some(value) = self.overrides.get(name) {
            return Ok(value.clone());
        }

        default.clone().ok_or_else(|| {
            BuildError::BuildArg(format!(
                "build argument {} is declared without a default and no value was supplied",
                name
            ))
        })
    }

    /// Declared arguments that have a value, in declaration order.
    pub fn resolved(&self) -> Vec<(String, String)> {
        self.declared
            .iter()
            .filter_map(|(name, _)| self.value(name).ok().map(|v| (name.clone(), v)))
            .collect()
    }

    /// Supplied overrides that were never declared.
    pub fn unused_overrides(&self) -> Vec<&str> {
        let mut unused: Vec<&str> = self
            .overrides
            .keys()
            .filter(|k| !self.is_declared(k))
            .map(|k| k.as_str())
            .collect();
        unused.sort_unstable();
        unused
    }

    /// Expand `$NAME` and `${NAME}` references in `text`.
    ///
    /// Names are looked up in the image environment (`NAME=value` entries,
    /// last one wins) and then among the declared arguments. `${NAME:-word}`
    /// falls back to `word` when the name is unset or empty, and `\$` yields
    /// a literal dollar sign.
    pub fn substitute(&self, text: &str, env: &[String]) -> Result<String> {
        let mut out = String::with_capacity(text.len());
        let mut chars = text.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '\\' if chars.peek() == Some(&'$') => {
                    chars.next();
                    out.push('$');
                }
                '$' => match chars.peek() {
                    Some('{') => {
                        chars.next();
                        let mut body = String::new();
                        let mut closed = false;
                        for c in chars.by_ref() {
                            if c == '}' {
                                closed = true;
                                break;
                            }
                            body.push(c);
                        }
                        if !closed {
                            return Err(BuildError::BuildArg(format!(
                                "unterminated variable reference in '{}'",
                                text
                            )));
                        }
                        out.push_str(&self.expand_braced(&body, env)?);
                    }
                    Some(&c) if c == '_' || c.is_ascii_alphabetic() => {
                        let mut name = String::new();
                        while let Some(&c) = chars.peek() {
                            if c == '_' || c.is_ascii_alphanumeric() {
                                name.push(c);
                                chars.next();
                            } else {
                                break;
                            }
                        }
                        out.push_str(&self.lookup(&name, env)?);
                    }
                    _ => out.push('$'),
                },
                _ => out.push(c),
            }
        }

        Ok(out)
    }

    fn expand_braced(&self, body: &str, env: &[String]) -> Result<String> {
        if let Some((name, fallback)) = body.split_once(":-") {
            let value = match env_value(name, env) {
                Some(v) => Some(v.to_string()),
                None if self.is_declared(name) => self.value(name).ok(),
                None => None,
            };
            return match value {
                Some(v) if !v.is_empty() => Ok(v),
                _ => self.substitute(fallback, env),
            };
        }
        validate_name(body)?;
        self.lookup(body, env)
    }

    fn lookup(&self, name: &str, env: &[String]) -> Result<String> {
        match env_value(name, env) {
            Some(v) => Ok(v.to_string()),
            None => self.value(name),
        }
    }
}

/// Find `name` in a list of `NAME=value` strings (last match wins).
pub(crate) fn env_value<'a>(name: &str, env: &'a [String]) -> Option<&'a str> {
    env.iter().rev().find_map(|entry| {
        entry
            .split_once('=')
            .filter(|(k, _)| *k == name)
            .map(|(_, v)| v)
    })
}

fn validate_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(c) if c == '_' || c.is_ascii_alphabetic() => {
            chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(BuildError::BuildArg(format!(
            "invalid build argument name '{}'",
            name
        )))
    }
}
