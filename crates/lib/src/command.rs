//! Command construction: turn operator tokens into the argv that will be executed.
//! No shell is used; every token stays a single argument, whatever it contains.

use std::borrow::Cow;
use std::fmt;
use std::path::Path;

/// Ordered, unparsed argv: `[elevation program, script path, caller args...]`.
/// Tokens are never re-tokenized or interpreted after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandVector(Vec<String>);

impl CommandVector {
    pub fn new(tokens: Vec<String>) -> Self {
        Self(tokens)
    }

    /// Program to execute (first token), if any.
    pub fn program(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    /// Arguments after the program.
    pub fn args(&self) -> &[String] {
        self.0.get(1..).unwrap_or(&[])
    }

    pub fn tokens(&self) -> &[String] {
        &self.0
    }

    /// Human-readable rendering: tokens joined by spaces, each quoted as one POSIX shell word.
    pub fn render(&self) -> String {
        self.0
            .iter()
            .map(|t| quote_token(t))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for CommandVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// Quote a single token for display. Tokens shlex refuses (interior NUL) fall back to a debug literal.
fn quote_token(token: &str) -> Cow<'_, str> {
    shlex::try_quote(token).unwrap_or_else(|_| Cow::Owned(format!("{:?}", token)))
}

/// Builds command vectors prefixed with the privilege-elevation program (e.g. `sudo`).
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    /// None when the bot already runs with the privileges the script needs.
    elevation: Option<String>,
}

impl CommandBuilder {
    pub fn new(elevation: Option<String>) -> Self {
        Self {
            elevation: elevation.filter(|e| !e.trim().is_empty()),
        }
    }

    /// `script_path` must already be absolute and resolved; `args` are forwarded verbatim.
    pub fn build<I, S>(&self, script_path: &Path, args: I) -> CommandVector
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut tokens = Vec::new();
        if let Some(ref e) = self.elevation {
            tokens.push(e.clone());
        }
        tokens.push(script_path.to_string_lossy().into_owned());
        tokens.extend(args.into_iter().map(Into::into));
        CommandVector(tokens)
    }
}
