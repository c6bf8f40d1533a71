use std::collections::HashSet;

use autoforge_agent::{CommandGate, GateDecision};
use serde::{Deserialize, Serialize};

/// Shell interpreters whose `-c` payloads must themselves be validated.
const SHELL_INTERPRETERS: &[&str] = &["bash", "sh", "zsh"];

/// Allowlist of command names for a project plus the detected stack tags
/// that produced it. Built elsewhere; the gate only reads it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecurityProfile {
    pub allowed_commands: HashSet<String>,
    #[serde(default)]
    pub stack: Vec<String>,
}

impl SecurityProfile {
    pub fn from_commands<I, S>(commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed_commands: commands.into_iter().map(Into::into).collect(),
            stack: Vec::new(),
        }
    }

    pub fn is_allowed(&self, command: &str) -> bool {
        self.allowed_commands.contains(command)
    }
}

/// Pure decision function over proposed shell commands. Total: every
/// input yields either an allow with empty reason or a deny with a
/// human-readable one. Never touches the filesystem or network.
pub struct PolicyGate {
    profile: SecurityProfile,
}

impl PolicyGate {
    pub fn new(profile: SecurityProfile) -> Self {
        Self { profile }
    }

    pub fn profile(&self) -> &SecurityProfile {
        &self.profile
    }

    pub fn check(&self, command: &str) -> GateDecision {
        if command.trim().is_empty() {
            return GateDecision::allow();
        }

        // Process substitution can smuggle commands past any token-level
        // check, so it is blocked outright.
        for pattern in ["<(", ">("] {
            if command.contains(pattern) {
                return GateDecision::deny(format!(
                    "Process substitution '{pattern}' not allowed in shell commands"
                ));
            }
        }

        for segment in split_segments(command) {
            let tokens = match shlex::split(&segment) {
                Some(tokens) => tokens,
                None => {
                    return GateDecision::deny(format!(
                        "Could not parse command (malformed quoting): {segment}"
                    ))
                }
            };

            let Some(head) = head_token(&tokens) else {
                continue;
            };
            let name = command_basename(head);

            if !self.profile.is_allowed(&name) {
                return GateDecision::deny(format!(
                    "Command '{name}' is not in the allowed command list"
                ));
            }

            if SHELL_INTERPRETERS.contains(&name.as_str()) {
                if let Some(decision) = self.check_shell_invocation(&tokens) {
                    if !decision.allowed {
                        return decision;
                    }
                }
            }
        }

        GateDecision::allow()
    }

    /// Validate the `-c` payload of a shell interpreter invocation by the
    /// same rules, recursively. A shell run without `-c` (e.g.
    /// `bash script.sh`) passes here; the script itself is not inspected.
    fn check_shell_invocation(&self, tokens: &[String]) -> Option<GateDecision> {
        let payload = extract_c_argument(tokens)?;
        if payload.trim().is_empty() {
            return Some(GateDecision::allow());
        }
        let inner = self.check(&payload);
        if inner.allowed {
            Some(inner)
        } else {
            Some(GateDecision::deny(format!(
                "Command inside shell -c is not allowed: {}",
                inner.reason
            )))
        }
    }
}

impl CommandGate for PolicyGate {
    fn evaluate(&self, command: &str) -> GateDecision {
        self.check(command)
    }
}

/// Split a command line into pipeline/conditional segments at unquoted
/// `&&`, `||`, `;`, `|`, and newlines.
fn split_segments(command: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut chars = command.chars().peekable();
    let mut in_single = false;
    let mut in_double = false;

    while let Some(c) = chars.next() {
        match c {
            '\\' if !in_single => {
                current.push(c);
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            '\'' if !in_double => {
                in_single = !in_single;
                current.push(c);
            }
            '"' if !in_single => {
                in_double = !in_double;
                current.push(c);
            }
            '&' | '|' if !in_single && !in_double => {
                if chars.peek() == Some(&c) {
                    chars.next();
                }
                segments.push(std::mem::take(&mut current));
            }
            ';' | '\n' if !in_single && !in_double => {
                segments.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    segments.push(current);

    segments
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// First token that is an actual command, skipping leading VAR=value
/// environment assignments.
fn head_token(tokens: &[String]) -> Option<&String> {
    tokens.iter().find(|t| {
        !t.split_once('=')
            .map(|(name, _)| {
                !name.is_empty()
                    && name
                        .bytes()
                        .all(|b| b.is_ascii_alphanumeric() || b == b'_')
            })
            .unwrap_or(false)
    })
}

/// Strip a leading path and a Windows `.exe` suffix from a command token.
fn command_basename(token: &str) -> String {
    let base = token
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(token)
        .to_string();
    base.strip_suffix(".exe").map(String::from).unwrap_or(base)
}

/// Locate the payload of a `-c` invocation. Handles the bare flag and
/// bundled short options (`-xc`, `-exc`); the payload is the next token.
fn extract_c_argument(tokens: &[String]) -> Option<String> {
    for (i, token) in tokens.iter().enumerate() {
        let is_c_flag = token == "-c"
            || (token.starts_with('-')
                && !token.starts_with("--")
                && token[1..].contains('c'));
        if is_c_flag {
            if let Some(payload) = tokens.get(i + 1) {
                return Some(payload.clone());
            }
        }
    }
    None
}
