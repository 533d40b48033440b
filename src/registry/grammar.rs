//! Configuration string grammar
//!
//! ```text
//! config := term (',' term)*
//! term   := chain ('(' config ')')?
//! chain  := IDENT ('+' IDENT)*
//! IDENT  := [0-9A-Za-z_.$]+
//! ```
//!
//! `usb+u2a(i2c+sensor,gpio)` is a chain of `usb` and `u2a`, where `u2a`
//! parents two branches. Whitespace around tokens is ignored. Error messages
//! are returned bare; the registry wraps them with the full configuration.

use crate::error::{LinkError, Result};

/// One comma separated item: a chain and the branches under its last node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Term {
    /// Node ids from the root of the chain down
    pub chain: Vec<String>,
    /// Branches attached below the last node of the chain
    pub children: Vec<Term>,
}

impl std::fmt::Display for Term {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.chain.join("+"))?;
        if !self.children.is_empty() {
            write!(f, "({})", render(&self.children))?;
        }
        Ok(())
    }
}

/// Render terms back into configuration syntax
pub fn render(terms: &[Term]) -> String {
    terms
        .iter()
        .map(Term::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// Whether `name` only uses identifier characters
pub fn is_valid_identifier(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '$'))
}

/// Lower-cased identifier, or the bad identifier error
pub fn validate_identifier(name: &str) -> Result<String> {
    let lowered = name.to_lowercase();
    if is_valid_identifier(&lowered) {
        Ok(lowered)
    } else {
        Err(LinkError::BadIdentifier(lowered))
    }
}

/// Parse a whole configuration string
pub fn parse_configuration(config: &str) -> Result<Vec<Term>> {
    let config = config.trim();
    if config.is_empty() {
        return Err(LinkError::EmptyConfiguration);
    }
    parse_list(config)
}

/// Split on commas that are not nested inside parentheses
fn split_top_level(config: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    for (i, c) in config.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth -= 1,
            ',' if depth <= 0 => {
                parts.push(&config[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&config[start..]);
    parts
}

fn parse_list(config: &str) -> Result<Vec<Term>> {
    let items: Vec<&str> = split_top_level(config).into_iter().map(str::trim).collect();
    if items.iter().any(|item| item.is_empty()) {
        return Err(LinkError::Syntax(format!(
            "Missing at least one child in this comma separated list \"{}\"",
            config
        )));
    }
    items.into_iter().map(parse_term).collect()
}

/// Index of the parenthesis closing the one at `open`
fn matching_close(config: &str, open: usize) -> Option<usize> {
    let mut depth = 0i32;
    for (i, c) in config[open..].char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(open + i);
                }
            }
            _ => {}
        }
    }
    None
}

fn parse_term(config: &str) -> Result<Term> {
    let Some(open) = config.find('(') else {
        return Ok(Term {
            chain: parse_chain(config)?,
            children: Vec::new(),
        });
    };

    if !config.ends_with(')') {
        return Err(LinkError::Syntax(format!(
            "Operator () is missing a closing parenthesis \")\" at the end of \"{}\"",
            config
        )));
    }
    if let Some(close) = matching_close(config, open) {
        if close + 1 < config.len() {
            return Err(LinkError::Syntax(format!(
                "The configuration must represent a tree, but child nodes found after: \"{}\"",
                &config[..=close]
            )));
        }
    }

    let inner = config[open + 1..config.len() - 1].trim();
    if inner.is_empty() {
        return Err(LinkError::Syntax(
            "Operator () is empty, but was expecting a comma separated list of child nodes"
                .to_string(),
        ));
    }
    let children = parse_list(inner)?;

    let parent = config[..open].trim();
    if parent.is_empty() {
        return Err(LinkError::Syntax(format!(
            "Operator () is missing the parent node, which was expected before the opening parentheses of \"{}\"",
            config
        )));
    }
    Ok(Term {
        chain: parse_chain(parent)?,
        children,
    })
}

fn parse_chain(config: &str) -> Result<Vec<String>> {
    let nodes: Vec<&str> = config.split('+').collect();
    for i in (0..nodes.len()).rev() {
        let name = nodes[i].trim();
        if name.is_empty() {
            if i == 0 {
                return Err(LinkError::Syntax(format!(
                    "Operator + is missing it's left parameter in \"{}\"",
                    config
                )));
            }
            return Err(LinkError::Syntax(format!(
                "Operator + is missing it's right parameter in \"{}+\"",
                nodes[i - 1]
            )));
        }
        validate_identifier(name)?;
    }
    Ok(nodes.into_iter().map(|n| n.trim().to_string()).collect())
}

/// Every well formed identifier mentioned in a configuration, lower-cased
///
/// Tolerates malformed configurations; used to wait for nodes that are not
/// registered yet.
pub fn identifiers(config: &str) -> Vec<String> {
    config
        .to_lowercase()
        .split(|c| matches!(c, ',' | '(' | ')' | '+'))
        .map(str::trim)
        .filter(|id| is_valid_identifier(id))
        .map(str::to_string)
        .collect()
}
