//! Compact node-name lists.
//!
//! Step layouts carry their node names as a single ranged string such as
//! `node[01-04,9],login1`. [`Hostlist`] expands that representation into the
//! ordered list of names, preserving zero padding from the lower bound of
//! each range.

use std::fmt;
use thiserror::Error;

/// Upper bound on the number of names a single list may expand to.
pub const MAX_HOSTS: usize = 1 << 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HostlistError {
    #[error("unbalanced brackets in host expression '{0}'")]
    UnbalancedBracket(String),
    #[error("invalid range '{range}' in host expression '{expr}'")]
    InvalidRange { expr: String, range: String },
    #[error("nested or repeated bracket groups are not supported: '{0}'")]
    Unsupported(String),
    #[error("host list expands to more than {MAX_HOSTS} names")]
    TooManyHosts,
}

/// Ordered, expanded list of node names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Hostlist {
    hosts: Vec<String>,
}

impl Hostlist {
    pub fn parse(expr: &str) -> Result<Self, HostlistError> {
        let mut hosts = Vec::new();
        for token in split_top_level(expr)? {
            expand_token(token, &mut hosts)?;
        }
        Ok(Self { hosts })
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn nth(&self, index: usize) -> Option<&str> {
        self.hosts.get(index).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.hosts.iter().map(String::as_str)
    }

    pub fn into_vec(self) -> Vec<String> {
        self.hosts
    }
}

impl fmt::Display for Hostlist {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hosts.join(","))
    }
}

/// Splits on commas that are not inside a bracket group.
fn split_top_level(expr: &str) -> Result<Vec<&str>, HostlistError> {
    let mut tokens = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;

    for (idx, ch) in expr.char_indices() {
        match ch {
            '[' => depth += 1,
            ']' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| HostlistError::UnbalancedBracket(expr.to_string()))?;
            }
            ',' if depth == 0 => {
                tokens.push(expr[start..idx].trim());
                start = idx + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(HostlistError::UnbalancedBracket(expr.to_string()));
    }
    tokens.push(expr[start..].trim());
    tokens.retain(|t| !t.is_empty());
    Ok(tokens)
}

fn expand_token(token: &str, out: &mut Vec<String>) -> Result<(), HostlistError> {
    let Some(open) = token.find('[') else {
        push_host(out, token.to_string())?;
        return Ok(());
    };
    let close = token[open..]
        .find(']')
        .map(|rel| open + rel)
        .ok_or_else(|| HostlistError::UnbalancedBracket(token.to_string()))?;

    let prefix = &token[..open];
    let body = &token[open + 1..close];
    let suffix = &token[close + 1..];
    if body.contains('[') || suffix.contains('[') || suffix.contains(']') {
        return Err(HostlistError::Unsupported(token.to_string()));
    }

    for range in body.split(',').map(str::trim) {
        let invalid = || HostlistError::InvalidRange {
            expr: token.to_string(),
            range: range.to_string(),
        };
        match range.split_once('-') {
            Some((lo_raw, hi_raw)) => {
                let lo: u64 = lo_raw.trim().parse().map_err(|_| invalid())?;
                let hi: u64 = hi_raw.trim().parse().map_err(|_| invalid())?;
                if lo > hi {
                    return Err(invalid());
                }
                if (hi - lo) as usize >= MAX_HOSTS {
                    return Err(HostlistError::TooManyHosts);
                }
                let width = lo_raw.trim().len();
                for n in lo..=hi {
                    push_host(out, format!("{prefix}{n:0width$}{suffix}"))?;
                }
            }
            None => {
                if range.is_empty() || !range.chars().all(|c| c.is_ascii_digit()) {
                    return Err(invalid());
                }
                push_host(out, format!("{prefix}{range}{suffix}"))?;
            }
        }
    }
    Ok(())
}

fn push_host(out: &mut Vec<String>, host: String) -> Result<(), HostlistError> {
    if out.len() >= MAX_HOSTS {
        return Err(HostlistError::TooManyHosts);
    }
    out.push(host);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_ranges_in_order() {
        let list = Hostlist::parse("node[1-3],login1").unwrap();
        assert_eq!(
            list.iter().collect::<Vec<_>>(),
            vec!["node1", "node2", "node3", "login1"]
        );
    }

    #[test]
    fn keeps_zero_padding_and_suffix() {
        let list = Hostlist::parse("cn[08-10,15]-ib").unwrap();
        assert_eq!(
            list.into_vec(),
            vec!["cn08-ib", "cn09-ib", "cn10-ib", "cn15-ib"]
        );
    }

    #[test]
    fn nth_follows_expansion_order() {
        let list = Hostlist::parse("a[2-4]").unwrap();
        assert_eq!(list.len(), 3);
        assert_eq!(list.nth(0), Some("a2"));
        assert_eq!(list.nth(2), Some("a4"));
        assert_eq!(list.nth(3), None);
    }

    #[test]
    fn empty_expression_is_empty_list() {
        assert!(Hostlist::parse("").unwrap().is_empty());
    }

    #[test]
    fn rejects_malformed_expressions() {
        assert!(matches!(
            Hostlist::parse("node[1-3"),
            Err(HostlistError::UnbalancedBracket(_))
        ));
        assert!(matches!(
            Hostlist::parse("node[5-2]"),
            Err(HostlistError::InvalidRange { .. })
        ));
        assert!(matches!(
            Hostlist::parse("node[x]"),
            Err(HostlistError::InvalidRange { .. })
        ));
        assert!(matches!(
            Hostlist::parse("rack[1-2]node[1-2]"),
            Err(HostlistError::Unsupported(_))
        ));
    }
}
