//! Domain-name helpers.
//!
//! Domains received on the wire are compared case-insensitively and without a
//! trailing root dot. Everything that enters a session or the registry goes
//! through [`normalize`] first.

/// Error returned when a string cannot be used as a server domain.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("Domain is empty")]
    Empty,
    #[error("Domain is too long ({0} bytes, max 1023)")]
    TooLong(usize),
    #[error("Domain contains an empty label: '{0}'")]
    EmptyLabel(String),
    #[error("Domain contains forbidden character {1:?}: '{0}'")]
    ForbiddenChar(String, char),
}

/// Lower-case a domain and strip a trailing root dot.
pub fn normalize(domain: &str) -> String {
    domain.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// Normalize and validate a domain taken from a `from`/`to` attribute.
pub fn validate(domain: &str) -> Result<String, DomainError> {
    let domain = normalize(domain);
    if domain.is_empty() {
        return Err(DomainError::Empty);
    }
    if domain.len() > 1023 {
        return Err(DomainError::TooLong(domain.len()));
    }
    if let Some(c) = domain
        .chars()
        .find(|c| c.is_whitespace() || matches!(c, '@' | '/' | '<' | '>' | '\'' | '"' | '&'))
    {
        return Err(DomainError::ForbiddenChar(domain, c));
    }
    // IPv6 literals are bracketed and contain no labels to check.
    if !domain.starts_with('[') && domain.split('.').any(str::is_empty) {
        return Err(DomainError::EmptyLabel(domain));
    }
    Ok(domain)
}

/// True when the hostname has at least one alphabetic character, i.e. it is
/// not a bare IPv4 literal.
pub fn has_alphabetic(hostname: &str) -> bool {
    !hostname.starts_with('[') && hostname.chars().any(|c| c.is_ascii_alphabetic())
}

/// Domain part of a JID (`node@domain/resource`), normalized.
pub fn jid_domain(jid: &str) -> String {
    let bare = jid.split_once('/').map_or(jid, |(bare, _)| bare);
    let domain = bare.rsplit_once('@').map_or(bare, |(_, domain)| domain);
    normalize(domain)
}
