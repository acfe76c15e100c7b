use std::net::SocketAddr;

use glob::Pattern;

/// Glob-pattern matcher applied to `host:port` strings of incoming
/// registrations (spec.md §4.5). Shell-style `*?[…]` semantics, not regex.
#[derive(Debug, Clone, Default)]
pub struct BanFilter {
    patterns: Vec<Pattern>,
}

impl BanFilter {
    pub fn new(globs: &[String]) -> Result<Self, glob::PatternError> {
        let mut patterns = Vec::with_capacity(globs.len());
        for g in globs {
            match Pattern::new(g) {
                Ok(p) => patterns.push(p),
                Err(e) => {
                    tracing::warn!(pattern = %g, error = %e, "invalid block_addresses glob pattern");
                    return Err(e);
                }
            }
        }
        tracing::debug!(count = patterns.len(), "ban filter loaded");
        Ok(Self { patterns })
    }

    pub fn is_blocked(&self, addr: &SocketAddr) -> bool {
        let rendered = format!("{}:{}", addr.ip(), addr.port());
        self.patterns.iter().any(|p| p.matches(&rendered))
    }
}
