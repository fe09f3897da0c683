//! Window keys: the (subject, resource, tier) identity a quota is tracked under.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Subject placeholder used by tiers that are global across subjects.
pub const ANY_SUBJECT: &str = "*";

/// Composite identity of one tracked window.
///
/// The tier is always part of the key, so the same subject and resource under two tiers never
/// share state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WindowKey {
    subject: String,
    resource: String,
    tier: String,
}

impl WindowKey {
    /// Build a key.
    pub fn new(
        subject: impl Into<String>,
        resource: impl Into<String>,
        tier: impl Into<String>,
    ) -> Self {
        Self { subject: subject.into(), resource: resource.into(), tier: tier.into() }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn tier(&self) -> &str {
        &self.tier
    }

    /// Flat storage form, `quota:<tier>:<subject>:<resource>`, with `%` and `:` escaped in each
    /// component so distinct keys never collide. Shard routing hashes this string.
    pub fn storage_key(&self) -> String {
        format!(
            "quota:{}:{}:{}",
            escape(&self.tier),
            escape(&self.subject),
            escape(&self.resource)
        )
    }
}

impl fmt::Display for WindowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.storage_key())
    }
}

fn escape(component: &str) -> String {
    let mut out = String::with_capacity(component.len());
    for c in component.chars() {
        match c {
            '%' => out.push_str("%25"),
            ':' => out.push_str("%3A"),
            other => out.push(other),
        }
    }
    out
}
