/// The allowlist entry that permits every origin.
pub const WILDCARD: &str = "*";

/// Returns `true` if `origin` is permitted by `allowlist`.
///
/// A `*` entry anywhere in the list permits every origin, including an empty
/// one. Every other entry is compared ASCII case-insensitively against the
/// whole origin string.
pub fn is_allowed(allowlist: &[String], origin: &str) -> bool {
    for entry in allowlist {
        if entry == WILDCARD {
            return true;
        }
        if entry.eq_ignore_ascii_case(origin) {
            return true;
        }
    }
    false
}

/// Immutable set of origins accepted on the relay route.
///
/// Built once at startup and shared across sessions behind an `Arc`.
#[derive(Debug, Clone, Default)]
pub struct OriginAllowlist {
    entries: Vec<String>,
}

impl OriginAllowlist {
    pub fn new(entries: Vec<String>) -> Self {
        let entries = entries
            .into_iter()
            .map(|e| e.trim().to_string())
            .filter(|e| !e.is_empty())
            .collect();
        Self { entries }
    }

    /// An allowlist that accepts every origin.
    pub fn permissive() -> Self {
        Self {
            entries: vec![WILDCARD.to_string()],
        }
    }

    /// Check the value of an `Origin` header. A missing header is treated as
    /// an empty origin.
    pub fn permits(&self, origin: Option<&str>) -> bool {
        is_allowed(&self.entries, origin.unwrap_or(""))
    }

    /// Whether the wildcard entry is present, which disables origin checks.
    pub fn is_permissive(&self) -> bool {
        self.entries.iter().any(|e| e == WILDCARD)
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }
}
