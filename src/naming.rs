//!
//! Deterministic resource names derived from a logical name and the deployment environment.
//!

/// Naming rules shared by topic and queue provisioning.
///
/// The same `Naming` must be used for creation, lookup and teardown, a mismatch surfaces
/// as a lookup failure against the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Naming {
    prefix: String,
    suffix: String,
}

impl Naming {
    pub fn new(prefix: &str, suffix: &str) -> Self {
        Self {
            prefix: prefix.to_owned(),
            suffix: suffix.to_owned(),
        }
    }

    /// `<logical>-<suffix>`
    pub fn topic_name(&self, logical: &str) -> String {
        format!("{}-{}", logical, self.suffix)
    }

    /// `<prefix>-<logical>-<suffix>`
    pub fn queue_name(&self, logical: &str) -> String {
        format!("{}-{}-{}", self.prefix, logical, self.suffix)
    }
}
