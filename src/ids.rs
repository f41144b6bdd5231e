//! Identifier newtypes used throughout the core.

use std::fmt;
use std::ops::Deref;

/// A caller-supplied request identifier. Opaque to the core: callers may
/// use UUIDs, sequence numbers rendered as strings, or anything else that
/// is unique for the lifetime of the request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(String);

impl RequestId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Deref for RequestId {
    type Target = str;

    fn deref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Index of one of the `P` virtual engines a pipeline-parallel deployment
/// schedules independently. `0` for non-pipeline-parallel deployments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VirtualEngine(usize);

impl VirtualEngine {
    pub fn new(index: usize) -> Self {
        Self(index)
    }

    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for VirtualEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ve{}", self.0)
    }
}

impl From<usize> for VirtualEngine {
    fn from(v: usize) -> Self {
        Self(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_id_displays_underlying_string() {
        let id = RequestId::new("req-123");
        assert_eq!(id.to_string(), "req-123");
        assert_eq!(id.as_str(), "req-123");
    }

    #[test]
    fn virtual_engine_orders_by_index() {
        let a = VirtualEngine::new(0);
        let b = VirtualEngine::new(1);
        assert!(a < b);
    }
}
