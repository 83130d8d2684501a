use serde::{Deserialize, Serialize};

use super::attribute::Attribute;

/// Client-chosen token matching a request to its response on a shared
/// stream. Carried in the frame header, never in the payload, so the payload
/// of identical requests is byte-identical.
pub type CorrelationId = u64;

/// A decision request: an ordered list of attribute assignments.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Request {
    pub attributes: Vec<Attribute>,
}

impl Request {
    pub fn new(attributes: Vec<Attribute>) -> Self {
        Request { attributes }
    }

    /// Looks up the first attribute with the given identifier.
    pub fn get(&self, id: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.id == id)
    }
}
