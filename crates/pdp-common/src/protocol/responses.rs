//! Decision response message.

use serde::{Deserialize, Serialize};

use super::attribute::Attribute;
use super::effect::Effect;
use super::error::Result;

/// A decision returned by a server for one request.
///
/// # Fields
///
/// - `effect`: raw effect code, see [`Effect::from_code`]
/// - `reason`: why the server could not reach a definite decision, if any
/// - `attributes`: server-defined attribute assignments (obligations)
///
/// # Example
///
/// ```
/// use pdp_common::protocol::{Attribute, AttributeValue, Effect, Response};
///
/// let response = Response::decision(
///     Effect::Permit,
///     vec![Attribute::new("x", AttributeValue::String("AllPermitRule".into()))],
/// );
/// assert_eq!(response.effect().unwrap(), Effect::Permit);
/// assert!(response.reason.is_none());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Response {
    pub effect: u8,
    pub reason: Option<String>,
    #[serde(default)]
    pub attributes: Vec<Attribute>,
}

impl Response {
    /// Creates a definite (or not applicable) decision.
    pub fn decision(effect: Effect, attributes: Vec<Attribute>) -> Self {
        Response {
            effect: effect.code(),
            reason: None,
            attributes,
        }
    }

    /// Creates an indeterminate decision carrying the failure reason.
    ///
    /// ```
    /// use pdp_common::protocol::{Effect, Response};
    ///
    /// let response = Response::error("missing attribute \"domain\"");
    /// assert_eq!(response.effect().unwrap(), Effect::Indeterminate);
    /// assert_eq!(response.reason.as_deref(), Some("missing attribute \"domain\""));
    /// ```
    pub fn error(reason: impl Into<String>) -> Self {
        Response {
            effect: Effect::Indeterminate.code(),
            reason: Some(reason.into()),
            attributes: Vec::new(),
        }
    }

    /// Interprets the effect code; unknown codes are a mapping error.
    pub fn effect(&self) -> Result<Effect> {
        Effect::try_from(self.effect)
    }
}
