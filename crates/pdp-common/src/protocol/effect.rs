use serde::{Deserialize, Serialize};
use std::fmt;

use super::error::PdpError;

/// Decision effect returned by a decision server.
///
/// On the wire the effect is a bare code so that codes unknown to this
/// client can be detected and rejected instead of silently misread. A server
/// that fails to evaluate a request answers with one of the indeterminate
/// effects and a reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Effect {
    #[default]
    Deny,
    Permit,
    NotApplicable,
    Indeterminate,
    IndeterminateD,
    IndeterminateP,
    IndeterminateDP,
}

impl Effect {
    pub fn code(self) -> u8 {
        match self {
            Effect::Deny => 0,
            Effect::Permit => 1,
            Effect::NotApplicable => 2,
            Effect::Indeterminate => 3,
            Effect::IndeterminateD => 4,
            Effect::IndeterminateP => 5,
            Effect::IndeterminateDP => 6,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Effect::Deny),
            1 => Some(Effect::Permit),
            2 => Some(Effect::NotApplicable),
            3 => Some(Effect::Indeterminate),
            4 => Some(Effect::IndeterminateD),
            5 => Some(Effect::IndeterminateP),
            6 => Some(Effect::IndeterminateDP),
            _ => None,
        }
    }

    pub fn is_indeterminate(self) -> bool {
        matches!(
            self,
            Effect::Indeterminate
                | Effect::IndeterminateD
                | Effect::IndeterminateP
                | Effect::IndeterminateDP
        )
    }
}

impl TryFrom<u8> for Effect {
    type Error = PdpError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Effect::from_code(code)
            .ok_or_else(|| PdpError::Mapping(format!("unknown effect code {}", code)))
    }
}

impl From<Effect> for u8 {
    fn from(effect: Effect) -> Self {
        effect.code()
    }
}

impl fmt::Display for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Effect::Deny => "Deny",
            Effect::Permit => "Permit",
            Effect::NotApplicable => "NotApplicable",
            Effect::Indeterminate => "Indeterminate",
            Effect::IndeterminateD => "Indeterminate{D}",
            Effect::IndeterminateP => "Indeterminate{P}",
            Effect::IndeterminateDP => "Indeterminate{DP}",
        };
        f.write_str(name)
    }
}
