//! Attribute assignments exchanged with decision servers.
//!
//! Every request is an ordered list of [`Attribute`]s and every response
//! carries zero or more of them next to the effect. Values are tagged with
//! their [`AttributeType`] on the wire:
//!
//! ```text
//! {"id": "domain", "value": {"type": "domain", "value": "example.com"}}
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use super::error::PdpError;

/// Attribute identifier (e.g. `"domain"`, `"policy"`).
pub type AttributeId = String;

/// Protocol type of an attribute value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeType {
    Boolean,
    String,
    Integer,
    Float,
    Address,
    Network,
    Domain,
    SetOfStrings,
    ListOfStrings,
}

impl AttributeType {
    pub fn name(self) -> &'static str {
        match self {
            AttributeType::Boolean => "boolean",
            AttributeType::String => "string",
            AttributeType::Integer => "integer",
            AttributeType::Float => "float",
            AttributeType::Address => "address",
            AttributeType::Network => "network",
            AttributeType::Domain => "domain",
            AttributeType::SetOfStrings => "set of strings",
            AttributeType::ListOfStrings => "list of strings",
        }
    }
}

impl fmt::Display for AttributeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// IP network in CIDR notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Network {
    addr: IpAddr,
    prefix: u8,
}

impl Network {
    pub fn new(addr: IpAddr, prefix: u8) -> Result<Self, PdpError> {
        let max = if addr.is_ipv4() { 32 } else { 128 };
        if prefix > max {
            return Err(PdpError::Mapping(format!(
                "prefix length {} is too long for {}",
                prefix, addr
            )));
        }
        Ok(Self { addr, prefix })
    }

    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

impl FromStr for Network {
    type Err = PdpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| PdpError::Mapping(format!("'{}' is not a network", s)))?;
        let addr: IpAddr = addr.parse()?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|_| PdpError::Mapping(format!("invalid prefix length in '{}'", s)))?;
        Network::new(addr, prefix)
    }
}

impl TryFrom<String> for Network {
    type Error = PdpError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Network> for String {
    fn from(n: Network) -> Self {
        n.to_string()
    }
}

/// Typed attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum AttributeValue {
    Boolean(bool),
    String(String),
    Integer(i64),
    Float(f64),
    Address(IpAddr),
    Network(Network),
    Domain(String),
    SetOfStrings(Vec<String>),
    ListOfStrings(Vec<String>),
}

impl AttributeValue {
    pub fn kind(&self) -> AttributeType {
        match self {
            AttributeValue::Boolean(_) => AttributeType::Boolean,
            AttributeValue::String(_) => AttributeType::String,
            AttributeValue::Integer(_) => AttributeType::Integer,
            AttributeValue::Float(_) => AttributeType::Float,
            AttributeValue::Address(_) => AttributeType::Address,
            AttributeValue::Network(_) => AttributeType::Network,
            AttributeValue::Domain(_) => AttributeType::Domain,
            AttributeValue::SetOfStrings(_) => AttributeType::SetOfStrings,
            AttributeValue::ListOfStrings(_) => AttributeType::ListOfStrings,
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::Boolean(v) => write!(f, "{}", v),
            AttributeValue::String(v) | AttributeValue::Domain(v) => f.write_str(v),
            AttributeValue::Integer(v) => write!(f, "{}", v),
            AttributeValue::Float(v) => write!(f, "{}", v),
            AttributeValue::Address(v) => write!(f, "{}", v),
            AttributeValue::Network(v) => write!(f, "{}", v),
            AttributeValue::SetOfStrings(v) | AttributeValue::ListOfStrings(v) => {
                write!(f, "[{}]", v.join(","))
            }
        }
    }
}

/// A typed `(identifier, value)` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    pub id: AttributeId,
    pub value: AttributeValue,
}

impl Attribute {
    pub fn new(id: impl Into<AttributeId>, value: AttributeValue) -> Self {
        Attribute {
            id: id.into(),
            value,
        }
    }

    pub fn kind(&self) -> AttributeType {
        self.value.kind()
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.({}) = {}", self.id, self.kind(), self.value)
    }
}
