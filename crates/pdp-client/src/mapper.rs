//! Request/response mapping
//!
//! Translates application records into attribute lists and decision
//! responses back into application records. Each record type declares its
//! mapping once, as a schema built on first use:
//!
//! ```rust
//! use pdp_client::mapper::{DecisionRequest, DecisionResponse, RequestSchema, ResponseSchema};
//! use pdp_common::Effect;
//! use std::sync::OnceLock;
//!
//! struct Query {
//!     policy: String,
//!     domain: String,
//! }
//!
//! impl DecisionRequest for Query {
//!     fn schema() -> &'static RequestSchema<Self> {
//!         static SCHEMA: OnceLock<RequestSchema<Query>> = OnceLock::new();
//!         SCHEMA.get_or_init(|| {
//!             RequestSchema::builder()
//!                 .string("policy", |q: &Query| q.policy.clone())
//!                 .domain("domain", |q: &Query| q.domain.clone())
//!                 .build()
//!         })
//!     }
//! }
//!
//! #[derive(Default)]
//! struct Answer {
//!     effect: Effect,
//!     x: String,
//! }
//!
//! impl DecisionResponse for Answer {
//!     fn schema() -> &'static ResponseSchema<Self> {
//!         static SCHEMA: OnceLock<ResponseSchema<Answer>> = OnceLock::new();
//!         SCHEMA.get_or_init(|| {
//!             ResponseSchema::builder()
//!                 .effect(|a: &mut Answer, effect| a.effect = effect)
//!                 .string("x", |a: &mut Answer, x| a.x = x)
//!                 .build()
//!         })
//!     }
//! }
//!
//! let attributes = pdp_client::mapper::encode(&Query {
//!     policy: "AllPermitPolicy".into(),
//!     domain: "Example.COM.".into(),
//! })
//! .unwrap();
//! assert_eq!(attributes[1].value.to_string(), "example.com");
//! ```

use pdp_common::protocol::error::{PdpError, Result};
use pdp_common::protocol::{Attribute, AttributeType, AttributeValue, Effect, Network, Response};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Maximum length of a domain name in presentation format.
const MAX_DOMAIN_LENGTH: usize = 253;

/// Maximum length of a single domain label.
const MAX_LABEL_LENGTH: usize = 63;

/// Largest integer magnitude an `f64` holds exactly (2^53).
const MAX_EXACT_FLOAT_INT: u64 = 1 << 53;

/// Runtime value of a request field, before it is converted to the field's
/// declared attribute type.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// The field is not set and produces no attribute.
    Absent,
    Bool(bool),
    Int(i64),
    Unsigned(u64),
    Float(f64),
    Text(String),
    Ip(IpAddr),
    Net(Network),
    Strings(Vec<String>),
    Bytes(Vec<u8>),
}

impl FieldValue {
    fn describe(&self) -> &'static str {
        match self {
            FieldValue::Absent => "absent value",
            FieldValue::Bool(_) => "boolean",
            FieldValue::Int(_) => "integer",
            FieldValue::Unsigned(_) => "unsigned integer",
            FieldValue::Float(_) => "float",
            FieldValue::Text(_) => "text",
            FieldValue::Ip(_) => "IP address",
            FieldValue::Net(_) => "network",
            FieldValue::Strings(_) => "string collection",
            FieldValue::Bytes(_) => "raw bytes",
        }
    }

    /// Converts the value to `kind`, or `None` for an absent value.
    pub fn into_attribute_value(self, kind: AttributeType) -> Result<Option<AttributeValue>> {
        let value = match (kind, self) {
            (_, FieldValue::Absent) => return Ok(None),
            (_, FieldValue::Bytes(bytes)) => {
                return Err(PdpError::Mapping(format!(
                    "{} bytes of raw data can't be represented as {}",
                    bytes.len(),
                    kind
                )));
            }
            (AttributeType::Boolean, FieldValue::Bool(b)) => AttributeValue::Boolean(b),
            (AttributeType::String, FieldValue::Text(s)) => AttributeValue::String(s),
            (AttributeType::Integer, FieldValue::Int(i)) => AttributeValue::Integer(i),
            (AttributeType::Integer, FieldValue::Unsigned(u)) => {
                let i = i64::try_from(u).map_err(|_| {
                    PdpError::Mapping(format!("{} overflows integer attribute", u))
                })?;
                AttributeValue::Integer(i)
            }
            (AttributeType::Float, FieldValue::Float(f)) => {
                if !f.is_finite() {
                    return Err(PdpError::Mapping(format!("{} can't be represented as float", f)));
                }
                AttributeValue::Float(f)
            }
            (AttributeType::Float, FieldValue::Int(i)) => {
                if i.unsigned_abs() > MAX_EXACT_FLOAT_INT {
                    return Err(PdpError::Mapping(format!("{} loses precision as float", i)));
                }
                AttributeValue::Float(i as f64)
            }
            (AttributeType::Address, FieldValue::Ip(ip)) => AttributeValue::Address(ip),
            (AttributeType::Address, FieldValue::Text(s)) => {
                let ip = s.trim().parse::<IpAddr>().map_err(|_| {
                    PdpError::Mapping(format!("'{}' is not an IP address", s))
                })?;
                AttributeValue::Address(ip)
            }
            (AttributeType::Network, FieldValue::Net(net)) => AttributeValue::Network(net),
            (AttributeType::Network, FieldValue::Ip(ip)) => {
                let prefix = if ip.is_ipv4() { 32 } else { 128 };
                AttributeValue::Network(Network::new(ip, prefix)?)
            }
            (AttributeType::Network, FieldValue::Text(s)) => AttributeValue::Network(s.trim().parse()?),
            (AttributeType::Domain, FieldValue::Text(s)) => AttributeValue::Domain(canonical_domain(&s)?),
            (AttributeType::SetOfStrings, FieldValue::Strings(mut v)) => {
                v.sort();
                v.dedup();
                AttributeValue::SetOfStrings(v)
            }
            (AttributeType::ListOfStrings, FieldValue::Strings(v)) => AttributeValue::ListOfStrings(v),
            (kind, other) => {
                return Err(PdpError::Mapping(format!(
                    "can't represent {} as {}",
                    other.describe(),
                    kind
                )));
            }
        };
        Ok(Some(value))
    }
}

/// Lowercases and validates a domain name, dropping the root label.
fn canonical_domain(name: &str) -> Result<String> {
    let trimmed = name.strip_suffix('.').unwrap_or(name);
    if trimmed.is_empty() || trimmed.len() > MAX_DOMAIN_LENGTH {
        return Err(PdpError::Mapping(format!("invalid domain name '{}'", name)));
    }

    for label in trimmed.split('.') {
        let valid = !label.is_empty()
            && label.len() <= MAX_LABEL_LENGTH
            && label
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'*');
        if !valid {
            return Err(PdpError::Mapping(format!("invalid domain name '{}'", name)));
        }
    }

    Ok(trimmed.to_ascii_lowercase())
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(FieldValue::Absent, Into::into)
    }
}

macro_rules! field_value_from {
    ($($ty:ty => $variant:ident $(as $cast:ty)?),* $(,)?) => {
        $(
            impl From<$ty> for FieldValue {
                fn from(value: $ty) -> Self {
                    FieldValue::$variant(value $(as $cast)?)
                }
            }
        )*
    };
}

field_value_from! {
    bool => Bool,
    i8 => Int as i64,
    i16 => Int as i64,
    i32 => Int as i64,
    i64 => Int,
    u8 => Unsigned as u64,
    u16 => Unsigned as u64,
    u32 => Unsigned as u64,
    u64 => Unsigned,
    usize => Unsigned as u64,
    f32 => Float as f64,
    f64 => Float,
    String => Text,
    IpAddr => Ip,
    Network => Net,
    Vec<String> => Strings,
    Vec<u8> => Bytes,
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<&String> for FieldValue {
    fn from(value: &String) -> Self {
        FieldValue::Text(value.clone())
    }
}

impl From<Ipv4Addr> for FieldValue {
    fn from(value: Ipv4Addr) -> Self {
        FieldValue::Ip(IpAddr::V4(value))
    }
}

impl From<Ipv6Addr> for FieldValue {
    fn from(value: Ipv6Addr) -> Self {
        FieldValue::Ip(IpAddr::V6(value))
    }
}

impl From<&[String]> for FieldValue {
    fn from(value: &[String]) -> Self {
        FieldValue::Strings(value.to_vec())
    }
}

impl From<&[u8]> for FieldValue {
    fn from(value: &[u8]) -> Self {
        FieldValue::Bytes(value.to_vec())
    }
}

type Getter<T> = Box<dyn Fn(&T) -> FieldValue + Send + Sync>;

struct RequestField<T> {
    id: String,
    kind: AttributeType,
    get: Getter<T>,
}

/// Declared mapping from a request type to attribute assignments.
pub struct RequestSchema<T> {
    fields: Vec<RequestField<T>>,
}

impl<T> RequestSchema<T> {
    pub fn builder() -> RequestSchemaBuilder<T> {
        RequestSchemaBuilder { fields: Vec::new() }
    }

    /// Number of declared fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Declared `(attribute id, type)` pairs in declaration order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, AttributeType)> {
        self.fields.iter().map(|f| (f.id.as_str(), f.kind))
    }

    /// Emits one attribute per non-absent field, in declaration order.
    pub fn encode(&self, request: &T) -> Result<Vec<Attribute>> {
        let mut attributes = Vec::with_capacity(self.fields.len());
        for field in &self.fields {
            let value = (field.get)(request)
                .into_attribute_value(field.kind)
                .map_err(|e| match e {
                    PdpError::Mapping(msg) => {
                        PdpError::Mapping(format!("field \"{}\": {}", field.id, msg))
                    }
                    other => other,
                })?;
            if let Some(value) = value {
                attributes.push(Attribute::new(field.id.clone(), value));
            }
        }
        Ok(attributes)
    }
}

/// Builder for [`RequestSchema`]. Fields are encoded in the order they are
/// declared here.
pub struct RequestSchemaBuilder<T> {
    fields: Vec<RequestField<T>>,
}

impl<T> RequestSchemaBuilder<T> {
    /// Declares a field of the given attribute type.
    pub fn field<F, V>(mut self, id: impl Into<String>, kind: AttributeType, get: F) -> Self
    where
        F: Fn(&T) -> V + Send + Sync + 'static,
        V: Into<FieldValue>,
    {
        self.fields.push(RequestField {
            id: id.into(),
            kind,
            get: Box::new(move |request| get(request).into()),
        });
        self
    }

    pub fn boolean<F, V>(self, id: impl Into<String>, get: F) -> Self
    where
        F: Fn(&T) -> V + Send + Sync + 'static,
        V: Into<FieldValue>,
    {
        self.field(id, AttributeType::Boolean, get)
    }

    pub fn string<F, V>(self, id: impl Into<String>, get: F) -> Self
    where
        F: Fn(&T) -> V + Send + Sync + 'static,
        V: Into<FieldValue>,
    {
        self.field(id, AttributeType::String, get)
    }

    pub fn integer<F, V>(self, id: impl Into<String>, get: F) -> Self
    where
        F: Fn(&T) -> V + Send + Sync + 'static,
        V: Into<FieldValue>,
    {
        self.field(id, AttributeType::Integer, get)
    }

    pub fn float<F, V>(self, id: impl Into<String>, get: F) -> Self
    where
        F: Fn(&T) -> V + Send + Sync + 'static,
        V: Into<FieldValue>,
    {
        self.field(id, AttributeType::Float, get)
    }

    pub fn address<F, V>(self, id: impl Into<String>, get: F) -> Self
    where
        F: Fn(&T) -> V + Send + Sync + 'static,
        V: Into<FieldValue>,
    {
        self.field(id, AttributeType::Address, get)
    }

    pub fn network<F, V>(self, id: impl Into<String>, get: F) -> Self
    where
        F: Fn(&T) -> V + Send + Sync + 'static,
        V: Into<FieldValue>,
    {
        self.field(id, AttributeType::Network, get)
    }

    pub fn domain<F, V>(self, id: impl Into<String>, get: F) -> Self
    where
        F: Fn(&T) -> V + Send + Sync + 'static,
        V: Into<FieldValue>,
    {
        self.field(id, AttributeType::Domain, get)
    }

    pub fn set_of_strings<F, V>(self, id: impl Into<String>, get: F) -> Self
    where
        F: Fn(&T) -> V + Send + Sync + 'static,
        V: Into<FieldValue>,
    {
        self.field(id, AttributeType::SetOfStrings, get)
    }

    pub fn list_of_strings<F, V>(self, id: impl Into<String>, get: F) -> Self
    where
        F: Fn(&T) -> V + Send + Sync + 'static,
        V: Into<FieldValue>,
    {
        self.field(id, AttributeType::ListOfStrings, get)
    }

    pub fn build(self) -> RequestSchema<T> {
        RequestSchema { fields: self.fields }
    }
}

type Setter<T> = Box<dyn Fn(&mut T, &AttributeValue) -> Result<()> + Send + Sync>;
type EffectSetter<T> = Box<dyn Fn(&mut T, Effect) + Send + Sync>;
type ReasonSetter<T> = Box<dyn Fn(&mut T, Option<String>) + Send + Sync>;

/// Declared binding of response attributes to a response type.
pub struct ResponseSchema<T> {
    effect: Option<EffectSetter<T>>,
    reason: Option<ReasonSetter<T>>,
    fields: Vec<(String, Setter<T>)>,
    index: HashMap<String, usize>,
}

impl<T> ResponseSchema<T> {
    pub fn builder() -> ResponseSchemaBuilder<T> {
        ResponseSchemaBuilder {
            effect: None,
            reason: None,
            fields: Vec::new(),
        }
    }

    /// Binds effect, reason and every attribute with a declared field.
    /// Attributes without a field are ignored.
    pub fn bind(&self, response: &Response, out: &mut T) -> Result<()> {
        let effect = response.effect()?;
        if let Some(set) = &self.effect {
            set(out, effect);
        }
        if let Some(set) = &self.reason {
            set(out, response.reason.clone());
        }

        for attribute in &response.attributes {
            if let Some(&i) = self.index.get(&attribute.id) {
                let (id, set) = &self.fields[i];
                set(out, &attribute.value).map_err(|e| match e {
                    PdpError::Mapping(msg) => {
                        PdpError::Mapping(format!("attribute \"{}\": {}", id, msg))
                    }
                    other => other,
                })?;
            }
        }
        Ok(())
    }
}

/// Builder for [`ResponseSchema`].
pub struct ResponseSchemaBuilder<T> {
    effect: Option<EffectSetter<T>>,
    reason: Option<ReasonSetter<T>>,
    fields: Vec<(String, Setter<T>)>,
}

fn type_mismatch(expected: AttributeType, got: &AttributeValue) -> PdpError {
    PdpError::Mapping(format!("expected {} but got {}", expected, got.kind()))
}

macro_rules! typed_setter {
    ($(#[$doc:meta])* $name:ident, $variant:ident, $ty:ty) => {
        $(#[$doc])*
        pub fn $name<F>(self, id: impl Into<String>, set: F) -> Self
        where
            F: Fn(&mut T, $ty) + Send + Sync + 'static,
        {
            self.attribute(id, move |out, value| match value {
                AttributeValue::$variant(v) => {
                    set(out, v.clone());
                    Ok(())
                }
                other => Err(type_mismatch(AttributeType::$variant, other)),
            })
        }
    };
}

impl<T> ResponseSchemaBuilder<T> {
    pub fn effect<F>(mut self, set: F) -> Self
    where
        F: Fn(&mut T, Effect) + Send + Sync + 'static,
    {
        self.effect = Some(Box::new(set));
        self
    }

    pub fn reason<F>(mut self, set: F) -> Self
    where
        F: Fn(&mut T, Option<String>) + Send + Sync + 'static,
    {
        self.reason = Some(Box::new(set));
        self
    }

    /// Binds an attribute of any type. The first declaration of an id wins.
    pub fn attribute<F>(mut self, id: impl Into<String>, set: F) -> Self
    where
        F: Fn(&mut T, &AttributeValue) -> Result<()> + Send + Sync + 'static,
    {
        self.fields.push((id.into(), Box::new(set)));
        self
    }

    typed_setter!(boolean, Boolean, bool);
    typed_setter!(string, String, String);
    typed_setter!(integer, Integer, i64);
    typed_setter!(float, Float, f64);
    typed_setter!(address, Address, IpAddr);
    typed_setter!(network, Network, Network);
    typed_setter!(domain, Domain, String);
    typed_setter!(set_of_strings, SetOfStrings, Vec<String>);
    typed_setter!(list_of_strings, ListOfStrings, Vec<String>);

    pub fn build(self) -> ResponseSchema<T> {
        let mut index = HashMap::with_capacity(self.fields.len());
        for (i, (id, _)) in self.fields.iter().enumerate() {
            index.entry(id.clone()).or_insert(i);
        }
        ResponseSchema {
            effect: self.effect,
            reason: self.reason,
            fields: self.fields,
            index,
        }
    }
}

/// A request type with a declared attribute mapping.
pub trait DecisionRequest: Sized + 'static {
    fn schema() -> &'static RequestSchema<Self>;
}

/// A response type with a declared attribute binding.
pub trait DecisionResponse: Default + 'static {
    fn schema() -> &'static ResponseSchema<Self>;
}

/// Encodes a request into its attribute list.
pub fn encode<T: DecisionRequest>(request: &T) -> Result<Vec<Attribute>> {
    T::schema().encode(request)
}

/// Decodes a response into `out`.
///
/// `out` is reset to its default first, so fields the server did not return
/// keep their zero value. On error `out` is left untouched.
pub fn decode<T: DecisionResponse>(response: &Response, out: &mut T) -> Result<()> {
    let mut fresh = T::default();
    T::schema().bind(response, &mut fresh)?;
    *out = fresh;
    Ok(())
}

/// Decision as returned by the server, for callers without a response schema.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Decision {
    pub effect: Effect,
    pub reason: Option<String>,
    pub attributes: Vec<Attribute>,
}

impl Decision {
    pub fn from_response(response: &Response) -> Result<Self> {
        Ok(Decision {
            effect: response.effect()?,
            reason: response.reason.clone(),
            attributes: response.attributes.clone(),
        })
    }

    /// Looks up the first returned attribute with the given identifier.
    pub fn get(&self, id: &str) -> Option<&AttributeValue> {
        self.attributes.iter().find(|a| a.id == id).map(|a| &a.value)
    }
}
