pub mod attribute;
pub mod effect;
pub mod error;
pub mod requests;
pub mod responses;


pub use attribute::{Attribute, AttributeId, AttributeType, AttributeValue, Network};
pub use effect::Effect;
pub use error::{PdpError, Result};
pub use requests::{CorrelationId, Request};
pub use responses::Response;
