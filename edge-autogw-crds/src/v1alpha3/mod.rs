//! Subset of the Istio `networking.istio.io/v1alpha3` API written by the gateway controller.
//!
//! Only the fields the controller sets are modelled. Empty collections are skipped on
//! serialization so server-side apply does not take ownership of fields it never fills.

pub mod destinationrule;
pub mod gateway;
pub mod virtualservice;

pub use destinationrule::{DestinationRule, DestinationRuleSpec};
pub use gateway::{Gateway, GatewaySpec};
pub use virtualservice::{VirtualService, VirtualServiceSpec};
