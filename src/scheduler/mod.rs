//! Routing state owned by the controller.
//!
//! - [`CapabilityRegistry`]: which live workers provide which capability
//! - [`Backlog`]: requests waiting for a capability with no provider
//! - [`balancer`]: least-loaded ordering of providers
//! - [`Correlator`]: pending requests and their completion handles
//!
//! None of these types know about processes or channels; the supervisor's
//! controller task drives them.

pub mod backlog;
pub mod balancer;
pub mod correlator;
pub mod registry;

pub use backlog::Backlog;
pub use balancer::Load;
pub use correlator::{Completion, Correlator, PendingRequest, RequestResult, Resolution};
pub use registry::{CapabilityRegistry, Registration};
