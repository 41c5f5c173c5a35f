//! Traits through which the propagation core talks to the enclosing solver.
//!
//! The host implements these on whatever view of its state is appropriate for
//! the call: current local bounds for propagation, bounds at a historical
//! bound-change index for explanations.

pub mod explanation;
pub mod initialization;
pub mod inspection;
pub mod propagation;

pub use explanation::ExplanationActions;
pub use initialization::InitializationActions;
pub use inspection::InspectionActions;
pub use propagation::{FixResult, PropagationActions};
