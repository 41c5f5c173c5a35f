use crate::{actions::inspection::InspectionActions, VarId};

/// Read access to the bounds that were in effect when the inference being
/// explained was made.
pub trait ExplanationActions: InspectionActions {
	/// The value the variable had immediately before the inferred bound
	/// change was posted, or `None` if it was not fixed at that point.
	fn recorded_value(&self, var: VarId) -> Option<bool>;
}
