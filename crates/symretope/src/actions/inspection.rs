use crate::VarId;

pub trait InspectionActions {
	/// The value of the binary variable under the current local bounds, or
	/// `None` if it is not fixed.
	fn value(&self, var: VarId) -> Option<bool>;
}
