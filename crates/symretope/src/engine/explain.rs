use crate::{
	actions::{ExplanationActions, FixResult, InspectionActions, PropagationActions},
	engine::{
		overlay::VirtualFixings,
		propagate::{self, PropCtx},
		Fixing, Fixings, Scratch,
	},
	permutation::Permutation,
	Bound, Conjunction, Inference, VarId,
};

/// Stand-in host for replays that read nothing but virtual fixings.
struct NullActions;

impl InspectionActions for NullActions {
	fn value(&self, _: VarId) -> Option<bool> {
		unreachable!("replays read only virtual fixings")
	}
}
impl PropagationActions for NullActions {
	fn fix_var(&mut self, _: VarId, _: bool, _: Inference) -> FixResult {
		unreachable!("replays fix only virtual fixings")
	}
}

/// List the recorded bounds that force `infer` (or, with `infer == None`,
/// plain infeasibility) for the single symresack of γ^pow.
///
/// Seeds the converse of the inference and mirrors the first-difference table
/// row by row under the values returned by `read` (by local entry index); the
/// scan ends at the row proving the (0, 1) pattern. Every bound consulted on
/// the way joins the conjunction.
pub(crate) fn resolve_power(
	perm: &Permutation,
	vars: &[VarId],
	infer: Option<Fixing>,
	pow: u64,
	mut read: impl FnMut(usize) -> Option<bool>,
	out: &mut Conjunction,
) {
	let n = vars.len();
	let mut vf: Vec<Option<bool>> = vec![None; n];
	if let Some(f) = infer {
		vf[f.var] = Some(!f.value);
	}
	let infer_var = infer.map(|f| f.var);

	for i in 0..n {
		let j = perm.apply_inv(i, pow);
		if i == j {
			continue;
		}

		if vf[i] == Some(false) && vf[j] == Some(true) {
			return;
		}
		if vf[i] == Some(false) {
			// x_j must follow to zero, unless it is already one.
			if read(j) == Some(true) {
				out.push(Bound::Lower(vars[j]));
				return;
			}
			vf[j] = Some(false);
			continue;
		}
		if vf[j] == Some(true) {
			// x_i must follow to one, unless it is already zero.
			if read(i) == Some(false) {
				out.push(Bound::Upper(vars[i]));
				return;
			}
			vf[i] = Some(true);
			continue;
		}
		debug_assert!(!(vf[i] == Some(true) && vf[j] == Some(false)));

		// Patterns (1, ·), (·, 0) and (·, ·): the recorded bounds decide.
		if read(i) == Some(false) {
			out.push(Bound::Upper(vars[i]));
			vf[i] = Some(false);
			if read(j) == Some(true) {
				vf[j] = Some(true);
				if infer_var != Some(j) {
					out.push(Bound::Lower(vars[j]));
				}
				return;
			}
			vf[j] = Some(false);
		}
		if read(j) == Some(true) {
			out.push(Bound::Lower(vars[j]));
			vf[j] = Some(true);
			if read(i) == Some(false) {
				vf[i] = Some(false);
				if infer_var != Some(i) {
					out.push(Bound::Upper(vars[i]));
				}
				return;
			}
			vf[i] = Some(true);
		}
		// The row is decided and constant, otherwise the scan would have
		// terminated above.
		debug_assert!(vf[i].is_some() && vf[i] == vf[j]);
	}
	debug_assert!(false, "resolution scan must terminate at a contradiction");
}

/// Explain a fixing committed by the peek driver.
///
/// Replays the base propagation on an overlay seeded with every recorded
/// fixing plus the converse of the decision, recording which entries were
/// read. The recorded set is then sparsified: an entry stays in the conflict
/// only if removing it restores feasibility.
pub(crate) fn explain_peek<E: ExplanationActions>(
	ctx: &PropCtx,
	scratch: &mut Scratch,
	actions: &E,
	vars: &[VarId],
	infer: Fixing,
) -> Conjunction {
	let n = vars.len();
	let mut initial = VirtualFixings::new(n);
	for (local, &var) in vars.iter().enumerate() {
		if let Some(v) = actions.recorded_value(var) {
			let _ = initial.set(local, v);
		}
	}
	debug_assert!(initial.get(infer.var).is_none());
	let _ = initial.set(infer.var, !infer.value);

	let mut overlay = VirtualFixings::new(n);
	overlay.copy_from(&initial);
	let mut conflict = vec![false; n];
	let infeasible = replay(ctx, scratch, vars, &mut overlay, Some(&mut conflict));
	debug_assert!(infeasible, "the converse of a peek fixing must be infeasible");

	for i in 0..n {
		if i == infer.var || initial.get(i).is_none() {
			conflict[i] = false;
			continue;
		}
		if !conflict[i] {
			continue;
		}
		overlay.clear();
		for entry in initial.entries() {
			if entry == infer.var || (entry != i && conflict[entry]) {
				let _ = overlay.set(entry, initial.get(entry).expect("seeded entry"));
			}
		}
		if replay(ctx, scratch, vars, &mut overlay, None) {
			conflict[i] = false;
		}
	}

	let mut out = Conjunction::new();
	for (j, &var) in vars.iter().enumerate() {
		if j == infer.var || !conflict[j] {
			continue;
		}
		if let Some(v) = actions.recorded_value(var) {
			out.push(Bound::fixing(var, v));
		}
	}
	out
}

fn replay(
	ctx: &PropCtx,
	scratch: &mut Scratch,
	vars: &[VarId],
	overlay: &mut VirtualFixings,
	checked: Option<&mut [bool]>,
) -> bool {
	let mut host = NullActions;
	let mut fx = Fixings {
		vars,
		actions: &mut host,
		overlay: Some(overlay),
		use_base: false,
		checked,
	};
	propagate::prop_variables(ctx, scratch, &mut fx, false).is_err()
}

/// Debug replay of a freshly applied power-tagged fixing: assuming the
/// converse, the first-difference scan must certify infeasibility.
#[cfg(debug_assertions)]
pub(crate) fn debug_check_fixing<A: PropagationActions>(
	ctx: &PropCtx,
	fx: &Fixings<'_, A>,
	fixing: Fixing,
	pow: u64,
) {
	let n = ctx.perm.len();
	let mut vf: Vec<Option<bool>> = vec![None; n];
	vf[fixing.var] = Some(!fixing.value);
	for i in 0..n {
		let j = ctx.perm.apply_inv(i, pow);
		if i == j {
			continue;
		}
		let fi = vf[i].or_else(|| fx.get_base(i));
		let fj = vf[j].or_else(|| fx.get_base(j));
		if fi == Some(false) && fj == Some(true) {
			return;
		}
		assert!(!(fi == Some(true) && fj == Some(false)));
		assert!(!(fi.is_none() && fj == Some(false)));
		assert!(!(fi == Some(true) && fj.is_none()));
		assert!(!(fi.is_none() && fj.is_none()));
		if fi == Some(false) && fj.is_none() {
			vf[j] = Some(false);
		}
		if fj == Some(true) && fi.is_none() {
			vf[i] = Some(true);
		}
	}
	panic!(
		"fixing entry {} to {} is not implied under power {pow}",
		fixing.var, fixing.value
	);
}
