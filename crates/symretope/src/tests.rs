use expect_test::expect;
use tracing_test::traced_test;

use crate::{
	actions::{
		ExplanationActions, FixResult, InitializationActions, InspectionActions,
		PropagationActions,
	},
	engine::{
		propagate::{self, PropCtx},
		Fixings, Scratch,
	},
	Bound, Inference, InvalidSymretope, LockDirection, OrderingCut, ParseError, ParsedSymretope,
	Permutation, Propagation, Symretope, SymretopeOptions, VarId,
};

/// Minimal host: a dense store of binary variable values with an inference
/// log.
#[derive(Clone, Debug, Default)]
pub(crate) struct TestSolver {
	pub(crate) values: Vec<Option<bool>>,
	non_binary: Vec<bool>,
	pub(crate) subscriptions: Vec<(VarId, u32)>,
	pub(crate) inferences: Vec<(VarId, bool, Inference)>,
	pub(crate) probing: bool,
}

impl TestSolver {
	pub(crate) fn new(nvars: usize) -> Self {
		Self {
			values: vec![None; nvars],
			non_binary: vec![false; nvars],
			..Self::default()
		}
	}

	pub(crate) fn var(i: usize) -> VarId {
		VarId::from_usize(i)
	}

	pub(crate) fn var_ids(n: usize) -> Vec<VarId> {
		(0..n).map(VarId::from_usize).collect()
	}

	pub(crate) fn fix(&mut self, i: usize, value: bool) {
		self.values[i] = Some(value);
	}

	pub(crate) fn mark_non_binary(&mut self, i: usize) {
		self.non_binary[i] = true;
	}
}

impl InspectionActions for TestSolver {
	fn value(&self, var: VarId) -> Option<bool> {
		self.values[var.index()]
	}
}

impl PropagationActions for TestSolver {
	fn fix_var(&mut self, var: VarId, value: bool, inference: Inference) -> FixResult {
		match self.values[var.index()] {
			Some(v) if v == value => FixResult::Unchanged,
			Some(_) => FixResult::Infeasible,
			None => {
				self.values[var.index()] = Some(value);
				self.inferences.push((var, value, inference));
				FixResult::Tightened
			}
		}
	}

	fn in_probing(&self) -> bool {
		self.probing
	}
}

impl InitializationActions for TestSolver {
	fn is_binary(&self, var: VarId) -> bool {
		!self.non_binary[var.index()]
	}

	fn subscribe(&mut self, var: VarId, data: u32) {
		self.subscriptions.push((var, data));
	}
}

/// Historical view for explanation tests: the values as they were just before
/// the inference being explained.
#[derive(Clone, Debug)]
pub(crate) struct Snapshot {
	values: Vec<Option<bool>>,
}

impl Snapshot {
	pub(crate) fn new(values: Vec<Option<bool>>) -> Self {
		Self { values }
	}
}

impl InspectionActions for Snapshot {
	fn value(&self, var: VarId) -> Option<bool> {
		self.values[var.index()]
	}
}

impl ExplanationActions for Snapshot {
	fn recorded_value(&self, var: VarId) -> Option<bool> {
		self.values[var.index()]
	}
}

fn posted(perm: &[usize], solver: &mut TestSolver) -> Symretope {
	posted_with(perm, solver, SymretopeOptions::default())
}

fn posted_with(perm: &[usize], solver: &mut TestSolver, options: SymretopeOptions) -> Symretope {
	Symretope::new(&TestSolver::var_ids(perm.len()), perm, true, options, solver)
		.expect("valid permutation")
		.expect("non-trivial constraint")
}

#[test]
#[traced_test]
fn test_four_cycle_unfixed_finds_nothing() {
	let mut solver = TestSolver::new(4);
	let mut cons = posted(&[1, 2, 3, 0], &mut solver);
	assert_eq!(cons.propagate(&mut solver), Ok(Propagation::Fixpoint));
	assert!(solver.values.iter().all(Option::is_none));
	assert!(solver.inferences.is_empty());
}

#[test]
#[traced_test]
fn test_four_cycle_zero_head_forces_zeros() {
	let mut solver = TestSolver::new(4);
	solver.fix(0, false);
	let mut cons = posted(&[1, 2, 3, 0], &mut solver);
	assert_eq!(cons.propagate(&mut solver), Ok(Propagation::Tightened(3)));
	assert_eq!(solver.values, vec![Some(false); 4]);
	// The permutation queue is a stack, so the highest power runs first and
	// claims the fixings it can derive.
	for expected in [
		(TestSolver::var(1), false, Inference::Power(3)),
		(TestSolver::var(2), false, Inference::Power(2)),
		(TestSolver::var(3), false, Inference::Power(2)),
	] {
		assert!(
			solver.inferences.contains(&expected),
			"missing inference {expected:?} in {:?}",
			solver.inferences
		);
	}
	// Idempotence: a forced re-run derives nothing further.
	assert_eq!(cons.presolve(&mut solver), Ok(Propagation::Fixpoint));
}

#[test]
#[traced_test]
fn test_four_cycle_one_tail_forces_ones() {
	let mut solver = TestSolver::new(4);
	solver.fix(3, true);
	let mut cons = posted(&[1, 2, 3, 0], &mut solver);
	assert_eq!(cons.propagate(&mut solver), Ok(Propagation::Tightened(3)));
	assert_eq!(solver.values, vec![Some(true); 4]);
}

#[test]
#[traced_test]
fn test_three_swaps_conflict() {
	let mut solver = TestSolver::new(6);
	solver.fix(0, false);
	solver.fix(1, true);
	let mut cons = posted(&[1, 0, 3, 2, 5, 4], &mut solver);
	let conflict = cons.propagate(&mut solver).unwrap_err();
	assert_eq!(
		conflict.conjunction,
		vec![
			Bound::Upper(TestSolver::var(0)),
			Bound::Lower(TestSolver::var(1)),
		]
	);
	// The failed pass must not have touched any bounds.
	assert_eq!(solver.values[0], Some(false));
	assert_eq!(solver.values[1], Some(true));
	assert!(solver.values[2..].iter().all(Option::is_none));
}

#[test]
#[traced_test]
fn test_mixed_cycles_propagates_first_cycle_only() {
	let mut solver = TestSolver::new(5);
	solver.fix(2, true);
	let mut cons = posted(&[1, 2, 0, 4, 3], &mut solver);
	assert_eq!(cons.propagate(&mut solver), Ok(Propagation::Tightened(2)));
	assert_eq!(solver.values[0], Some(true));
	assert_eq!(solver.values[1], Some(true));
	assert_eq!(solver.values[3], None);
	assert_eq!(solver.values[4], None);
	assert_eq!(
		solver.inferences,
		vec![
			(TestSolver::var(0), true, Inference::Power(2)),
			(TestSolver::var(1), true, Inference::Power(1)),
		]
	);
}

#[test]
#[traced_test]
fn test_four_cycle_inner_one_fixes_head_only() {
	let mut solver = TestSolver::new(4);
	solver.fix(2, true);
	let mut cons = posted(&[1, 2, 3, 0], &mut solver);
	assert_eq!(cons.propagate(&mut solver), Ok(Propagation::Tightened(1)));
	assert_eq!(solver.values[0], Some(true));
	// x1 and x3 stay free: both (1,0,1,0) and (1,1,1,1) complete the vector.
	assert_eq!(solver.values[1], None);
	assert_eq!(solver.values[3], None);
	assert_eq!(
		solver.inferences,
		vec![(TestSolver::var(0), true, Inference::Power(3))]
	);
}

#[test]
fn test_peek_disabled_matches_on_complete_instances() {
	let mut with_peek = TestSolver::new(4);
	with_peek.fix(0, false);
	let mut cons = posted(&[1, 2, 3, 0], &mut with_peek);
	let _ = cons.propagate(&mut with_peek).unwrap();

	let mut without = TestSolver::new(4);
	without.fix(0, false);
	let mut cons = posted_with(
		&[1, 2, 3, 0],
		&mut without,
		SymretopeOptions {
			peek: false,
			..SymretopeOptions::default()
		},
	);
	let _ = cons.propagate(&mut without).unwrap();
	assert_eq!(with_peek.values, without.values);
}

#[test]
#[traced_test]
fn test_fast_path_matches_general_orchestrator() {
	let perm = [1, 2, 0, 4, 3];
	let mut fast = TestSolver::new(5);
	fast.fix(2, true);
	let mut cons = posted(&perm, &mut fast);
	assert!(cons.is_monotone() && cons.is_ordered());
	let _ = cons.propagate(&mut fast).unwrap();

	let mut general = TestSolver::new(5);
	general.fix(2, true);
	let permutation = Permutation::new(perm.to_vec());
	let ctx = PropCtx {
		perm: &permutation,
		nperms: permutation.order() as usize - 1,
		repropagate_between_peeks: true,
	};
	let vars = TestSolver::var_ids(5);
	let mut scratch = Scratch::default();
	let mut fx = Fixings {
		vars: &vars,
		actions: &mut general,
		overlay: None,
		use_base: true,
		checked: None,
	};
	let ngen = propagate::prop_standard(&ctx, &mut scratch, &mut fx, true).unwrap();
	assert_eq!(ngen, 2);
	assert_eq!(fast.values, general.values);
}

#[test]
fn test_explain_power_fixing() {
	let mut solver = TestSolver::new(4);
	solver.fix(0, false);
	let mut cons = posted(&[1, 2, 3, 0], &mut solver);
	let _ = cons.propagate(&mut solver).unwrap();

	// x3 := 0 was inferred under power 1 while only x0 was fixed.
	let snapshot = Snapshot::new(vec![Some(false), None, None, None]);
	let conjunction = cons.explain(&snapshot, TestSolver::var(3), false, Inference::Power(1));
	assert_eq!(conjunction, vec![Bound::Upper(TestSolver::var(0))]);
}

#[test]
#[traced_test]
fn test_explain_peek_fixing_sparsifies() {
	let mut solver = TestSolver::new(3);
	let mut cons = posted(&[1, 2, 0], &mut solver);
	// Pretend x0 := 1 was committed by peeking while x2 was fixed to one:
	// with x0 = 0 the pair (x0, x2) is the contradictory pattern under γ.
	let snapshot = Snapshot::new(vec![None, None, Some(true)]);
	let conjunction = cons.explain(&snapshot, TestSolver::var(0), true, Inference::Peek);
	assert_eq!(conjunction, vec![Bound::Lower(TestSolver::var(2))]);
}

#[test]
fn test_check_reports_first_violation() {
	let mut solver = TestSolver::new(4);
	let cons = posted(&[1, 2, 3, 0], &mut solver);
	// Feasible: lexicographically maximal among its rotations (with ties).
	let feasible = [true, false, true, false];
	assert_eq!(cons.check(|v| feasible[v.index()]), None);
	// The all-up-shift of the feasible point is itself violated.
	let violated = [false, false, false, true];
	let violation = cons.check(|v| violated[v.index()]).unwrap();
	assert_eq!(violation.power, 1);
	assert_eq!(violation.zero, TestSolver::var(0));
	assert_eq!(violation.one, TestSolver::var(3));
}

#[test]
fn test_check_flipped_inference_is_infeasible() {
	let mut solver = TestSolver::new(4);
	solver.fix(0, false);
	let mut cons = posted(&[1, 2, 3, 0], &mut solver);
	let _ = cons.propagate(&mut solver).unwrap();
	// Flipping the inferred x3 := 0 must violate the inferring power.
	let flipped = [false, false, false, true];
	let violation = cons.check(|v| flipped[v.index()]).unwrap();
	assert_eq!(violation.power, 1);
}

#[test]
fn test_notify_event_gates_repropagation() {
	let mut solver = TestSolver::new(4);
	let mut cons = posted(&[1, 2, 3, 0], &mut solver);
	// Propagation is initially pending, further events change nothing.
	assert!(!cons.notify_event(0));
	assert_eq!(cons.propagate(&mut solver), Ok(Propagation::Fixpoint));
	// Once idle, an event on a consulted entry schedules a new pass.
	assert!(cons.notify_event(0));
	assert!(!cons.notify_event(0));
	assert_eq!(cons.propagate(&mut solver), Ok(Propagation::Fixpoint));
	// And without any event the pass is skipped.
	assert_eq!(cons.propagate(&mut solver), Ok(Propagation::Skipped));
}

#[test]
fn test_construction_validation() {
	let mut solver = TestSolver::new(3);
	let vars = TestSolver::var_ids(2);
	assert_eq!(
		Symretope::new(&vars, &[0], true, SymretopeOptions::default(), &mut solver).unwrap_err(),
		InvalidSymretope::LengthMismatch { vars: 2, perm: 1 }
	);
	assert_eq!(
		Symretope::new(&vars, &[0, 5], true, SymretopeOptions::default(), &mut solver)
			.unwrap_err(),
		InvalidSymretope::OutOfRange { index: 1, value: 5 }
	);
	assert_eq!(
		Symretope::new(&vars, &[0, 0], true, SymretopeOptions::default(), &mut solver)
			.unwrap_err(),
		InvalidSymretope::Duplicate { value: 0 }
	);
	let mut solver = TestSolver::new(2);
	solver.mark_non_binary(1);
	assert_eq!(
		Symretope::new(&vars, &[1, 0], true, SymretopeOptions::default(), &mut solver)
			.unwrap_err(),
		InvalidSymretope::MixedCycle { index: 0 }
	);
}

#[test]
fn test_construction_compacts_support() {
	// Fixed points and a non-binary swap are screened out.
	let mut solver = TestSolver::new(6);
	solver.mark_non_binary(2);
	solver.mark_non_binary(3);
	let cons = Symretope::new(
		&TestSolver::var_ids(6),
		&[1, 0, 3, 2, 4, 5],
		true,
		SymretopeOptions::default(),
		&mut solver,
	)
	.unwrap()
	.unwrap();
	assert_eq!(cons.vars(), &[TestSolver::var(0), TestSolver::var(1)]);
	assert_eq!(cons.order(), 2);
	assert_eq!(
		solver.subscriptions,
		vec![(TestSolver::var(0), 0), (TestSolver::var(1), 1)]
	);

	// A permutation that only fixes binary points is trivially satisfied.
	let trivial = Symretope::new(
		&TestSolver::var_ids(3),
		&[0, 1, 2],
		true,
		SymretopeOptions::default(),
		&mut solver,
	)
	.unwrap();
	assert!(trivial.is_none());
}

#[test]
fn test_order_ceiling_truncates_tracked_powers() {
	let mut solver = TestSolver::new(5);
	let cons = posted_with(
		&[1, 2, 0, 4, 3],
		&mut solver,
		SymretopeOptions {
			max_order: 2,
			..SymretopeOptions::default()
		},
	);
	assert_eq!(cons.order(), 6);
	assert_eq!(cons.tracked_powers(), 2);
}

#[test]
fn test_locks_by_cycle_extremes() {
	let mut solver = TestSolver::new(5);
	let cons = posted(&[1, 2, 0, 4, 3], &mut solver);
	assert_eq!(
		cons.locks(),
		vec![
			(TestSolver::var(0), LockDirection::Down),
			(TestSolver::var(1), LockDirection::Both),
			(TestSolver::var(2), LockDirection::Up),
			(TestSolver::var(3), LockDirection::Down),
			(TestSolver::var(4), LockDirection::Up),
		]
	);
}

#[test]
fn test_initial_cuts_cover_first_cycle() {
	let mut solver = TestSolver::new(4);
	let cons = posted(&[1, 2, 3, 0], &mut solver);
	let cuts: Vec<OrderingCut> = cons.initial_cuts();
	assert_eq!(cuts.len(), 3);
	for (cut, lesser) in cuts.iter().zip(1..) {
		assert_eq!(cut.lesser, TestSolver::var(lesser));
		assert_eq!(cut.greater, TestSolver::var(0));
	}
}

#[test]
fn test_text_form_roundtrip() {
	let mut solver = TestSolver::new(5);
	let cons = posted(&[1, 2, 0, 4, 3], &mut solver);
	let text = cons.to_text(|v| format!("x{}", v.index()));
	expect![[r#"symretope([x0,x1,x2,x3,x4],[1,2,0,4,3])"#]].assert_eq(&text);

	let parsed: ParsedSymretope = text.parse().unwrap();
	assert_eq!(
		parsed.variables,
		vec!["x0", "x1", "x2", "x3", "x4"]
	);
	assert_eq!(parsed.perm, vec![1, 2, 0, 4, 3]);
}

#[test]
fn test_parse_rejects_malformed_text() {
	assert_eq!(
		"orbisack([x],[0])".parse::<ParsedSymretope>(),
		Err(ParseError::MissingKeyword)
	);
	assert_eq!(
		"symretope([x0,x1],[0,oops])".parse::<ParsedSymretope>(),
		Err(ParseError::InvalidInteger("oops".to_owned()))
	);
	assert_eq!(
		"symretope([x0,x1],[0])".parse::<ParsedSymretope>(),
		Err(ParseError::LengthMismatch)
	);
	assert_eq!(
		"symretope([x0],[0]".parse::<ParsedSymretope>(),
		Err(ParseError::Expected(')'))
	);
}

#[test]
fn test_should_copy_honours_model_flag() {
	let mut solver = TestSolver::new(2);
	let model = posted(&[1, 0], &mut solver);
	assert!(model.should_copy());

	let plain = Symretope::new(
		&TestSolver::var_ids(2),
		&[1, 0],
		false,
		SymretopeOptions::default(),
		&mut solver,
	)
	.unwrap()
	.unwrap();
	assert!(!plain.should_copy());
	let forced = Symretope::new(
		&TestSolver::var_ids(2),
		&[1, 0],
		false,
		SymretopeOptions {
			force_copy: true,
			..SymretopeOptions::default()
		},
		&mut solver,
	)
	.unwrap()
	.unwrap();
	assert!(forced.should_copy());
}
