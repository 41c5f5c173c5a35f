use std::str::FromStr;

use delegate::delegate;
use itertools::Itertools;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
	actions::{
		ExplanationActions, InitializationActions, InspectionActions, PropagationActions,
	},
	engine::{
		explain,
		propagate::{self, PropCtx},
		Failure, Fixing, Fixings, Scratch,
	},
	permutation::Permutation,
	separation::{self, CoverCut, OrderingCut},
	Bound, Conflict, Conjunction, Inference, VarId,
};

/// Behavioural options of a symretope constraint. None of them affect
/// correctness, only how much work the propagator invests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SymretopeOptions {
	/// Copy the constraint into sub-problems even when it is not a model
	/// constraint.
	pub force_copy: bool,
	/// Probe unfixed impactful entries for forced values.
	pub peek: bool,
	/// Run the peek driver while the solver is probing.
	pub peek_in_probing: bool,
	/// Cap on the number of tracked non-identity powers. Beyond it the
	/// propagation is incomplete.
	pub max_order: u64,
	/// Cap on tracked powers times the number of variables (memory guard).
	pub max_order_times_nvars: u64,
	/// Separate cover cuts for every violated power instead of only the
	/// first.
	pub separate_all_violating: bool,
	/// Re-establish completeness after every fixing the peek driver commits.
	/// Not required for correctness, but it avoids peek-tagged inferences
	/// that are expensive to explain.
	pub repropagate_between_peeks: bool,
}

impl Default for SymretopeOptions {
	fn default() -> Self {
		Self {
			force_copy: false,
			peek: true,
			peek_in_probing: false,
			max_order: 10_000,
			max_order_times_nvars: 5_000_000,
			separate_all_violating: true,
			repropagate_between_peeks: true,
		}
	}
}

/// Rejected constraint input.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InvalidSymretope {
	#[error("permutation has {perm} entries for {vars} variables")]
	LengthMismatch { vars: usize, perm: usize },
	#[error("permutation entry {index} maps to {value}, outside the variable range")]
	OutOfRange { index: usize, value: usize },
	#[error("permutation is not a bijection: {value} has two preimages")]
	Duplicate { value: usize },
	#[error("the cycle through entry {index} mixes binary and non-binary variables")]
	MixedCycle { index: usize },
}

/// Error of [`ParsedSymretope::from_str`].
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ParseError {
	#[error("expected \"symretope(\"")]
	MissingKeyword,
	#[error("expected {0:?}")]
	Expected(char),
	#[error("could not parse permutation entry {0:?}")]
	InvalidInteger(String),
	#[error("permutation length does not match the variable list")]
	LengthMismatch,
}

/// Outcome of a [`Symretope::propagate`] call that did not prove
/// infeasibility.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Propagation {
	/// No entry consulted by the previous pass has changed, so the pass was
	/// skipped.
	Skipped,
	/// The pass ran but derived nothing new.
	Fixpoint,
	/// The pass tightened this many variable bounds.
	Tightened(u32),
}

/// Rounding directions that can violate the constraint, per variable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockDirection {
	Down,
	Up,
	Both,
}

/// A violated lexicographic comparison found by [`Symretope::check`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Violation {
	pub power: u64,
	/// First differing entry, valued zero.
	pub zero: VarId,
	/// Its preimage under γ^power, valued one.
	pub one: VarId,
}

/// The textual form of a constraint, `symretope([v0,…],[p0,…])`, with
/// variables by name. The host resolves names to [`VarId`]s before calling
/// [`Symretope::new`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedSymretope {
	pub variables: Vec<String>,
	pub perm: Vec<usize>,
}

impl FromStr for ParsedSymretope {
	type Err = ParseError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		fn bracketed(s: &str) -> Result<(&str, &str), ParseError> {
			let s = s
				.trim_start()
				.strip_prefix('[')
				.ok_or(ParseError::Expected('['))?;
			let end = s.find(']').ok_or(ParseError::Expected(']'))?;
			Ok((&s[..end], s[end + 1..].trim_start()))
		}

		let s = s.trim();
		let rest = s
			.strip_prefix("symretope(")
			.ok_or(ParseError::MissingKeyword)?;
		let (vars_part, rest) = bracketed(rest)?;
		let rest = rest.strip_prefix(',').ok_or(ParseError::Expected(','))?;
		let (perm_part, rest) = bracketed(rest)?;
		if !rest.starts_with(')') {
			return Err(ParseError::Expected(')'));
		}

		let variables: Vec<String> = vars_part
			.split(',')
			.map(str::trim)
			.filter(|t| !t.is_empty())
			.map(str::to_owned)
			.collect();
		let perm = perm_part
			.split(',')
			.map(str::trim)
			.filter(|t| !t.is_empty())
			.map(|t| {
				t.parse::<usize>()
					.map_err(|_| ParseError::InvalidInteger(t.to_owned()))
			})
			.collect::<Result<Vec<_>, _>>()?;
		if variables.len() != perm.len() {
			return Err(ParseError::LengthMismatch);
		}
		Ok(Self { variables, perm })
	}
}

/// A symmetry breaking constraint requiring the variable vector to be
/// lexicographically maximal within its orbit under the cyclic group
/// generated by a permutation of the entries.
#[derive(Clone, Debug)]
pub struct Symretope {
	vars: Vec<VarId>,
	perm: Permutation,
	/// Number of tracked non-identity powers; smaller than the group order
	/// when the configured ceilings truncate the list.
	nperms: usize,
	is_model: bool,
	options: SymretopeOptions,
	propagate_pending: bool,
	affected: Vec<bool>,
	scratch: Scratch,
}

impl Symretope {
	/// Create a constraint over `vars` and the index map `perm`.
	///
	/// Non-binary variables and fixed points are compacted away; when nothing
	/// remains the constraint is trivially satisfied and `Ok(None)` is
	/// returned. Subscribes to bound-change events of every kept variable,
	/// with the local entry index as event data.
	pub fn new<I: InitializationActions>(
		vars: &[VarId],
		perm: &[usize],
		is_model: bool,
		options: SymretopeOptions,
		actions: &mut I,
	) -> Result<Option<Self>, InvalidSymretope> {
		if vars.len() != perm.len() {
			return Err(InvalidSymretope::LengthMismatch {
				vars: vars.len(),
				perm: perm.len(),
			});
		}
		let mut seen = vec![false; perm.len()];
		for (index, &value) in perm.iter().enumerate() {
			if value >= perm.len() {
				return Err(InvalidSymretope::OutOfRange { index, value });
			}
			if seen[value] {
				return Err(InvalidSymretope::Duplicate { value });
			}
			seen[value] = true;
		}
		for (index, &value) in perm.iter().enumerate() {
			if index != value && actions.is_binary(vars[index]) != actions.is_binary(vars[value]) {
				return Err(InvalidSymretope::MixedCycle { index });
			}
		}

		// Keep the binary entries moved by the permutation.
		let keep: Vec<usize> = (0..vars.len())
			.filter(|&i| perm[i] != i && actions.is_binary(vars[i]))
			.collect();
		if keep.is_empty() {
			return Ok(None);
		}
		let mut correction = vec![usize::MAX; vars.len()];
		for (new, &old) in keep.iter().enumerate() {
			correction[old] = new;
		}
		let kept_vars: Vec<VarId> = keep.iter().map(|&i| vars[i]).collect();
		let kept_perm: Vec<usize> = keep.iter().map(|&i| correction[perm[i]]).collect();
		let n = kept_vars.len();
		let permutation = Permutation::new(kept_perm);

		let order = permutation.order();
		let mut nperms = usize::try_from(order.saturating_sub(1)).unwrap_or(usize::MAX);
		if nperms as u64 > options.max_order
			|| (nperms as u64).saturating_mul(n as u64) > options.max_order_times_nvars
		{
			warn!(order, "symretope constraint will not capture all symmetries");
		}
		if options.max_order > 0 && nperms as u64 > options.max_order {
			nperms = options.max_order as usize;
			warn!(
				order,
				max_order = options.max_order,
				nperms,
				"group order above the ceiling, restricting the tracked powers"
			);
		}
		if options.max_order_times_nvars > 0
			&& (nperms as u64).saturating_mul(n as u64) > options.max_order_times_nvars
		{
			nperms = ((options.max_order_times_nvars / n as u64) as usize).max(1);
			warn!(
				order,
				nvars = n,
				max_order_times_nvars = options.max_order_times_nvars,
				nperms,
				"group order times support above the ceiling, restricting the tracked powers"
			);
		}

		for (local, &var) in kept_vars.iter().enumerate() {
			actions.subscribe(var, local as u32);
		}

		Ok(Some(Self {
			vars: kept_vars,
			perm: permutation,
			nperms,
			is_model,
			options,
			propagate_pending: true,
			affected: vec![false; n],
			scratch: Scratch::default(),
		}))
	}

	pub fn vars(&self) -> &[VarId] {
		&self.vars
	}

	pub fn len(&self) -> usize {
		self.vars.len()
	}

	pub fn is_empty(&self) -> bool {
		self.vars.is_empty()
	}

	pub fn permutation(&self) -> &Permutation {
		&self.perm
	}

	delegate! {
		to self.perm {
			pub fn order(&self) -> u64;
			pub fn is_monotone(&self) -> bool;
			pub fn is_ordered(&self) -> bool;
		}
	}

	/// The number of non-identity powers the constraint tracks. Below
	/// `order() - 1` the constraint is advertised as incomplete.
	pub fn tracked_powers(&self) -> usize {
		self.nperms
	}

	pub fn is_model_constraint(&self) -> bool {
		self.is_model
	}

	pub fn options(&self) -> &SymretopeOptions {
		&self.options
	}

	/// Whether the constraint should be copied into a sub-problem.
	pub fn should_copy(&self) -> bool {
		self.is_model || self.options.force_copy
	}

	/// Host callback for a bound change of the variable subscribed with
	/// `data`. Returns whether the constraint newly requires propagation:
	/// only changes of entries consulted by the previous pass can invalidate
	/// its fixpoint.
	pub fn notify_event(&mut self, data: u32) -> bool {
		let idx = data as usize;
		if !self.propagate_pending && self.affected.get(idx).copied().unwrap_or(false) {
			self.propagate_pending = true;
			return true;
		}
		false
	}

	/// Derive fixings implied by the current bounds, or prove them
	/// infeasible.
	#[tracing::instrument(level = "debug", skip(self, actions))]
	pub fn propagate<P: PropagationActions>(
		&mut self,
		actions: &mut P,
	) -> Result<Propagation, Conflict> {
		if !self.propagate_pending {
			return Ok(Propagation::Skipped);
		}
		self.affected.iter_mut().for_each(|b| *b = false);
		let result = self.run_propagation(actions, true);
		match result {
			Ok(ngen) => {
				self.propagate_pending = false;
				debug!(fixings = ngen, "propagation finished");
				Ok(if ngen > 0 {
					Propagation::Tightened(ngen)
				} else {
					Propagation::Fixpoint
				})
			}
			Err(failure) => Err(self.build_conflict(actions, failure)),
		}
	}

	/// Propagation during presolve: always runs, without affected-entry
	/// tracking.
	pub fn presolve<P: PropagationActions>(
		&mut self,
		actions: &mut P,
	) -> Result<Propagation, Conflict> {
		match self.run_propagation(actions, false) {
			Ok(0) => Ok(Propagation::Fixpoint),
			Ok(ngen) => Ok(Propagation::Tightened(ngen)),
			Err(failure) => Err(self.build_conflict(actions, failure)),
		}
	}

	fn run_propagation<P: PropagationActions>(
		&mut self,
		actions: &mut P,
		track_affected: bool,
	) -> Result<u32, Failure> {
		let find_complete =
			self.options.peek && (!actions.in_probing() || self.options.peek_in_probing);
		let ctx = PropCtx {
			perm: &self.perm,
			nperms: self.nperms,
			repropagate_between_peeks: self.options.repropagate_between_peeks,
		};
		let mut fx = Fixings {
			vars: &self.vars,
			actions,
			overlay: None,
			use_base: true,
			checked: track_affected.then_some(self.affected.as_mut_slice()),
		};
		propagate::prop_variables(&ctx, &mut self.scratch, &mut fx, find_complete)
	}

	fn build_conflict<A: InspectionActions>(&self, actions: &A, failure: Failure) -> Conflict {
		let mut conjunction = Conjunction::new();
		match failure {
			Failure::Infeasible { pow } => {
				explain::resolve_power(
					&self.perm,
					&self.vars,
					None,
					pow,
					|l| actions.value(self.vars[l]),
					&mut conjunction,
				);
			}
			Failure::Contradiction {
				fixing,
				pow,
				other_pow,
			} => {
				explain::resolve_power(
					&self.perm,
					&self.vars,
					Some(fixing),
					pow,
					|l| actions.value(self.vars[l]),
					&mut conjunction,
				);
				explain::resolve_power(
					&self.perm,
					&self.vars,
					Some(fixing.flipped()),
					other_pow,
					|l| actions.value(self.vars[l]),
					&mut conjunction,
				);
			}
			Failure::Rejected { fixing, inference } => match inference {
				Inference::Power(pow) => {
					explain::resolve_power(
						&self.perm,
						&self.vars,
						Some(fixing),
						pow,
						|l| actions.value(self.vars[l]),
						&mut conjunction,
					);
					conjunction.push(Bound::fixing(self.vars[fixing.var], !fixing.value));
				}
				// A rejected peek commit has no resolvable explanation.
				Inference::Peek => {}
			},
		}
		debug!(antecedents = conjunction.len(), "built conflict");
		Conflict { conjunction }
	}

	/// List the recorded bounds that force the inference `var := value`
	/// previously posted with `inference`.
	pub fn explain<E: ExplanationActions>(
		&mut self,
		actions: &E,
		var: VarId,
		value: bool,
		inference: Inference,
	) -> Conjunction {
		let local = self
			.vars
			.iter()
			.position(|&v| v == var)
			.expect("inference variable is not part of the constraint");
		match inference {
			Inference::Power(pow) => {
				let mut out = Conjunction::new();
				explain::resolve_power(
					&self.perm,
					&self.vars,
					Some(Fixing::new(local, value)),
					pow,
					|l| actions.recorded_value(self.vars[l]),
					&mut out,
				);
				out
			}
			Inference::Peek => {
				let ctx = PropCtx {
					perm: &self.perm,
					nperms: self.nperms,
					repropagate_between_peeks: self.options.repropagate_between_peeks,
				};
				explain::explain_peek(
					&ctx,
					&mut self.scratch,
					actions,
					&self.vars,
					Fixing::new(local, value),
				)
			}
		}
	}

	/// Check a complete assignment against every tracked power. Returns the
	/// first violated comparison, if any.
	pub fn check(&self, mut value: impl FnMut(VarId) -> bool) -> Option<Violation> {
		if self.vars.len() < 2 {
			return None;
		}
		for pow in 1..=self.nperms as u64 {
			for i in 0..self.vars.len() {
				let j = self.perm.apply_inv(i, pow);
				let vi = value(self.vars[i]);
				let vj = value(self.vars[j]);
				if !vi && vj {
					return Some(Violation {
						power: pow,
						zero: self.vars[i],
						one: self.vars[j],
					});
				}
				if vi && !vj {
					break;
				}
			}
		}
		None
	}

	/// Rounding locks per variable: within each cycle the minimum entry can
	/// only be hurt by rounding down, the maximum only by rounding up, and
	/// every other entry by both.
	pub fn locks(&self) -> Vec<(VarId, LockDirection)> {
		let mut out = Vec::with_capacity(self.vars.len());
		for c in 0..self.perm.num_cycles() {
			let cycle = self.perm.cycle(c);
			if cycle.len() < 2 {
				continue;
			}
			let (min, max) = cycle
				.iter()
				.copied()
				.minmax()
				.into_option()
				.expect("cycles are never empty");
			for &i in cycle {
				let direction = if i == min {
					LockDirection::Down
				} else if i == max {
					LockDirection::Up
				} else {
					LockDirection::Both
				};
				out.push((self.vars[i], direction));
			}
		}
		out
	}

	/// Ordering inequalities for the initial LP relaxation: x_k ≤ x_0 for
	/// every other entry k of the first variable's cycle.
	pub fn initial_cuts(&self) -> Vec<OrderingCut> {
		if self.vars.len() <= 1 {
			return Vec::new();
		}
		let cycle = self.perm.cycle(self.perm.cycle_of(0));
		cycle
			.iter()
			.filter(|&&k| k != 0)
			.map(|&k| OrderingCut {
				lesser: self.vars[k],
				greater: self.vars[0],
			})
			.collect()
	}

	/// Separate symresack cover inequalities violated by the relaxation
	/// values (`values[i]` belongs to `vars()[i]`).
	pub fn separate(&self, values: &[f64]) -> Vec<CoverCut> {
		separation::separate_covers(
			&self.perm,
			&self.vars,
			self.nperms,
			self.options.separate_all_violating,
			values,
		)
	}

	/// The textual form `symretope([v0,…],[p0,…])` over the compacted
	/// variables.
	pub fn to_text(&self, mut name: impl FnMut(VarId) -> String) -> String {
		format!(
			"symretope([{}],[{}])",
			self.vars.iter().map(|&v| name(v)).format(","),
			(0..self.vars.len()).map(|i| self.perm.image(i)).format(",")
		)
	}
}
