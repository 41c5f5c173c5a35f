use tracing::debug;

use crate::{permutation::Permutation, VarId};

/// An ordering inequality x_lesser ≤ x_greater of the initial relaxation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OrderingCut {
	pub lesser: VarId,
	pub greater: VarId,
}

/// A symresack cover inequality Σ coeff·x ≤ rhs with coefficients in
/// {−1, 1}.
#[derive(Clone, Debug, PartialEq)]
pub struct CoverCut {
	pub coefficients: Vec<(VarId, i32)>,
	pub rhs: f64,
}

const EPS: f64 = 1e-9;
/// Minimal violation for a cut to be worth separating.
const EFFICACY: f64 = 1e-4;

fn is_gt(a: f64, b: f64) -> bool {
	a > b + EPS
}

fn is_lt(a: f64, b: f64) -> bool {
	a < b - EPS
}

fn is_ge(a: f64, b: f64) -> bool {
	a >= b - EPS
}

/// Maximise `objective` over the strict symresack (equality with the permuted
/// vector excluded), returning the critical entry of a maximiser and the
/// non-constant part of the optimum.
///
/// Scans candidate critical rows while maintaining the path components of the
/// graph with arcs {i, invperm\[i\]} for the rows already passed; per
/// component only the objective sum and the opposite endpoint are needed.
fn maximize_strict(objective: &[f64], invperm: &[usize]) -> (usize, f64) {
	let n = objective.len();
	let mut component_ends: Vec<usize> = (0..n).collect();
	let mut component_obj: Vec<f64> = objective.to_vec();
	// Sum of all positive component objectives, an upper bound for every
	// later candidate.
	let mut helper_obj: f64 = objective.iter().filter(|&&o| is_gt(o, 0.0)).sum();

	let mut max_crit = None;
	let mut max_val = f64::NEG_INFINITY;
	for crit in 0..n {
		let crit_inv = invperm[crit];
		if crit == crit_inv {
			continue;
		}
		// The candidate would close a cycle with its own preimage.
		if component_ends[crit] == crit_inv {
			continue;
		}

		let mut tmp = helper_obj;
		if is_lt(component_obj[crit], 0.0) {
			tmp += component_obj[crit];
		}
		if is_gt(component_obj[crit_inv], 0.0) {
			tmp -= component_obj[crit_inv];
		}
		if is_gt(tmp, max_val) {
			max_val = tmp;
			max_crit = Some(crit);
		}

		let merged = component_obj[crit] + component_obj[crit_inv];
		if is_gt(component_obj[crit], 0.0) {
			helper_obj -= component_obj[crit];
		}
		if is_gt(component_obj[crit_inv], 0.0) {
			helper_obj -= component_obj[crit_inv];
		}
		if is_gt(merged, 0.0) {
			helper_obj += merged;
		}

		let end_crit = component_ends[crit];
		let end_inv = component_ends[crit_inv];
		component_obj[end_crit] = merged;
		component_obj[end_inv] = merged;
		if end_crit == crit {
			component_ends[crit] = end_inv;
			component_ends[end_inv] = crit;
		} else {
			component_ends[end_crit] = end_inv;
			component_ends[end_inv] = end_crit;
		}

		if is_ge(max_val, helper_obj) {
			break;
		}
	}
	// The first non-fixed entry can always be made critical.
	(max_crit.expect("no critical entry candidate"), max_val)
}

/// A maximiser of `objective` over the symresack with the critical entry
/// fixed at `crit`: label the path components of the sub-crit rows, then set
/// each component by sign, with crit's component at one and its preimage's at
/// zero.
fn critical_entry_solution(
	objective: &[f64],
	perm: &[usize],
	invperm: &[usize],
	crit: usize,
) -> Vec<i32> {
	let n = objective.len();
	let mut entry_component: Vec<usize> = (0..n).collect();
	let mut component_obj: Vec<f64> = objective.to_vec();

	for i in 0..crit {
		if i == invperm[i] {
			continue;
		}
		if entry_component[i] < i {
			continue;
		}
		// Follow the path forward over arcs {c, invperm[c]} with c < crit.
		let mut c = i;
		while c < crit {
			c = invperm[c];
			if entry_component[c] != c {
				break;
			}
			entry_component[c] = i;
			component_obj[i] += objective[c];
		}
		// And backward over arcs {c, perm[c]}.
		let mut c = perm[i];
		while c < crit {
			if entry_component[c] != c {
				break;
			}
			entry_component[c] = i;
			component_obj[i] += objective[c];
			c = perm[c];
		}
	}

	let mut sol = vec![0; n];
	for i in 0..n {
		sol[i] = if i == invperm[i] {
			0
		} else if entry_component[i] == entry_component[crit] {
			1
		} else if entry_component[i] == entry_component[invperm[crit]] {
			0
		} else if is_gt(component_obj[entry_component[i]], 0.0) {
			1
		} else {
			0
		};
	}
	sol
}

/// Separate cover inequalities for each tracked power in turn; with
/// `all_violating == false` stop after the first violated one.
pub(crate) fn separate_covers(
	perm: &Permutation,
	vars: &[VarId],
	nperms: usize,
	all_violating: bool,
	values: &[f64],
) -> Vec<CoverCut> {
	let n = vars.len();
	let mut cuts = Vec::new();
	if n < 2 {
		return cuts;
	}
	debug_assert_eq!(values.len(), n);

	for k in 1..=nperms as i64 {
		let perm_arr = perm.power_map(k);
		let invperm = perm.power_map(-k);
		debug_assert!((0..n).all(|i| perm_arr[invperm[i]] == i));

		let mut const_obj = 1.0;
		let mut objective = vec![0.0; n];
		for i in 0..n {
			if i < perm_arr[i] {
				objective[i] = -values[i];
			} else if i > perm_arr[i] {
				objective[i] = 1.0 - values[i];
				const_obj += values[i] - 1.0;
			}
		}

		let (crit, strict_val) = maximize_strict(&objective, &invperm);
		debug_assert_ne!(invperm[crit], crit);
		let sol = critical_entry_solution(&objective, &perm_arr, &invperm, crit);

		let violation = strict_val + const_obj;
		if violation > EFFICACY {
			debug!(power = k, crit, violation, "separated cover inequality");
			let mut rhs = -1.0;
			let mut coefficients = Vec::with_capacity(n);
			for i in 0..n {
				if i < perm_arr[i] {
					if sol[i] == 1 {
						coefficients.push((vars[i], -1));
					}
				} else if i > perm_arr[i] {
					if sol[i] == 0 {
						rhs += 1.0;
						coefficients.push((vars[i], 1));
					}
				}
			}
			cuts.push(CoverCut { coefficients, rhs });
			if !all_violating {
				break;
			}
		}
	}
	cuts
}
