use tracing::trace;

use crate::helpers::arith::lcm;

/// Immutable cycle-structure view of a permutation of `0..len`.
///
/// Built once per constraint. Stores the cycle decomposition in a single flat
/// block, per-variable cycle membership for O(1) power application, the group
/// order, and the two structural flags that enable the per-cycle fast path:
/// `monotone` (every cycle traversal has at most one descent) and `ordered`
/// (cycle maxima do not decrease in input order).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Permutation {
	map: Vec<usize>,
	cycle_block: Vec<usize>,
	cycle_start: Vec<usize>,
	var_cycle: Vec<usize>,
	var_cycle_pos: Vec<usize>,
	order: u64,
	max_cycle_len: usize,
	monotone: bool,
	ordered: bool,
}

impl Permutation {
	/// Decompose `map` into cycles.
	///
	/// `map` must be a bijection on `0..map.len()`; the constraint validates
	/// this before construction.
	pub fn new(map: Vec<usize>) -> Self {
		let n = map.len();
		debug_assert!(map.iter().all(|&j| j < n));

		let mut cycle_block = Vec::with_capacity(n);
		let mut cycle_start = vec![0];
		let mut var_cycle = vec![usize::MAX; n];
		let mut var_cycle_pos = vec![usize::MAX; n];
		let mut order: u64 = 1;
		let mut max_cycle_len = 0;
		let mut monotone = true;
		let mut ordered = true;
		let mut prev_cycle_max = None;

		for i in 0..n {
			if var_cycle[i] != usize::MAX {
				continue;
			}
			let cycle_id = cycle_start.len() - 1;
			let mut j = i;
			let mut len = 0;
			let mut cycle_max = i;
			let mut descents = 0;
			loop {
				cycle_max = cycle_max.max(j);
				if prev_cycle_max.is_some_and(|m| j < m) {
					ordered = false;
				}
				if map[j] < j {
					descents += 1;
				}
				var_cycle[j] = cycle_id;
				var_cycle_pos[j] = len;
				cycle_block.push(j);
				len += 1;
				j = map[j];
				if j == i {
					break;
				}
			}
			if descents > 1 {
				monotone = false;
			}
			prev_cycle_max = Some(cycle_max);
			order = lcm(order, len as u64);
			max_cycle_len = max_cycle_len.max(len);
			cycle_start.push(cycle_block.len());
		}

		trace!(
			nvars = n,
			ncycles = cycle_start.len() - 1,
			order,
			monotone,
			ordered,
			"built permutation"
		);

		Self {
			map,
			cycle_block,
			cycle_start,
			var_cycle,
			var_cycle_pos,
			order,
			max_cycle_len,
			monotone,
			ordered,
		}
	}

	pub fn len(&self) -> usize {
		self.map.len()
	}

	pub fn is_empty(&self) -> bool {
		self.map.is_empty()
	}

	/// The order of the cyclic group generated by the permutation, saturating
	/// at `u64::MAX`.
	pub fn order(&self) -> u64 {
		self.order
	}

	pub fn num_cycles(&self) -> usize {
		self.cycle_start.len() - 1
	}

	/// The indices of cycle `c` in traversal order.
	pub fn cycle(&self, c: usize) -> &[usize] {
		&self.cycle_block[self.cycle_start[c]..self.cycle_start[c + 1]]
	}

	pub fn cycle_of(&self, i: usize) -> usize {
		self.var_cycle[i]
	}

	pub fn max_cycle_len(&self) -> usize {
		self.max_cycle_len
	}

	pub fn is_monotone(&self) -> bool {
		self.monotone
	}

	pub fn is_ordered(&self) -> bool {
		self.ordered
	}

	/// Where index `i` moves under a single application.
	pub fn image(&self, i: usize) -> usize {
		self.map[i]
	}

	/// γ^pow applied to `i`.
	pub fn apply(&self, i: usize, pow: u64) -> usize {
		let cycle = self.cycle(self.var_cycle[i]);
		let len = cycle.len();
		let shift = (pow % len as u64) as usize;
		cycle[(self.var_cycle_pos[i] + shift) % len]
	}

	/// γ^-pow applied to `i`.
	pub fn apply_inv(&self, i: usize, pow: u64) -> usize {
		let cycle = self.cycle(self.var_cycle[i]);
		let len = cycle.len();
		let shift = (pow % len as u64) as usize;
		cycle[(self.var_cycle_pos[i] + len - shift) % len]
	}

	/// The dense array of γ^pow, iterating every cycle once.
	pub fn power_map(&self, pow: i64) -> Vec<usize> {
		let mut arr = vec![0; self.len()];
		for c in 0..self.num_cycles() {
			let cycle = self.cycle(c);
			let len = cycle.len() as i64;
			let shift = pow.rem_euclid(len) as usize;
			for (pos, &i) in cycle.iter().enumerate() {
				arr[i] = cycle[(pos + shift) % cycle.len()];
			}
		}
		arr
	}
}
