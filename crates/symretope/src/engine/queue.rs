use crate::engine::Fixing;

const QUEUED0: u8 = 1;
const QUEUED1: u8 = 2;

/// Outcome of [`FixingQueue::enqueue`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Enqueue {
	Pushed,
	AlreadyQueued,
	/// The opposite fixing of the same entry is pending; `other_pow` is the
	/// power that requested it.
	Contradiction { other_pow: u64 },
}

/// Pending fixings surfaced by the implication trees, with per-entry
/// deduplication and the antecedent power recorded for conflict analysis.
#[derive(Clone, Debug, Default)]
pub(crate) struct FixingQueue {
	pending: Vec<u8>,
	queue: Vec<Fixing>,
	pows: Vec<u64>,
}

impl FixingQueue {
	pub(crate) fn ensure(&mut self, nvars: usize) {
		if self.pending.len() < nvars {
			self.pending.resize(nvars, 0);
			self.pows.resize(nvars, 0);
		}
		debug_assert!(self.queue.is_empty());
		debug_assert!(self.pending.iter().all(|&b| b == 0));
	}

	pub(crate) fn enqueue(&mut self, fixing: Fixing, pow: u64) -> Enqueue {
		let bit = if fixing.value { QUEUED1 } else { QUEUED0 };
		let cur = self.pending[fixing.var];
		if cur & bit != 0 {
			return Enqueue::AlreadyQueued;
		}
		if cur | bit == QUEUED0 | QUEUED1 {
			return Enqueue::Contradiction {
				other_pow: self.pows[fixing.var],
			};
		}
		self.pows[fixing.var] = pow;
		self.pending[fixing.var] |= bit;
		self.queue.push(fixing);
		Enqueue::Pushed
	}

	pub(crate) fn pop(&mut self) -> Option<(Fixing, u64)> {
		let fixing = self.queue.pop()?;
		let bit = if fixing.value { QUEUED1 } else { QUEUED0 };
		self.pending[fixing.var] &= !bit;
		Some((fixing, self.pows[fixing.var]))
	}

	pub(crate) fn is_empty(&self) -> bool {
		self.queue.is_empty()
	}

	/// Drop all pending fixings.
	pub(crate) fn clear(&mut self) {
		while self.pop().is_some() {}
	}
}
