use tracing::trace;

use crate::{
	actions::PropagationActions,
	engine::{
		overlay::VirtualFixings,
		queue::{Enqueue, FixingQueue},
		tree::{Forest, NodeKind, Tree},
		Failure, Fixing, Fixings, Impactful, Scratch,
	},
	helpers::arith::{gcd, lcm},
	permutation::Permutation,
	Inference,
};

/// Read-only inputs of a propagation pass.
pub(crate) struct PropCtx<'a> {
	pub(crate) perm: &'a Permutation,
	/// Number of tracked non-identity powers of the full group.
	pub(crate) nperms: usize,
	/// Re-establish completeness after every fixing the peek driver commits.
	pub(crate) repropagate_between_peeks: bool,
}

/// Run propagation to a fixpoint, dispatching to the per-cycle fast path when
/// the permutation allows it. Returns the number of tightened fixings.
pub(crate) fn prop_variables<A: PropagationActions>(
	ctx: &PropCtx,
	scratch: &mut Scratch,
	fx: &mut Fixings<'_, A>,
	find_complete: bool,
) -> Result<u32, Failure> {
	if ctx.perm.is_monotone() && ctx.perm.is_ordered() {
		prop_monotone_hotstart(ctx, scratch, fx, find_complete, 1, 0)
	} else {
		prop_standard(ctx, scratch, fx, find_complete)
	}
}

/// Build the implication trees of every considered power until the surfaced
/// fixings are closed under the group they generate.
///
/// With `support == None` the group is generated by γ^base_pow over all
/// entries (`base_pow` is 1 for the general orchestrator); otherwise the
/// considered permutation is restricted to a single cycle's support.
pub(crate) fn complete_fixings<A: PropagationActions>(
	ctx: &PropCtx,
	scratch: &mut Scratch,
	base_pow: u64,
	support: Option<&[usize]>,
	fx: &mut Fixings<'_, A>,
	mut impact: Option<&mut Impactful>,
	ngen: &mut u32,
) -> Result<(), Failure> {
	let nvars = ctx.perm.len();
	if nvars < 2 {
		return Ok(());
	}
	let nperms = match support {
		None => ctx.nperms,
		Some(sup) => {
			debug_assert!(sup.windows(2).all(|w| w[0] < w[1]));
			sup.len() / gcd(sup.len() as u64, base_pow) as usize - 1
		}
	};
	if nperms == 0 {
		return Ok(());
	}
	scratch.queue.ensure(nvars);
	scratch.forest.start(nvars, nperms, base_pow);
	let result = build_trees(
		ctx,
		&mut scratch.forest,
		&mut scratch.queue,
		nperms,
		support,
		fx,
		impact.as_deref_mut(),
		ngen,
	);
	// The arenas are recycled on every exit, including the infeasible ones.
	scratch.queue.clear();
	scratch.forest.clear(nperms);
	result
}

#[allow(clippy::too_many_arguments)]
fn build_trees<A: PropagationActions>(
	ctx: &PropCtx,
	forest: &mut Forest,
	fq: &mut FixingQueue,
	nperms: usize,
	support: Option<&[usize]>,
	fx: &mut Fixings<'_, A>,
	mut impact: Option<&mut Impactful>,
	ngen: &mut u32,
) -> Result<(), Failure> {
	let nvars = ctx.perm.len();
	while let Some(k) = forest.pop_perm() {
		let pow = forest.pow(k);
		loop {
			// Stop once no leaf is live.
			if forest.tree(k).leaves == [None, None] {
				break;
			}
			// Stop once the cursor leaves the considered range.
			let cursor = forest.cursor(k);
			let i = match support {
				None if cursor >= nvars => break,
				None => cursor,
				Some(sup) if cursor >= sup.len() => break,
				Some(sup) => sup[cursor],
			};
			let j = ctx.perm.apply_inv(i, pow);
			if i == j {
				forest.advance_cursor(k);
				continue;
			}
			// The values of both entries influence what happens from here on.
			if let Some(imp) = impact.as_deref_mut() {
				imp.push(i);
				imp.push(j);
			}
			// The cursor may halt once every rooted path passes a conditional
			// node and this position can no longer surface anything: the pair
			// is not (0, ·) or (·, 1) and both images lie beyond i.
			if ctx.perm.apply(i, pow) > i
				&& j > i
				&& fx.get(i) != Some(false)
				&& fx.get(j) != Some(true)
				&& forest.tree(k).root_has_conditional_child()
			{
				break;
			}

			// Snapshot the pair's value on each live path before extending, so
			// the first extension cannot influence the second.
			let tree = forest.tree(k);
			let mut steps = [None; 2];
			for (side, step) in steps.iter_mut().enumerate() {
				if tree.leaves[side].is_none() {
					continue;
				}
				let vi = fx.get(i).or_else(|| tree.recorded_value(i, side));
				let vj = fx.get(j).or_else(|| tree.recorded_value(j, side));
				*step = Some((vi, vj));
			}

			for side in 0..2 {
				let Some((vi, vj)) = steps[side] else { continue };
				// The other side's extension may have restructured the tree.
				let Some(leaf) = forest.tree(k).leaves[side] else {
					continue;
				};
				match (vi, vj) {
					(Some(false), Some(false)) | (Some(true), Some(true)) => {}
					(Some(true), Some(false)) => {
						// Strictly satisfied on this path.
						forest.tree_mut(k).leaves[side] = None;
					}
					(Some(false), None) => {
						let tree = forest.tree_mut(k);
						let n = tree.attach(leaf, side, NodeKind::Necessary, Fixing::new(j, false));
						tree.leaves[side] = Some(n);
					}
					(None, Some(true)) => {
						let tree = forest.tree_mut(k);
						let n = tree.attach(leaf, side, NodeKind::Necessary, Fixing::new(i, true));
						tree.leaves[side] = Some(n);
					}
					(Some(true), None) => {
						let tree = forest.tree_mut(k);
						let n = tree.attach(leaf, side, NodeKind::Conditional, Fixing::new(j, true));
						tree.leaves[side] = Some(n);
					}
					(None, Some(false)) => {
						let tree = forest.tree_mut(k);
						let n = tree.attach(leaf, side, NodeKind::Conditional, Fixing::new(i, false));
						tree.leaves[side] = Some(n);
					}
					(Some(false), Some(true)) => {
						collapse_leaf(forest.tree_mut(k), side, pow)?;
					}
					(None, None) => {
						// Open a two-branch hypothesis: either x_i = 0 (then
						// x_j = 0) or x_j = 1 (then x_i = 1). Possible only
						// while the sibling leaf slot is free.
						let tree = forest.tree_mut(k);
						debug_assert!(tree.leaves[1 - side].is_none());
						let c0 = tree.attach(leaf, 0, NodeKind::Conditional, Fixing::new(i, false));
						let n0 = tree.attach(c0, 0, NodeKind::Necessary, Fixing::new(j, false));
						let c1 = tree.attach(leaf, 1, NodeKind::Conditional, Fixing::new(j, true));
						let n1 = tree.attach(c1, 1, NodeKind::Necessary, Fixing::new(i, true));
						tree.leaves = [Some(n0), Some(n1)];
						break;
					}
				}
			}
			forest.advance_cursor(k);

			// Surface rule: a necessary child of the root is unconditional.
			if let Some(fixing) = forest.tree(k).root_necessary_child() {
				enqueue(fq, fixing, pow)?;
			}
			apply_fixings(ctx, forest, fq, nperms, fx, ngen)?;
		}
	}
	Ok(())
}

/// The (0, 1) collapse at a live leaf: delete the necessary run up to the
/// nearest conditional ancestor and merge it with its sibling branch. Reaching
/// the root instead proves infeasibility for this power.
fn collapse_leaf(tree: &mut Tree, side: usize, pow: u64) -> Result<(), Failure> {
	let mut cur = tree.leaves[side].take().expect("collapse at a dead leaf");
	while tree.kind(cur) == NodeKind::Necessary {
		debug_assert_eq!(tree.node(cur).successors, [None, None]);
		let parent = tree.predecessor(cur).expect("necessary node without parent");
		tree.remove_subtree(cur);
		cur = parent;
	}
	match tree.kind(cur) {
		NodeKind::Root => {
			trace!(pow, "collapse reached the root");
			Err(Failure::Infeasible { pow })
		}
		NodeKind::Conditional => {
			match tree.sibling(cur) {
				None => {
					// No sibling branch: the failed hypothesis turns into the
					// necessary opposite fixing.
					debug_assert_eq!(tree.node(cur).successors, [None, None]);
					tree.flip_to_necessary(cur);
				}
				Some(twin) => {
					// The sibling encodes the complementary hypothesis; its
					// necessary child holds the opposite of cur's fixing and
					// moves one step toward the root.
					let tsucc = tree.single_successor(twin).expect("branch without consequence");
					debug_assert_eq!(tree.kind(tsucc), NodeKind::Necessary);
					debug_assert_eq!(tree.fixing(tsucc), tree.fixing(cur).flipped());
					tree.remove_subtree(cur);
					tree.promote_over(tsucc, twin);
				}
			}
			Ok(())
		}
		_ => unreachable!("collapse walk stopped at a vacant node"),
	}
}

fn enqueue(fq: &mut FixingQueue, fixing: Fixing, pow: u64) -> Result<(), Failure> {
	match fq.enqueue(fixing, pow) {
		Enqueue::Pushed => {
			trace!(var = fixing.var, value = fixing.value, pow, "surfaced fixing");
			Ok(())
		}
		Enqueue::AlreadyQueued => Ok(()),
		Enqueue::Contradiction { other_pow } => Err(Failure::Contradiction {
			fixing,
			pow,
			other_pow,
		}),
	}
}

/// Drain the fixing queue: apply each fixing (to the host or the overlay) and
/// fold it into every tree, which may surface more fixings. Every touched
/// power is rescheduled since its completeness conditions may have broken.
fn apply_fixings<A: PropagationActions>(
	ctx: &PropCtx,
	forest: &mut Forest,
	fq: &mut FixingQueue,
	nperms: usize,
	fx: &mut Fixings<'_, A>,
	ngen: &mut u32,
) -> Result<(), Failure> {
	while let Some((fixing, pow)) = fq.pop() {
		if fx.set(fixing, Inference::Power(pow))? {
			*ngen += 1;
			trace!(var = fixing.var, value = fixing.value, pow, "applied fixing");
		}
		#[cfg(debug_assertions)]
		if !fx.is_virtual() {
			crate::engine::explain::debug_check_fixing(ctx, fx, fixing, pow);
		}

		for k in 0..nperms {
			let k_pow = forest.pow(k);
			for side in 0..2 {
				let id = Tree::slot(fixing.var, side);
				let tree = forest.tree_mut(k);
				if !tree.occupied(id) {
					continue;
				}
				debug_assert_eq!(tree.fixing(id).var, fixing.var);
				if tree.fixing(id).value == fixing.value {
					// The recorded fixing now holds unconditionally. A sibling
					// branch encoded the complementary hypothesis and dies
					// with it.
					if let Some(twin) = tree.sibling(id) {
						debug_assert_eq!(tree.kind(id), NodeKind::Conditional);
						tree.remove_subtree(twin);
					}
					let parent = tree.splice_out(id);
					if tree.kind(parent) == NodeKind::Root {
						let children = tree.node(parent).successors;
						for child in children.into_iter().flatten() {
							if tree.kind(child) == NodeKind::Necessary {
								let f = tree.fixing(child);
								enqueue(fq, f, k_pow)?;
							}
						}
					}
				} else if tree.kind(id) == NodeKind::Necessary {
					// A necessary node contradicts the applied fixing: the
					// path below its nearest conditional ancestor is dead.
					let mut anc = tree.predecessor(id).expect("necessary node without parent");
					tree.remove_subtree(id);
					while tree.kind(anc) == NodeKind::Necessary {
						anc = tree.predecessor(anc).expect("necessary node without parent");
					}
					match tree.kind(anc) {
						NodeKind::Root => {
							trace!(pow = k_pow, "necessary chain to the root contradicted");
							return Err(Failure::Infeasible { pow: k_pow });
						}
						NodeKind::Conditional => {
							let parent = tree.predecessor(anc).expect("conditional without parent");
							match tree.sibling(anc) {
								None => {
									tree.flip_to_necessary(anc);
									let succs = tree.node(anc).successors;
									for s in succs.into_iter().flatten() {
										tree.remove_subtree(s);
									}
									if tree.kind(parent) == NodeKind::Root {
										let f = tree.fixing(anc);
										enqueue(fq, f, k_pow)?;
									}
								}
								Some(twin) => {
									let tsucc = tree
										.single_successor(twin)
										.expect("branch without consequence");
									debug_assert_eq!(tree.fixing(tsucc), tree.fixing(anc).flipped());
									tree.remove_subtree(anc);
									tree.promote_over(tsucc, twin);
									if tree.kind(parent) == NodeKind::Root {
										let f = tree.fixing(tsucc);
										enqueue(fq, f, k_pow)?;
									}
								}
							}
						}
						_ => unreachable!("ancestor walk left the tree"),
					}
				} else {
					// A conditional hypothesis contradicts the applied fixing:
					// the whole hypothetical subtree dies.
					debug_assert_eq!(tree.kind(id), NodeKind::Conditional);
					tree.remove_subtree(id);
				}
			}
			forest.requeue(k);
		}
	}
	Ok(())
}

/// General orchestrator: one pass over all tracked powers, then the peek
/// driver over every impactful entry that is still free.
pub(crate) fn prop_standard<A: PropagationActions>(
	ctx: &PropCtx,
	scratch: &mut Scratch,
	fx: &mut Fixings<'_, A>,
	find_complete: bool,
) -> Result<u32, Failure> {
	let nvars = ctx.perm.len();
	let mut ngen = 0;
	let peeking = find_complete && !fx.is_virtual();
	let mut impact = peeking.then(|| Impactful::new(nvars));
	complete_fixings(ctx, scratch, 1, None, fx, impact.as_mut(), &mut ngen)?;

	let Some(mut imp) = impact else {
		return Ok(ngen);
	};
	let mut peek_overlay = VirtualFixings::new(nvars);
	let mut tightened = false;
	while let Some(i) = imp.pop() {
		if tightened {
			if ctx.repropagate_between_peeks {
				complete_fixings(ctx, scratch, 1, None, fx, Some(&mut imp), &mut ngen)?;
			}
			tightened = false;
		}
		if fx.get_base(i).is_some() {
			continue;
		}
		// Would the zero fixing make the constraint infeasible?
		peek_overlay.clear();
		let _ = peek_overlay.set(i, false);
		if peek_probe(ctx, scratch, fx, &mut peek_overlay).is_err() {
			tightened = fx.set(Fixing::new(i, true), Inference::Peek)?;
			if tightened {
				ngen += 1;
			}
			continue;
		}
		// And the one fixing?
		peek_overlay.clear();
		let _ = peek_overlay.set(i, true);
		if peek_probe(ctx, scratch, fx, &mut peek_overlay).is_err() {
			tightened = fx.set(Fixing::new(i, false), Inference::Peek)?;
			if tightened {
				ngen += 1;
			}
		}
	}
	Ok(ngen)
}

fn peek_probe<A: PropagationActions>(
	ctx: &PropCtx,
	scratch: &mut Scratch,
	fx: &mut Fixings<'_, A>,
	overlay: &mut VirtualFixings,
) -> Result<(), Failure> {
	let mut scrap = 0;
	let mut pfx = Fixings {
		vars: fx.vars,
		actions: &mut *fx.actions,
		overlay: Some(overlay),
		use_base: fx.use_base,
		checked: fx.checked.as_deref_mut(),
	};
	complete_fixings(ctx, scratch, 1, None, &mut pfx, None, &mut scrap)
}

/// Fast path for monotone, ordered permutations: propagate cycle by cycle,
/// carrying the equality power μ, the smallest power for which the fixings of
/// the cycles handled so far still allow γ^μ(x) = x. Each cycle is handled as
/// a single generator γ^μ restricted to its support.
fn prop_monotone_hotstart<A: PropagationActions>(
	ctx: &PropCtx,
	scratch: &mut Scratch,
	fx: &mut Fixings<'_, A>,
	find_complete: bool,
	mut eq_pow: u64,
	start_cycle: usize,
) -> Result<u32, Failure> {
	let perm = ctx.perm;
	debug_assert!(perm.is_monotone() && perm.is_ordered());
	let mut ngen = 0;
	let peeking = find_complete && !fx.is_virtual();
	let mut impact = peeking.then(|| Impactful::new(perm.len()));
	let order = perm.order();

	for c in start_cycle..perm.num_cycles() {
		// Only the identity is left.
		if eq_pow == order {
			break;
		}
		debug_assert!(eq_pow < order);
		let cycle_len = perm.cycle(c).len();
		// γ^μ restricted to this cycle is the identity.
		if eq_pow % cycle_len as u64 == 0 {
			continue;
		}

		complete_fixings(
			ctx,
			scratch,
			eq_pow,
			Some(perm.cycle(c)),
			fx,
			impact.as_mut(),
			&mut ngen,
		)?;

		if let Some(imp) = impact.as_mut() {
			peek_cycle(ctx, scratch, fx, imp, c, eq_pow, &mut ngen)?;
		}

		// Update μ. While an entry of the cycle is free, any power of the
		// cycle still admits equality breaking later; otherwise the decided
		// values enforce equality exactly up to their smallest shift period.
		let cycle = perm.cycle(c);
		let mut values = Vec::with_capacity(cycle_len);
		let mut unfixed = false;
		for &i in cycle {
			match fx.get(i) {
				None => {
					unfixed = true;
					break;
				}
				Some(v) => values.push(v),
			}
		}
		if unfixed {
			eq_pow = lcm(eq_pow, cycle_len as u64);
		} else {
			let period = (1..cycle_len)
				.find(|&k| (0..cycle_len).all(|i| values[i] == values[(i + k) % cycle_len]))
				.unwrap_or(cycle_len);
			eq_pow = lcm(eq_pow, period as u64);
		}
	}
	Ok(ngen)
}

/// Per-cycle peek. In the current cycle the first unfixed entry of the first
/// half always admits the one fixing, and every other unfixed entry always
/// admits the zero fixing, so only the respective opposite needs probing.
fn peek_cycle<A: PropagationActions>(
	ctx: &PropCtx,
	scratch: &mut Scratch,
	fx: &mut Fixings<'_, A>,
	imp: &mut Impactful,
	c: usize,
	eq_pow: u64,
	ngen: &mut u32,
) -> Result<(), Failure> {
	let cycle = ctx.perm.cycle(c);
	let mut min_unfixed_first_half = None;
	for &i in &cycle[..cycle.len() / 2] {
		if fx.get_unmarked(i).is_none() {
			min_unfixed_first_half = Some(i);
			break;
		}
	}

	let mut peek_overlay = VirtualFixings::new(ctx.perm.len());
	let mut tightened = false;
	while let Some(i) = imp.pop() {
		// The cycle support is sorted, so its extremes bound every entry.
		debug_assert!(cycle[0] <= i && i <= cycle[cycle.len() - 1]);
		if tightened {
			if ctx.repropagate_between_peeks {
				complete_fixings(ctx, scratch, eq_pow, Some(cycle), fx, Some(imp), ngen)?;
			}
			tightened = false;
		}
		if fx.get(i).is_some() {
			continue;
		}
		let probe = min_unfixed_first_half != Some(i);
		match fx.overlay.as_deref() {
			Some(outer) => peek_overlay.copy_from(outer),
			None => peek_overlay.clear(),
		}
		debug_assert!(peek_overlay.get(i).is_none());
		let _ = peek_overlay.set(i, probe);
		let infeasible = {
			let mut pfx = Fixings {
				vars: fx.vars,
				actions: &mut *fx.actions,
				overlay: Some(&mut peek_overlay),
				use_base: fx.use_base,
				checked: fx.checked.as_deref_mut(),
			};
			prop_monotone_hotstart(ctx, scratch, &mut pfx, false, eq_pow, c).is_err()
		};
		if infeasible {
			tightened = fx.set(Fixing::new(i, !probe), Inference::Peek)?;
			if tightened {
				*ngen += 1;
			}
		}
	}
	Ok(())
}
