// This module implements the liveness analysis that feeds the linear-scan allocator. Parameter
// and Result markers are dropped from the statement list because they live in fixed pointer
// registers. Every output of the remaining statements receives a dense logical index in
// instruction order. For each statement the analysis records the logical indices it uses and
// the ones it defines, where a Store defines nothing because its output is only a pointer
// pass-through to the Result. A backward fixed point then propagates live-in sets along the
// data-flow successors of every statement (consumer edges, which include ConditionalJump
// back-edges into earlier loop heads). Stores do not propagate to their successors. The sets
// are bitsets allocated in the session arena. From the live-in sets each value gets an
// interval [def position, last position where it is live-in], clamped so the end is never
// before the start. Values that stay in general-purpose registers (store outputs and split
// views of a parameter) get no vector interval.

//! Liveness analysis and live-interval construction.

use super::error::CompileResult;
use super::ir::{Graph, InstId, OpKind, Value};
use super::session::CompilationSession;
use bumpalo::collections::Vec as BumpVec;
use bumpalo::Bump;

/// Fixed-size bitset over logical value indices, stored in the session arena.
pub struct LiveSet<'arena> {
    words: BumpVec<'arena, u64>,
}

impl<'arena> LiveSet<'arena> {
    fn new_in(bits: usize, arena: &'arena Bump) -> Self {
        let mut words = BumpVec::with_capacity_in(bits.div_ceil(64), arena);
        words.resize(bits.div_ceil(64), 0);
        Self { words }
    }

    fn insert(&mut self, index: usize) -> bool {
        let (word, bit) = (index / 64, 1u64 << (index % 64));
        let changed = self.words[word] & bit == 0;
        self.words[word] |= bit;
        changed
    }

    pub fn contains(&self, index: usize) -> bool {
        self.words[index / 64] & (1u64 << (index % 64)) != 0
    }

    /// `self |= other & !minus`; returns whether any bit was added.
    fn union_minus(&mut self, other: &LiveSet<'_>, minus: Option<&LiveSet<'_>>) -> bool {
        let mut changed = false;
        for (i, word) in self.words.iter_mut().enumerate() {
            let mask = minus.map_or(!0, |m| !m.words[i]);
            let merged = *word | (other.words[i] & mask);
            changed |= merged != *word;
            *word = merged;
        }
        changed
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(w, &bits)| {
            (0..64)
                .filter(move |b| bits & (1u64 << b) != 0)
                .map(move |b| w * 64 + b)
        })
    }
}

/// Dense numbering of every output produced by a statement.
#[derive(Debug, Clone, Default)]
pub struct ValueNumbering {
    /// Logical index of output 0 of each instruction, for statements only.
    first: Vec<Option<usize>>,
    values: Vec<Value>,
}

impl ValueNumbering {
    fn new(graph: &Graph) -> Self {
        let mut first = vec![None; graph.len()];
        let mut values = Vec::new();
        for (id, inst) in graph.iter() {
            if inst.kind.is_boundary() {
                continue;
            }
            first[id] = Some(values.len());
            values.extend(graph.outputs(id));
        }
        Self { first, values }
    }

    /// Logical index of `value`, if its producer is a statement.
    pub fn index(&self, value: Value) -> Option<usize> {
        self.first
            .get(value.producer)
            .copied()
            .flatten()
            .map(|base| base + value.slot as usize)
    }

    pub fn value(&self, index: usize) -> Value {
        self.values[index]
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Program-point range during which a value occupies a vector register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveInterval {
    /// Logical value index.
    pub index: usize,
    pub value: Value,
    /// Statement position of the definition.
    pub start: usize,
    /// Last statement position where the value is live-in.
    pub end: usize,
}

impl LiveInterval {
    pub fn overlaps(&self, other: &LiveInterval) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

/// Liveness facts for one graph.
pub struct Liveness<'arena> {
    numbering: ValueNumbering,
    /// Instruction id at each statement position.
    positions: &'arena [InstId],
    live_in: BumpVec<'arena, LiveSet<'arena>>,
    intervals: Vec<LiveInterval>,
    sweeps: usize,
}

impl<'arena> Liveness<'arena> {
    /// Run the backward fixed point and build intervals.
    pub fn compute(graph: &Graph, session: &CompilationSession<'arena>) -> CompileResult<Self> {
        let arena = session.arena();
        let numbering = ValueNumbering::new(graph);
        let positions = session.alloc_slice(
            &graph
                .iter()
                .filter(|(_, inst)| !inst.kind.is_boundary())
                .map(|(id, _)| id)
                .collect::<Vec<InstId>>(),
        );
        let mut position_of = vec![None; graph.len()];
        for (pos, &id) in positions.iter().enumerate() {
            position_of[id] = Some(pos);
        }

        let n = positions.len();
        let bits = numbering.len().max(1);
        let new_sets = || {
            let mut sets = BumpVec::with_capacity_in(n, arena);
            for _ in 0..n {
                sets.push(LiveSet::new_in(bits, arena));
            }
            sets
        };
        let mut used = new_sets();
        let mut def = new_sets();
        let mut live_in = new_sets();
        let mut live_out = new_sets();

        for (pos, &id) in positions.iter().enumerate() {
            let inst = graph.inst(id);
            for &input in &inst.inputs {
                if let Some(index) = numbering.index(input) {
                    used[pos].insert(index);
                }
            }
            if !inst.kind.is_store() {
                for output in graph.outputs(id) {
                    if let Some(index) = numbering.index(output) {
                        def[pos].insert(index);
                    }
                }
            }
        }

        let successors: Vec<Vec<usize>> = positions
            .iter()
            .map(|&id| {
                if graph.inst(id).kind.is_store() {
                    return Vec::new();
                }
                graph
                    .successors(id)
                    .filter_map(|succ| position_of[succ])
                    .collect()
            })
            .collect();

        let mut sweeps = 0;
        for _ in 0..n {
            sweeps += 1;
            let mut changed = false;
            for pos in 0..n {
                changed |= live_in[pos].union_minus(&used[pos], None);
                changed |= live_in[pos].union_minus(&live_out[pos], Some(&def[pos]));
            }
            for pos in 0..n {
                for &succ in &successors[pos] {
                    changed |= live_out[pos].union_minus(&live_in[succ], None);
                }
            }
            log::trace!("liveness sweep {sweeps}: changed={changed}");
            if !changed {
                break;
            }
        }

        let mut last_live = vec![None; numbering.len()];
        for pos in (0..n).rev() {
            for index in live_in[pos].iter() {
                if last_live[index].is_none() {
                    last_live[index] = Some(pos);
                }
            }
        }

        let mut intervals = Vec::new();
        for (pos, &id) in positions.iter().enumerate() {
            if graph.inst(id).kind.is_store() || graph.as_parameter(id).is_some() {
                continue;
            }
            for output in graph.outputs(id) {
                let Some(index) = numbering.index(output) else {
                    continue;
                };
                let end = last_live[index].map_or(pos, |last| last.max(pos));
                log::trace!("interval v{index} ({output:?}): [{pos}, {end}]");
                intervals.push(LiveInterval {
                    index,
                    value: output,
                    start: pos,
                    end,
                });
            }
        }

        log::debug!(
            "liveness: {} statements, {} values, {} intervals, {} sweeps",
            n,
            numbering.len(),
            intervals.len(),
            sweeps
        );

        Ok(Self {
            numbering,
            positions,
            live_in,
            intervals,
            sweeps,
        })
    }

    pub fn numbering(&self) -> &ValueNumbering {
        &self.numbering
    }

    pub fn intervals(&self) -> &[LiveInterval] {
        &self.intervals
    }

    pub fn positions(&self) -> &[InstId] {
        self.positions
    }

    pub fn sweeps(&self) -> usize {
        self.sweeps
    }

    /// Whether logical value `index` is live on entry to statement `pos`.
    pub fn is_live_in(&self, pos: usize, index: usize) -> bool {
        self.live_in[pos].contains(index)
    }

    /// Largest number of intervals covering one position.
    pub fn max_pressure(&self) -> usize {
        (0..self.positions.len())
            .map(|pos| {
                self.intervals
                    .iter()
                    .filter(|i| i.start <= pos && pos <= i.end)
                    .count()
            })
            .max()
            .unwrap_or(0)
    }
}

/// Whether `kind` produces a value that stays in a general-purpose register.
pub fn is_pointer_producer(graph: &Graph, id: InstId) -> bool {
    matches!(
        graph.inst(id).kind,
        OpKind::Store { .. } | OpKind::ScalarStore { .. } | OpKind::Parameter
    ) || graph.as_parameter(id).is_some()
}
