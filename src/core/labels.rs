// This module holds the per-compilation tables the control-flow emitters coordinate through.
// LabelTable maps a loop/label identity to a native jump target and CounterRegisters maps a
// loop identity to the general-purpose register holding its iteration counter. Both are
// slot arenas indexed directly by identity, and every slot carries an explicit state tag.
// A label starts Unbound. A forward jump to it makes it Pending, creating the native label
// early so the jump can be encoded. Binding it at the current position makes it Bound, and
// the back-edge that resolves it makes it Consumed. Binding twice, resolving an identity
// that was never bound and resolving an identity a second time are all fatal. A pending
// label left unbound when emission finishes is reported as never bound. Counter registers
// follow the same life cycle without the Pending state: the loop head allocates one from a
// fixed pool, the back-edge reads it and then releases it back to the pool.

//! Label and counter-register tables used during emission.

use super::error::{CompileError, CompileResult};
use super::ir::ControlId;
use super::register_file::{RegId, RegisterBank};

/// Life-cycle state of one identity slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotState {
    Unbound,
    /// Jumped to before being bound.
    Pending,
    Bound,
    Consumed,
}

#[derive(Debug, Clone)]
struct LabelSlot<L> {
    state: SlotState,
    label: Option<L>,
}

impl<L> Default for LabelSlot<L> {
    fn default() -> Self {
        Self {
            state: SlotState::Unbound,
            label: None,
        }
    }
}

/// Identity to native label, with bind-once semantics.
#[derive(Debug, Clone)]
pub struct LabelTable<L> {
    slots: Vec<LabelSlot<L>>,
    bound: usize,
}

impl<L> Default for LabelTable<L> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            bound: 0,
        }
    }
}

impl<L: Copy> LabelTable<L> {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot_mut(&mut self, id: ControlId) -> &mut LabelSlot<L> {
        let index = id as usize;
        if index >= self.slots.len() {
            self.slots.resize_with(index + 1, LabelSlot::default);
        }
        &mut self.slots[index]
    }

    pub fn state(&self, id: ControlId) -> SlotState {
        self.slots
            .get(id as usize)
            .map_or(SlotState::Unbound, |slot| slot.state)
    }

    /// Bind `id` at the current position.
    ///
    /// Returns the label to place: the one created by an earlier forward jump,
    /// or a new one from `create`.
    pub fn bind(&mut self, id: ControlId, create: impl FnOnce() -> L) -> CompileResult<L> {
        let slot = self.slot_mut(id);
        let label = match (slot.state, slot.label) {
            (SlotState::Pending, Some(label)) => label,
            (SlotState::Unbound, _) => create(),
            _ => return Err(CompileError::LabelAlreadyBound { id }),
        };
        slot.state = SlotState::Bound;
        slot.label = Some(label);
        self.bound += 1;
        log::trace!("label {id} bound");
        Ok(label)
    }

    /// Take the bound label of `id` for a backward jump. The identity is
    /// consumed and cannot be resolved again.
    pub fn resolve(&mut self, id: ControlId) -> CompileResult<L> {
        let slot = self.slot_mut(id);
        match (slot.state, slot.label) {
            (SlotState::Bound, Some(label)) => {
                slot.state = SlotState::Consumed;
                log::trace!("label {id} consumed");
                Ok(label)
            }
            (SlotState::Consumed, _) => Err(CompileError::LabelAlreadyConsumed { id }),
            _ => Err(CompileError::LabelNotBound { id }),
        }
    }

    /// Label for a jump to `id` that may not be bound yet.
    pub fn forward(&mut self, id: ControlId, create: impl FnOnce() -> L) -> CompileResult<L> {
        let slot = self.slot_mut(id);
        match (slot.state, slot.label) {
            (SlotState::Unbound, _) => {
                let label = create();
                slot.state = SlotState::Pending;
                slot.label = Some(label);
                Ok(label)
            }
            (SlotState::Pending, Some(label)) => Ok(label),
            (SlotState::Bound, Some(label)) => {
                slot.state = SlotState::Consumed;
                Ok(label)
            }
            (SlotState::Consumed, _) => Err(CompileError::LabelAlreadyConsumed { id }),
            _ => Err(CompileError::LabelNotBound { id }),
        }
    }

    /// Check that no forward jump is left without a target.
    pub fn finish(&self) -> CompileResult<()> {
        match self
            .slots
            .iter()
            .position(|slot| slot.state == SlotState::Pending)
        {
            Some(id) => Err(CompileError::LabelNotBound { id: id as ControlId }),
            None => Ok(()),
        }
    }

    /// Number of successful binds so far.
    pub fn bound_count(&self) -> usize {
        self.bound
    }

    /// State of every identity that was ever touched, in identity order.
    pub fn snapshot(&self) -> Vec<(ControlId, SlotState)> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.state != SlotState::Unbound)
            .map(|(id, slot)| (id as ControlId, slot.state))
            .collect()
    }
}

/// Loop identity to the general-purpose register holding its counter.
#[derive(Debug, Clone)]
pub struct CounterRegisters {
    slots: Vec<(SlotState, Option<RegId>)>,
    pool: RegisterBank,
}

impl CounterRegisters {
    /// Table drawing counters from `pool`, front first.
    pub fn new(pool: &[RegId]) -> Self {
        Self {
            slots: Vec::new(),
            pool: RegisterBank::from_registers(pool),
        }
    }

    fn slot_mut(&mut self, id: ControlId) -> &mut (SlotState, Option<RegId>) {
        let index = id as usize;
        if index >= self.slots.len() {
            self.slots.resize(index + 1, (SlotState::Unbound, None));
        }
        &mut self.slots[index]
    }

    /// Take a free register for the counter of loop `id`.
    pub fn alloc(&mut self, id: ControlId) -> CompileResult<RegId> {
        if self.state(id) != SlotState::Unbound {
            return Err(CompileError::RegisterAlreadyBound { id });
        }
        let reg = self.pool.acquire()?;
        *self.slot_mut(id) = (SlotState::Bound, Some(reg));
        log::trace!("counter {id} -> gp{reg}");
        Ok(reg)
    }

    pub fn get(&self, id: ControlId) -> CompileResult<RegId> {
        match self.slots.get(id as usize) {
            Some(&(SlotState::Bound, Some(reg))) => Ok(reg),
            _ => Err(CompileError::RegisterNotBound { id }),
        }
    }

    /// Retire the counter of loop `id` and return its register to the pool.
    pub fn release(&mut self, id: ControlId) -> CompileResult<()> {
        let reg = self.get(id)?;
        self.slot_mut(id).0 = SlotState::Consumed;
        self.pool.release(reg);
        Ok(())
    }

    pub fn state(&self, id: ControlId) -> SlotState {
        self.slots
            .get(id as usize)
            .map_or(SlotState::Unbound, |slot| slot.0)
    }

    pub fn free_count(&self) -> usize {
        self.pool.free_count()
    }
}
