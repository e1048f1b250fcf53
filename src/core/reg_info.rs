// This module writes the register-info record of every instruction once linear scan has
// produced a physical register per logical value. Result markers carry nothing. Parameters,
// and splits whose source is a Parameter, carry the parameter's index: a general-purpose
// pointer register. A Store carries the index of the Result it feeds plus the number of
// parameters, so output pointers follow the input pointers. Everything else carries the
// allocated vector register of each output. Input registers are never stored; they are
// looked up from the producer's record, where a single-entry producer (a split view)
// serves every slot. After propagation the alias fix-up makes each broadcast-move <- load
// <- memory chain share one vector register, moving a chain to the lowest register no
// record uses whenever the shared register would clash with another live value or with a
// sibling input of a multi-input instruction.

//! Register-info propagation and alias-chain fix-up.

use super::analyzer::{is_pointer_producer, Liveness};
use super::config::GeneratorConfig;
use super::error::{CompileError, CompileResult};
use super::ir::{Graph, InstId, OpKind, Value};
use super::linear_scan::{self, Allocation};
use super::register_file::{AsmReg, RegBitSet, RegId, VEC_BANK};
use super::session::CompilationSession;
use hashbrown::HashMap;

/// Input and output registers of one instruction, as handed to its emitter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegInfo {
    pub inputs: Vec<usize>,
    pub outputs: Vec<usize>,
}

/// Run liveness, linear scan, propagation and alias fix-up on `graph`.
pub fn assign_registers(
    graph: &mut Graph,
    session: &CompilationSession<'_>,
    config: &GeneratorConfig,
) -> CompileResult<()> {
    let liveness = Liveness::compute(graph, session)?;
    let allocation = linear_scan::allocate(liveness.intervals(), config.bank_size)?;
    session.record_allocation(liveness.intervals().len(), allocation.registers_used());

    propagate(graph, &liveness, &allocation)?;

    let unified = unify_alias_chains(graph, &liveness, config.bank_size)?;
    let moved = resolve_alias_collisions(graph, config.bank_size)?;
    for _ in 0..unified + moved {
        session.record_alias_fixup();
    }
    Ok(())
}

/// Write the register-info record of every instruction.
pub fn propagate(
    graph: &mut Graph,
    liveness: &Liveness<'_>,
    allocation: &Allocation,
) -> CompileResult<()> {
    let parameters: HashMap<InstId, usize> = graph
        .parameters()
        .into_iter()
        .enumerate()
        .map(|(index, id)| (id, index))
        .collect();
    let results: HashMap<InstId, usize> = graph
        .results()
        .into_iter()
        .enumerate()
        .map(|(index, id)| (id, index))
        .collect();
    let num_parameters = parameters.len();

    for id in 0..graph.len() {
        let kind = &graph.inst(id).kind;
        let regs = if matches!(kind, OpKind::Result) {
            continue;
        } else if let Some(param) = graph.as_parameter(id) {
            vec![parameters[&param]]
        } else if kind.is_store() {
            let result = graph
                .consumers(Value::new(id, 0))
                .iter()
                .find_map(|u| results.get(&u.inst))
                .ok_or_else(|| {
                    CompileError::malformed(format!("store {id} does not feed a result"))
                })?;
            vec![result + num_parameters]
        } else {
            graph
                .outputs(id)
                .map(|value| {
                    liveness
                        .numbering()
                        .index(value)
                        .and_then(|index| allocation.register(index))
                        .map(|reg| reg as usize)
                        .ok_or(CompileError::MissingRegInfo { inst: id })
                })
                .collect::<CompileResult<Vec<_>>>()?
        };
        log::trace!("reginfo {} {}: {:?}", id, graph.inst(id).kind.name(), regs);
        graph.inst_mut(id).reg_info = Some(regs);
    }
    Ok(())
}

/// Register holding `value`, read from its producer's record.
pub fn value_register(graph: &Graph, value: Value) -> CompileResult<usize> {
    let regs = graph
        .producer(value)
        .reg_info
        .as_ref()
        .ok_or(CompileError::MissingRegInfo {
            inst: value.producer,
        })?;
    match (regs.get(value.slot as usize), regs.as_slice()) {
        (Some(&reg), _) => Ok(reg),
        (None, &[reg]) => Ok(reg),
        _ => Err(CompileError::MissingRegInfo {
            inst: value.producer,
        }),
    }
}

/// Input and output registers of `id`.
pub fn reg_info_of(graph: &Graph, id: InstId) -> CompileResult<RegInfo> {
    let inst = graph.inst(id);
    let outputs = match inst.kind {
        OpKind::Result => Vec::new(),
        _ => inst
            .reg_info
            .clone()
            .ok_or(CompileError::MissingRegInfo { inst: id })?,
    };
    let inputs = inst
        .inputs
        .iter()
        .map(|&value| value_register(graph, value))
        .collect::<CompileResult<Vec<_>>>()?;
    Ok(RegInfo { inputs, outputs })
}

/// Vector registers referenced by any register-info record.
fn used_vector_registers(graph: &Graph) -> RegBitSet {
    let mut used = RegBitSet::new();
    for (id, inst) in graph.iter() {
        if is_pointer_producer(graph, id) {
            continue;
        }
        for &reg in inst.reg_info.iter().flatten() {
            used.set(AsmReg::new(VEC_BANK, reg as RegId));
        }
    }
    used
}

/// Vector registers below `bank_size` that no record references.
pub fn unused_vector_registers(graph: &Graph, bank_size: usize) -> Vec<RegId> {
    used_vector_registers(graph).clear_in_bank(VEC_BANK, bank_size)
}

fn fresh_register(graph: &Graph, bank_size: usize) -> CompileResult<usize> {
    used_vector_registers(graph)
        .first_clear_in_bank(VEC_BANK, bank_size)
        .map(|reg| reg as usize)
        .ok_or(CompileError::FreeRegisterPoolExhausted { pool: bank_size })
}

fn require_single_output(graph: &Graph, id: InstId) -> CompileResult<()> {
    let found = graph.inst(id).num_outputs as usize;
    if found != 1 {
        return Err(CompileError::UnexpectedOutputArity {
            inst: id,
            expected: 1,
            found,
        });
    }
    Ok(())
}

/// Links of the alias chain ending at `id`, tail first.
///
/// A chain is one or more broadcast moves ending in a vector load whose
/// pointer comes from a split or a parameter. Every link but the tail must
/// be used by the next link only, since the broadcast overwrites it in place.
pub fn alias_chain(graph: &Graph, id: InstId) -> CompileResult<Option<Vec<InstId>>> {
    if !matches!(graph.inst(id).kind, OpKind::BroadcastMove) {
        return Ok(None);
    }
    let mut links = Vec::new();
    let mut current = id;
    loop {
        let inst = graph.inst(current);
        match inst.kind {
            OpKind::BroadcastMove => {
                require_single_output(graph, current)?;
                links.push(current);
                let Some(&input) = inst.inputs.first() else {
                    return Ok(None);
                };
                if graph.consumers(input).len() != 1 {
                    return Ok(None);
                }
                current = input.producer;
            }
            OpKind::Load { .. } | OpKind::ScalarLoad { .. } => {
                require_single_output(graph, current)?;
                let from_memory = inst.inputs.first().is_some_and(|ptr| {
                    matches!(
                        graph.inst(ptr.producer).kind,
                        OpKind::Split | OpKind::Parameter
                    )
                });
                if !from_memory {
                    return Ok(None);
                }
                links.push(current);
                return Ok(Some(links));
            }
            _ => return Ok(None),
        }
    }
}

fn set_chain_register(graph: &mut Graph, chain: &[InstId], reg: usize) {
    for &link in chain {
        graph.inst_mut(link).reg_info = Some(vec![reg]);
    }
}

/// Give every alias chain one register, moving it when the tail's register
/// is held by another value while any link of the chain is live.
pub fn unify_alias_chains(
    graph: &mut Graph,
    liveness: &Liveness<'_>,
    bank_size: usize,
) -> CompileResult<usize> {
    let mut moved = 0;
    for id in 0..graph.len() {
        if graph.inst(id).num_outputs != 1 {
            continue;
        }
        // inner links are covered by the chain of their tail
        let inner_link = match graph.consumers(Value::new(id, 0)) {
            [only] => matches!(graph.inst(only.inst).kind, OpKind::BroadcastMove),
            _ => false,
        };
        if inner_link {
            continue;
        }
        let Some(chain) = alias_chain(graph, id)? else {
            continue;
        };
        let target = value_register(graph, Value::new(id, 0))?;

        let mut span: Option<(usize, usize)> = None;
        for &link in &chain {
            let interval = liveness
                .intervals()
                .iter()
                .find(|i| i.value == Value::new(link, 0))
                .ok_or(CompileError::MissingRegInfo { inst: link })?;
            span = Some(match span {
                Some((start, end)) => (start.min(interval.start), end.max(interval.end)),
                None => (interval.start, interval.end),
            });
        }
        let Some((span_start, span_end)) = span else {
            continue;
        };

        let mut clash = false;
        for other in liveness.intervals() {
            if chain.contains(&other.value.producer) {
                continue;
            }
            if other.start <= span_end
                && span_start <= other.end
                && value_register(graph, other.value)? == target
            {
                clash = true;
                break;
            }
        }

        let reg = if clash {
            moved += 1;
            fresh_register(graph, bank_size)?
        } else {
            target
        };
        log::debug!("alias chain {:?} -> r{} (clash: {})", chain, reg, clash);
        set_chain_register(graph, &chain, reg);
    }
    Ok(moved)
}

/// Split alias chains that collide on a register among the inputs of one
/// multi-input instruction.
pub fn resolve_alias_collisions(graph: &mut Graph, bank_size: usize) -> CompileResult<usize> {
    let mut moved = 0;
    for id in 0..graph.len() {
        let inputs = graph.inst(id).inputs.clone();
        if inputs.len() < 2 || is_pointer_producer(graph, id) {
            continue;
        }
        for j in 1..inputs.len() {
            for i in 0..j {
                let (a, b) = (inputs[i], inputs[j]);
                if a == b
                    || is_pointer_producer(graph, a.producer)
                    || is_pointer_producer(graph, b.producer)
                    || value_register(graph, a)? != value_register(graph, b)?
                {
                    continue;
                }
                let chain = match alias_chain(graph, b.producer)? {
                    Some(chain) => chain,
                    None => match alias_chain(graph, a.producer)? {
                        Some(chain) => chain,
                        None => {
                            log::debug!(
                                "inputs {:?} and {:?} of {} share a register outside any alias chain",
                                a,
                                b,
                                id
                            );
                            continue;
                        }
                    },
                };
                let reg = fresh_register(graph, bank_size)?;
                log::debug!("alias collision at {}: chain {:?} -> r{}", id, chain, reg);
                set_chain_register(graph, &chain, reg);
                moved += 1;
            }
        }
    }
    Ok(moved)
}
