//! Pointer post-increment selection for loads.
//!
//! Every view of a split shares one pointer register, so only one of the loads
//! reading through a split may advance it: the latest one in emission order.
//! Loads reading a pointer directly always advance it.

use super::ir::{Graph, InstId, OpKind};
use hashbrown::HashMap;

/// Set `post_increment` on every vector load and record ordering hints.
///
/// Returns the number of loads that advance their pointer.
pub fn mark_post_increments(graph: &mut Graph) -> usize {
    let mut by_split: HashMap<InstId, Vec<InstId>> = HashMap::new();
    let mut order = 0;

    for id in 0..graph.len() {
        let inst = graph.inst(id);
        if !matches!(inst.kind, OpKind::Load { .. }) {
            continue;
        }
        let Some(source) = inst.inputs.first().map(|v| v.producer) else {
            continue;
        };
        if matches!(graph.inst(source).kind, OpKind::Split) {
            graph.inst_mut(id).order = Some(order);
            order += 1;
            by_split.entry(source).or_default().push(id);
            set_post_increment(graph, id, false);
        } else {
            set_post_increment(graph, id, true);
        }
    }

    let mut advancing = graph
        .iter()
        .filter(|(_, inst)| {
            matches!(
                inst.kind,
                OpKind::Load {
                    post_increment: true,
                    ..
                }
            )
        })
        .count();

    for (split, loads) in &by_split {
        let latest = loads
            .iter()
            .copied()
            .max_by_key(|&load| graph.inst(load).order);
        if let Some(latest) = latest {
            log::trace!("split {split}: load {latest} advances the pointer");
            set_post_increment(graph, latest, true);
            advancing += 1;
        }
    }
    advancing
}

fn set_post_increment(graph: &mut Graph, id: InstId, value: bool) {
    if let OpKind::Load { post_increment, .. } = &mut graph.inst_mut(id).kind {
        *post_increment = value;
    }
}
