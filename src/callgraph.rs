use std::collections::{BTreeMap, BTreeSet, VecDeque};

use tracing::debug;

use crate::hierarchy::{MethodId, ProgramIndex};
use crate::ir::{BlockId, Instruction, InvokeKind, Program};

/// Position of an invoke instruction inside its method.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub(crate) struct InvokeSite {
    pub(crate) block: BlockId,
    pub(crate) index: usize,
}

/// How virtual call sites are linked.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub(crate) enum CallGraphMode {
    /// Link only when the site has exactly one possible target.
    #[default]
    SingleCallee,
    /// Link to every concrete override the site may dispatch to.
    MultipleCallee,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub(crate) struct CallGraphOptions {
    pub(crate) mode: CallGraphMode,
    pub(crate) keep_methods_are_entries: bool,
}

/// Directed call edge; `caller == None` is the synthetic entry node.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub(crate) struct CallEdge {
    pub(crate) caller: Option<MethodId>,
    pub(crate) callee: MethodId,
    pub(crate) site: Option<InvokeSite>,
}

/// Call graph over the methods of one program.
#[derive(Clone, Debug, Default)]
pub(crate) struct CallGraph {
    mode: CallGraphMode,
    edges: Vec<CallEdge>,
    incoming: BTreeMap<MethodId, Vec<usize>>,
    callees: BTreeMap<(MethodId, InvokeSite), Vec<MethodId>>,
}

impl CallGraph {
    pub(crate) fn mode(&self) -> CallGraphMode {
        self.mode
    }

    pub(crate) fn edges(&self) -> &[CallEdge] {
        &self.edges
    }

    /// Edges entering `callee`, including the synthetic entry edge if any.
    pub(crate) fn incoming(&self, callee: MethodId) -> impl Iterator<Item = &CallEdge> + '_ {
        self.incoming
            .get(&callee)
            .into_iter()
            .flatten()
            .map(|edge| &self.edges[*edge])
    }

    /// Linked targets of one invoke; empty when the site was left unresolved.
    pub(crate) fn callees(&self, caller: MethodId, site: InvokeSite) -> &[MethodId] {
        self.callees
            .get(&(caller, site))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub(crate) fn is_entry(&self, method: MethodId) -> bool {
        self.incoming(method).any(|edge| edge.caller.is_none())
    }

    /// Methods reachable from the synthetic entry.
    pub(crate) fn reachable(&self) -> BTreeSet<MethodId> {
        let mut outgoing: BTreeMap<Option<MethodId>, Vec<MethodId>> = BTreeMap::new();
        for edge in &self.edges {
            outgoing.entry(edge.caller).or_default().push(edge.callee);
        }
        let mut reachable = BTreeSet::new();
        let mut queue: VecDeque<MethodId> = outgoing
            .get(&None)
            .into_iter()
            .flatten()
            .copied()
            .collect();
        while let Some(method) = queue.pop_front() {
            if reachable.insert(method) {
                queue.extend(outgoing.get(&Some(method)).into_iter().flatten().copied());
            }
        }
        reachable
    }

    fn add_edge(&mut self, edge: CallEdge) {
        self.incoming
            .entry(edge.callee)
            .or_default()
            .push(self.edges.len());
        if let (Some(caller), Some(site)) = (edge.caller, edge.site) {
            self.callees
                .entry((caller, site))
                .or_default()
                .push(edge.callee);
        }
        self.edges.push(edge);
    }
}

/// Build the call graph by resolving every invoke against the hierarchy.
pub(crate) fn build_call_graph(
    program: &Program,
    index: &ProgramIndex,
    options: CallGraphOptions,
) -> CallGraph {
    let mut graph = CallGraph {
        mode: options.mode,
        ..CallGraph::default()
    };
    let mut roots = BTreeSet::new();
    for method in index.method_ids() {
        let info = index.method(method);
        let keep = info.keep || index.class(info.class).keep;
        if info.is_clinit()
            || index.overrides_external(method)
            || (options.keep_methods_are_entries && keep)
        {
            roots.insert(method);
        }
    }

    for caller in index.method_ids() {
        let Some(cfg) = index.code(program, caller) else {
            continue;
        };
        for block in &cfg.blocks {
            for (position, instruction) in block.instructions.iter().enumerate() {
                let Instruction::Invoke { kind, method, .. } = instruction else {
                    continue;
                };
                let site = InvokeSite {
                    block: block.id,
                    index: position,
                };
                let Some(resolved) = index.resolve_method(method, *kind) else {
                    debug!("unresolved invoke {} in {}", method, index.method_label(caller));
                    continue;
                };
                let targets = dispatch_targets(index, resolved, *kind);
                let linked = match options.mode {
                    CallGraphMode::MultipleCallee => true,
                    CallGraphMode::SingleCallee => targets.len() == 1,
                };
                if linked {
                    for callee in targets {
                        graph.add_edge(CallEdge {
                            caller: Some(caller),
                            callee,
                            site: Some(site),
                        });
                    }
                } else {
                    // Nothing tracks the arguments of an unlinked site, so its
                    // targets must start from unknown arguments.
                    roots.extend(targets);
                }
            }
        }
    }

    for root in roots {
        graph.add_edge(CallEdge {
            caller: None,
            callee: root,
            site: None,
        });
    }
    graph
}

/// Concrete methods an invoke resolved to `resolved` may execute.
pub(crate) fn dispatch_targets(
    index: &ProgramIndex,
    resolved: MethodId,
    kind: InvokeKind,
) -> Vec<MethodId> {
    let dispatches = matches!(kind, InvokeKind::Virtual | InvokeKind::Interface)
        && index.method(resolved).is_virtual();
    let mut targets = vec![resolved];
    if dispatches {
        targets.extend(index.overrides(resolved).iter().copied());
    }
    targets.retain(|method| !index.method(*method).is_abstract);
    targets
}
