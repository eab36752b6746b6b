use std::collections::{BTreeMap, BTreeSet};

use crate::error::{CpError, malformed_ir};
use crate::ir::{
    BasicBlock, BlockId, ControlFlowGraph, EdgeKind, FlowEdge, Instruction, Method, Program,
    Reg, ValueKind,
};

/// Registers at or above this bound are reserved for analysis pseudo registers.
pub(crate) const MAX_PROGRAM_REGISTERS: u32 = 1 << 16;

/// CFG lookup tables used by the fixpoint loops and the rewriters.
///
/// Blocks are addressed by their position in `ControlFlowGraph::blocks` and
/// edges by their position in `ControlFlowGraph::edges`, so per-block and
/// per-edge state can live in plain vectors.
pub(crate) struct MethodGraph<'a> {
    cfg: &'a ControlFlowGraph,
    positions: BTreeMap<BlockId, usize>,
    out_edges: Vec<Vec<usize>>,
    in_edges: Vec<Vec<usize>>,
}

impl<'a> MethodGraph<'a> {
    pub(crate) fn new(cfg: &'a ControlFlowGraph) -> Result<Self, CpError> {
        let mut positions = BTreeMap::new();
        for (position, block) in cfg.blocks.iter().enumerate() {
            if positions.insert(block.id, position).is_some() {
                return Err(malformed_ir!("duplicate block id {}", block.id));
            }
        }
        let mut out_edges = vec![Vec::new(); cfg.blocks.len()];
        let mut in_edges = vec![Vec::new(); cfg.blocks.len()];
        for (index, edge) in cfg.edges.iter().enumerate() {
            let from = *positions
                .get(&edge.from)
                .ok_or_else(|| malformed_ir!("edge source block {} does not exist", edge.from))?;
            let to = *positions
                .get(&edge.to)
                .ok_or_else(|| malformed_ir!("edge target block {} does not exist", edge.to))?;
            out_edges[from].push(index);
            in_edges[to].push(index);
        }
        if !positions.contains_key(&cfg.entry) {
            return Err(malformed_ir!("entry block {} does not exist", cfg.entry));
        }
        if let Some(exit) = cfg.exit {
            if !positions.contains_key(&exit) {
                return Err(malformed_ir!("exit block {} does not exist", exit));
            }
        }
        Ok(Self {
            cfg,
            positions,
            out_edges,
            in_edges,
        })
    }

    pub(crate) fn cfg(&self) -> &'a ControlFlowGraph {
        self.cfg
    }

    pub(crate) fn block_count(&self) -> usize {
        self.cfg.blocks.len()
    }

    pub(crate) fn block(&self, position: usize) -> &'a BasicBlock {
        &self.cfg.blocks[position]
    }

    pub(crate) fn position(&self, id: BlockId) -> Option<usize> {
        self.positions.get(&id).copied()
    }

    pub(crate) fn entry_position(&self) -> usize {
        self.positions[&self.cfg.entry]
    }

    pub(crate) fn edge(&self, index: usize) -> &'a FlowEdge {
        &self.cfg.edges[index]
    }

    pub(crate) fn edge_count(&self) -> usize {
        self.cfg.edges.len()
    }

    pub(crate) fn out_edges(&self, position: usize) -> &[usize] {
        &self.out_edges[position]
    }

    pub(crate) fn in_edges(&self, position: usize) -> &[usize] {
        &self.in_edges[position]
    }

    pub(crate) fn edge_target(&self, index: usize) -> usize {
        self.positions[&self.cfg.edges[index].to]
    }

    /// Block positions in post-order from the entry; unreachable blocks are appended
    /// afterwards in id order so every block has a deterministic slot.
    pub(crate) fn post_order(&self) -> Vec<usize> {
        let mut visited = vec![false; self.block_count()];
        let mut order = Vec::with_capacity(self.block_count());
        let entry = self.entry_position();
        let mut stack = vec![(entry, 0usize)];
        visited[entry] = true;
        while let Some((position, next_edge)) = stack.pop() {
            let edges = &self.out_edges[position];
            if next_edge < edges.len() {
                stack.push((position, next_edge + 1));
                let target = self.edge_target(edges[next_edge]);
                if !visited[target] {
                    visited[target] = true;
                    stack.push((target, 0));
                }
            } else {
                order.push(position);
            }
        }
        let mut unreachable: Vec<usize> = (0..self.block_count())
            .filter(|position| !visited[*position])
            .collect();
        unreachable.sort_by_key(|position| self.cfg.blocks[*position].id);
        // Unreachable blocks go first so that popping from the back still visits
        // the entry first.
        unreachable.extend(order);
        unreachable
    }
}

impl ControlFlowGraph {
    /// Reserve a fresh narrow register past the current frame.
    pub(crate) fn allocate_temp(&mut self) -> Reg {
        let reg = self.registers_size;
        self.registers_size += 1;
        reg
    }

    pub(crate) fn next_block_id(&self) -> BlockId {
        self.blocks
            .iter()
            .map(|block| block.id + 1)
            .max()
            .unwrap_or(0)
    }

    pub(crate) fn block(&self, id: BlockId) -> Option<&BasicBlock> {
        self.blocks.iter().find(|block| block.id == id)
    }

    pub(crate) fn block_mut(&mut self, id: BlockId) -> Option<&mut BasicBlock> {
        self.blocks.iter_mut().find(|block| block.id == id)
    }

    pub(crate) fn add_block(&mut self, instructions: Vec<Instruction>) -> BlockId {
        let id = self.next_block_id();
        self.blocks.push(BasicBlock { id, instructions });
        id
    }

    pub(crate) fn add_edge(&mut self, from: BlockId, to: BlockId, kind: EdgeKind) {
        self.edges.push(FlowEdge { from, to, kind });
    }

    pub(crate) fn remove_blocks(&mut self, ids: &BTreeSet<BlockId>) {
        self.blocks.retain(|block| !ids.contains(&block.id));
        self.edges
            .retain(|edge| !ids.contains(&edge.from) && !ids.contains(&edge.to));
    }

    /// Split `id` before instruction `at`. The tail moves to a new block that
    /// inherits the normal out-edges; exception edges are copied to both halves.
    pub(crate) fn split_block(&mut self, id: BlockId, at: usize) -> Result<BlockId, CpError> {
        let new_id = self.next_block_id();
        let block = self
            .block_mut(id)
            .ok_or_else(|| malformed_ir!("cannot split missing block {}", id))?;
        if at > block.instructions.len() {
            return Err(malformed_ir!(
                "split index {} past end of block {}",
                at,
                id
            ));
        }
        let tail = block.instructions.split_off(at);
        self.blocks.push(BasicBlock {
            id: new_id,
            instructions: tail,
        });
        let mut copied = Vec::new();
        for edge in &mut self.edges {
            if edge.from != id {
                continue;
            }
            if edge.kind == EdgeKind::Throw {
                copied.push(FlowEdge {
                    from: new_id,
                    to: edge.to,
                    kind: EdgeKind::Throw,
                });
            } else {
                edge.from = new_id;
            }
        }
        self.edges.extend(copied);
        self.edges.push(FlowEdge {
            from: id,
            to: new_id,
            kind: EdgeKind::Goto,
        });
        Ok(new_id)
    }
}

/// Check the shape rules the analysis relies on, for every method body in the program.
pub(crate) fn validate_program(program: &Program) -> Result<(), CpError> {
    for class in &program.classes {
        for method in &class.methods {
            validate_method(method).map_err(|error| match error {
                CpError::MalformedIr {
                    message,
                    file,
                    line,
                } => CpError::MalformedIr {
                    message: format!("{}.{}{}: {}", class.name, method.name, method.descriptor, message),
                    file,
                    line,
                },
                other => other,
            })?;
        }
    }
    Ok(())
}

pub(crate) fn validate_method(method: &Method) -> Result<(), CpError> {
    let Some(cfg) = &method.code else {
        return Ok(());
    };
    let graph = MethodGraph::new(cfg)?;
    if cfg.registers_size > MAX_PROGRAM_REGISTERS {
        return Err(malformed_ir!(
            "register frame of {} exceeds the 16-bit register space",
            cfg.registers_size
        ));
    }
    for (position, block) in cfg.blocks.iter().enumerate() {
        let is_entry = block.id == cfg.entry;
        let mut params_done = !is_entry;
        for (index, instruction) in block.instructions.iter().enumerate() {
            check_registers(cfg, block.id, index, instruction)?;
            match instruction {
                Instruction::LoadParam { .. } => {
                    if params_done {
                        return Err(malformed_ir!(
                            "load-param outside the entry prologue in block {} at {}",
                            block.id,
                            index
                        ));
                    }
                }
                Instruction::MoveResult { .. } => {
                    params_done = true;
                    let producer = index.checked_sub(1).map(|i| &block.instructions[i]);
                    if !matches!(producer, Some(Instruction::Invoke { .. })) {
                        return Err(malformed_ir!(
                            "move-result in block {} at {} does not follow an invoke",
                            block.id,
                            index
                        ));
                    }
                }
                Instruction::MoveResultPseudo { .. } => {
                    params_done = true;
                    let producer = index.checked_sub(1).map(|i| &block.instructions[i]);
                    if !producer.is_some_and(Instruction::has_move_result_pseudo) {
                        return Err(malformed_ir!(
                            "move-result-pseudo in block {} at {} has no producer",
                            block.id,
                            index
                        ));
                    }
                }
                _ => params_done = true,
            }
            let is_last = index + 1 == block.instructions.len();
            let ends_block = instruction.is_conditional_branch()
                || instruction.is_return()
                || matches!(instruction, Instruction::Throw { .. });
            if ends_block && !is_last {
                return Err(malformed_ir!(
                    "terminator in block {} at {} is not the last instruction",
                    block.id,
                    index
                ));
            }
            if let Instruction::Binop { op, dest, .. } | Instruction::BinopLit { op, dest, .. } =
                instruction
            {
                if dest.is_none() && !op.is_div_rem() {
                    return Err(malformed_ir!(
                        "arithmetic in block {} at {} has no destination",
                        block.id,
                        index
                    ));
                }
            }
        }
        check_terminator_edges(&graph, position)?;
    }
    Ok(())
}

fn check_registers(
    cfg: &ControlFlowGraph,
    block: BlockId,
    index: usize,
    instruction: &Instruction,
) -> Result<(), CpError> {
    let mut used = instruction.sources();
    if let Some((dest, kind)) = instruction.dest() {
        used.push(dest);
        if kind == ValueKind::Wide {
            used.push(dest + 1);
        }
    }
    for reg in used {
        if reg >= cfg.registers_size {
            return Err(malformed_ir!(
                "register v{} out of frame ({} registers) in block {} at {}",
                reg,
                cfg.registers_size,
                block,
                index
            ));
        }
    }
    Ok(())
}

fn check_terminator_edges(graph: &MethodGraph<'_>, position: usize) -> Result<(), CpError> {
    let block = graph.block(position);
    let mut branches = 0;
    let mut gotos = 0;
    for edge in graph.out_edges(position) {
        match graph.edge(*edge).kind {
            EdgeKind::Branch { .. } => branches += 1,
            EdgeKind::Goto => gotos += 1,
            EdgeKind::Throw | EdgeKind::Ghost => {}
        }
    }
    match block.instructions.last() {
        Some(Instruction::If { .. }) => {
            if branches != 1 || gotos != 1 {
                return Err(malformed_ir!(
                    "if in block {} needs one branch and one fall-through edge",
                    block.id
                ));
            }
        }
        Some(Instruction::Switch { .. }) => {
            if gotos > 1 {
                return Err(malformed_ir!(
                    "switch in block {} has more than one default edge",
                    block.id
                ));
            }
        }
        _ => {
            if branches != 0 {
                return Err(malformed_ir!(
                    "block {} has branch edges but no conditional terminator",
                    block.id
                ));
            }
            if gotos > 1 {
                return Err(malformed_ir!(
                    "block {} has more than one goto edge",
                    block.id
                ));
            }
        }
    }
    Ok(())
}
