use std::collections::BTreeSet;

use tracing::debug;

use crate::cfg::MethodGraph;
use crate::dataflow::worklist::{BlockOutcome, FixpointSemantics, solve};
use crate::error::CpError;
use crate::hierarchy::{ClassId, FieldId, MethodId, ProgramIndex};
use crate::ir::{BasicBlock, ControlFlowGraph, Instruction, Program, Reg, ValueKind};

const OBJECT_CLASS: &str = "java/lang/Object";

/// What a constructor has done to `this` on every path reaching a point.
#[derive(Clone, Debug, Eq, PartialEq)]
struct InitFacts {
    /// Registers that may hold `this`.
    may_this: BTreeSet<Reg>,
    /// Registers that hold `this` on every path.
    must_this: BTreeSet<Reg>,
    /// Own fields assigned on every path.
    assigned: BTreeSet<FieldId>,
    /// Own fields somebody may have observed before their assignment.
    exposed: BTreeSet<FieldId>,
}

impl InitFacts {
    fn join(&self, other: &Self) -> Self {
        Self {
            may_this: self.may_this.union(&other.may_this).copied().collect(),
            must_this: self.must_this.intersection(&other.must_this).copied().collect(),
            assigned: self.assigned.intersection(&other.assigned).copied().collect(),
            exposed: self.exposed.union(&other.exposed).copied().collect(),
        }
    }

    fn forget(&mut self, reg: Reg, kind: ValueKind) {
        self.may_this.remove(&reg);
        self.must_this.remove(&reg);
        if kind == ValueKind::Wide {
            self.may_this.remove(&(reg + 1));
            self.must_this.remove(&(reg + 1));
        }
    }
}

/// Syntactic escape analysis of one `<init>`. It never consults constant
/// values, so its verdict is the same in every round.
struct InitSemantics<'a> {
    index: &'a ProgramIndex,
    class: ClassId,
    this_reg: Reg,
}

impl InitSemantics<'_> {
    fn own_field(&self, reference: &crate::ir::FieldRef) -> Option<FieldId> {
        self.index
            .resolve_field(reference)
            .filter(|field| {
                let info = self.index.field(*field);
                info.class == self.class && !info.is_static
            })
    }

    fn escape(&self, facts: &mut InitFacts) {
        for field in &self.index.class(self.class).fields {
            if !self.index.field(*field).is_static && !facts.assigned.contains(field) {
                facts.exposed.insert(*field);
            }
        }
    }

    fn step(&self, instruction: &Instruction, facts: &mut InitFacts) {
        match instruction {
            Instruction::Move { dest, src, kind } => {
                let may = facts.may_this.contains(src);
                let must = facts.must_this.contains(src);
                facts.forget(*dest, *kind);
                if may {
                    facts.may_this.insert(*dest);
                }
                if must {
                    facts.must_this.insert(*dest);
                }
            }
            Instruction::Iput {
                src, object, field, ..
            } => {
                if facts.may_this.contains(src) {
                    self.escape(facts);
                }
                if facts.must_this.contains(object) {
                    if let Some(field) = self.own_field(field) {
                        facts.assigned.insert(field);
                    }
                }
            }
            Instruction::Iget { object, field, .. } => {
                if facts.may_this.contains(object) {
                    if let Some(field) = self.own_field(field) {
                        if !facts.assigned.contains(&field) {
                            facts.exposed.insert(field);
                        }
                    }
                }
            }
            Instruction::Invoke { method, args, .. } => {
                let passes_this = args.iter().any(|arg| facts.may_this.contains(arg));
                let trivial_base = method.owner == OBJECT_CLASS && method.name == "<init>";
                if passes_this && !trivial_base {
                    self.escape(facts);
                }
            }
            Instruction::Sput { src, .. }
            | Instruction::Aput { src, .. }
            | Instruction::Return { src, .. }
            | Instruction::Throw { src }
            | Instruction::CheckCast { src, .. } => {
                // A cast hands back an alias through the pseudo result.
                if facts.may_this.contains(src) {
                    self.escape(facts);
                }
            }
            Instruction::LoadParam { dest, .. } if *dest == self.this_reg => {}
            other => {
                if let Some((dest, kind)) = other.dest() {
                    facts.forget(dest, kind);
                }
            }
        }
    }
}

impl FixpointSemantics for InitSemantics<'_> {
    type State = Option<InitFacts>;

    fn bottom(&self) -> Self::State {
        None
    }

    fn initial_state(&self) -> Self::State {
        Some(InitFacts {
            may_this: BTreeSet::from([self.this_reg]),
            must_this: BTreeSet::from([self.this_reg]),
            assigned: BTreeSet::new(),
            exposed: BTreeSet::new(),
        })
    }

    fn join(&self, left: &Self::State, right: &Self::State) -> Self::State {
        match (left, right) {
            (None, other) | (other, None) => other.clone(),
            (Some(left), Some(right)) => Some(left.join(right)),
        }
    }

    fn transfer_block(&self, block: &BasicBlock, entry: &Self::State) -> BlockOutcome<Self::State> {
        let Some(mut facts) = entry.clone() else {
            return BlockOutcome {
                exit: None,
                exceptional: None,
            };
        };
        let mut exceptional: Option<InitFacts> = None;
        for instruction in &block.instructions {
            if instruction.may_throw() {
                exceptional = Some(match exceptional {
                    Some(joined) => joined.join(&facts),
                    None => facts.clone(),
                });
            }
            self.step(instruction, &mut facts);
        }
        BlockOutcome {
            exit: Some(facts),
            exceptional,
        }
    }
}

/// Own instance fields one constructor assigns on every normal exit without
/// letting anybody observe them first.
fn fields_initialised_by(
    index: &ProgramIndex,
    class: ClassId,
    cfg: &ControlFlowGraph,
) -> Result<BTreeSet<FieldId>, CpError> {
    let Some(Instruction::LoadParam { dest: this_reg, .. }) = cfg
        .block(cfg.entry)
        .and_then(|block| block.instructions.first())
    else {
        return Ok(BTreeSet::new());
    };
    let graph = MethodGraph::new(cfg)?;
    let semantics = InitSemantics {
        index,
        class,
        this_reg: *this_reg,
    };
    let states = solve(&graph, &semantics);

    let mut candidates: BTreeSet<FieldId> = index
        .class(class)
        .fields
        .iter()
        .copied()
        .filter(|field| !index.field(*field).is_static)
        .collect();
    for (position, outcome) in states.outcome.iter().enumerate() {
        for facts in [&outcome.exit, &outcome.exceptional].into_iter().flatten() {
            candidates.retain(|field| !facts.exposed.contains(field));
        }
        let returns = graph
            .block(position)
            .instructions
            .last()
            .is_some_and(Instruction::is_return);
        if let (true, Some(facts)) = (returns, &outcome.exit) {
            candidates.retain(|field| facts.assigned.contains(field));
        }
    }
    Ok(candidates)
}

/// Instance fields whose value can be summarised program-wide: every
/// constructor of the declaring class assigns them before `this` escapes and
/// nothing reads them early.
pub(crate) fn initialised_instance_fields(
    program: &Program,
    index: &ProgramIndex,
) -> Result<BTreeSet<FieldId>, CpError> {
    let mut result = BTreeSet::new();
    for class in index.class_ids() {
        let info = index.class(class);
        if info.keep || info.has_native_method {
            continue;
        }
        let inits: Vec<MethodId> = info
            .methods
            .iter()
            .copied()
            .filter(|method| index.method(*method).is_init())
            .collect();
        if inits.is_empty() {
            continue;
        }
        let mut common: Option<BTreeSet<FieldId>> = None;
        for init in inits {
            let Some(cfg) = index.code(program, init) else {
                common = Some(BTreeSet::new());
                break;
            };
            let fields = fields_initialised_by(index, class, cfg)?;
            common = Some(match common {
                Some(previous) => previous.intersection(&fields).copied().collect(),
                None => fields,
            });
        }
        let fields = common.unwrap_or_default();
        for field in &fields {
            debug!("{} is assigned before its object escapes", index.field_label(*field));
        }
        result.extend(fields.into_iter().filter(|field| !index.is_root_field(*field)));
    }
    Ok(result)
}
