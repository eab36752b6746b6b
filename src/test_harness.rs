//! Builders for small in-memory programs, plus a concrete interpreter used to
//! check that rewrites only remove code no execution can reach.

use std::collections::{BTreeMap, BTreeSet};

use crate::callgraph::{CallGraph, CallGraphOptions, build_call_graph};
use crate::dataflow::analyzer::MethodContext;
use crate::dataflow::primitive::fold_binop;
use crate::descriptor::{field_category, return_category};
use crate::hierarchy::{MethodId, ProgramIndex};
use crate::interprocedural::whole_program::WholeProgramState;
use crate::ir::{
    BasicBlock, BlockId, Class, ClassAccess, ControlFlowGraph, EdgeKind, EncodedValue, Field,
    FieldAccess, FieldRef, FlowEdge, IfCond, Instruction, InvokeKind, Method, MethodAccess,
    MethodRef, Program, Reg, ValueKind,
};

/// Indexed program with an oracle, ready to hand out method contexts.
pub(crate) struct AnalysisFixture {
    pub(crate) index: ProgramIndex,
    pub(crate) whole_program: WholeProgramState,
    program: Program,
    call_graph: CallGraph,
}

impl AnalysisFixture {
    pub(crate) fn new(program: Program) -> Self {
        let index = ProgramIndex::build(&program).expect("index test program");
        let call_graph = build_call_graph(
            &program,
            &index,
            CallGraphOptions {
                keep_methods_are_entries: true,
                ..CallGraphOptions::default()
            },
        );
        Self {
            index,
            whole_program: WholeProgramState::top(),
            program,
            call_graph,
        }
    }

    /// `Foo` with a static `int qux` and an empty static `bar()V`.
    pub(crate) fn single_static_method() -> Self {
        Self::new(
            ProgramBuilder::new()
                .class(
                    ClassBuilder::new("Foo")
                        .static_field("qux", "I", None)
                        .method(MethodBuilder::new("bar", "()V").returning_void()),
                )
                .build(),
        )
    }

    pub(crate) fn program(&self) -> &Program {
        &self.program
    }

    pub(crate) fn call_graph(&self) -> &CallGraph {
        &self.call_graph
    }

    pub(crate) fn method_id(&self, class: &str, name: &str) -> MethodId {
        self.index
            .method_ids()
            .find(|method| {
                let info = self.index.method(*method);
                info.name == name && self.index.class(info.class).name == class
            })
            .unwrap_or_else(|| panic!("no method {class}.{name}"))
    }

    /// Context of the first method of the first class.
    pub(crate) fn context(&self) -> MethodContext<'_> {
        let method = self.index.method_ids().next().expect("program has a method");
        self.context_of(method)
    }

    pub(crate) fn context_for(&self, class: &str, name: &str) -> MethodContext<'_> {
        self.context_of(self.method_id(class, name))
    }

    pub(crate) fn context_of(&self, method: MethodId) -> MethodContext<'_> {
        MethodContext::new(&self.index, &self.call_graph, &self.whole_program, method)
    }

    pub(crate) fn code(&self, class: &str, name: &str) -> &ControlFlowGraph {
        self.index
            .code(&self.program, self.method_id(class, name))
            .expect("method has code")
    }
}

pub(crate) struct ProgramBuilder {
    classes: Vec<Class>,
}

impl ProgramBuilder {
    pub(crate) fn new() -> Self {
        Self {
            classes: Vec::new(),
        }
    }

    pub(crate) fn class(mut self, class: ClassBuilder) -> Self {
        self.classes.push(class.build());
        self
    }

    pub(crate) fn build(self) -> Program {
        Program {
            classes: self.classes,
        }
    }
}

pub(crate) struct ClassBuilder {
    class: Class,
}

impl ClassBuilder {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            class: Class {
                name: name.to_string(),
                super_name: Some("java/lang/Object".to_string()),
                interfaces: Vec::new(),
                access: ClassAccess::default(),
                fields: Vec::new(),
                methods: Vec::new(),
            },
        }
    }

    pub(crate) fn extends(mut self, super_name: &str) -> Self {
        self.class.super_name = Some(super_name.to_string());
        self
    }

    pub(crate) fn implements(mut self, interface: &str) -> Self {
        self.class.interfaces.push(interface.to_string());
        self
    }

    pub(crate) fn enum_class(mut self) -> Self {
        self.class.access.is_enum = true;
        self.class.super_name = Some("java/lang/Enum".to_string());
        self
    }

    pub(crate) fn keep(mut self) -> Self {
        self.class.access.keep = true;
        self
    }

    pub(crate) fn static_field(
        mut self,
        name: &str,
        descriptor: &str,
        encoded_value: Option<EncodedValue>,
    ) -> Self {
        self.class.fields.push(Field {
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            access: FieldAccess {
                is_static: true,
                ..FieldAccess::default()
            },
            encoded_value,
        });
        self
    }

    pub(crate) fn kept_static_field(mut self, name: &str, descriptor: &str) -> Self {
        self.class.fields.push(Field {
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            access: FieldAccess {
                is_static: true,
                keep: true,
                ..FieldAccess::default()
            },
            encoded_value: None,
        });
        self
    }

    pub(crate) fn instance_field(mut self, name: &str, descriptor: &str) -> Self {
        self.class.fields.push(Field {
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            access: FieldAccess::default(),
            encoded_value: None,
        });
        self
    }

    pub(crate) fn method(mut self, method: MethodBuilder) -> Self {
        self.class.methods.push(method.build());
        self
    }

    pub(crate) fn build(self) -> Class {
        self.class
    }
}

/// Method body builder. Instructions go to the most recently opened block;
/// block 0 is open from the start and is the entry.
pub(crate) struct MethodBuilder {
    name: String,
    descriptor: String,
    access: MethodAccess,
    has_code: bool,
    blocks: Vec<BasicBlock>,
    edges: Vec<FlowEdge>,
    exit: Option<BlockId>,
    registers: Option<u32>,
}

impl MethodBuilder {
    /// A static method with an empty entry block.
    pub(crate) fn new(name: &str, descriptor: &str) -> Self {
        Self {
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            access: MethodAccess {
                is_static: true,
                ..MethodAccess::default()
            },
            has_code: true,
            blocks: vec![BasicBlock {
                id: 0,
                instructions: Vec::new(),
            }],
            edges: Vec::new(),
            exit: None,
            registers: None,
        }
    }

    pub(crate) fn instance(mut self) -> Self {
        self.access.is_static = false;
        self
    }

    pub(crate) fn static_method(mut self) -> Self {
        self.access.is_static = true;
        self
    }

    pub(crate) fn keep(mut self) -> Self {
        self.access.keep = true;
        self
    }

    /// Native methods have no body.
    pub(crate) fn native(mut self) -> Self {
        self.access.is_native = true;
        self.has_code = false;
        self
    }

    pub(crate) fn instruction(mut self, instruction: Instruction) -> Self {
        if let Some(block) = self.blocks.last_mut() {
            block.instructions.push(instruction);
        }
        self
    }

    pub(crate) fn returning_void(self) -> Self {
        self.instruction(Instruction::ReturnVoid)
    }

    /// `const v0, value; return v0`
    pub(crate) fn returning_const(self, value: i64) -> Self {
        let kind = return_category(&self.descriptor)
            .map(|category| category.value_kind())
            .unwrap_or_default();
        self.instruction(Instruction::Const {
            dest: 0,
            literal: value,
            kind,
        })
        .instruction(Instruction::Return { src: 0, kind })
    }

    pub(crate) fn registers(mut self, registers: u32) -> Self {
        self.registers = Some(registers);
        self
    }

    pub(crate) fn block(mut self, id: BlockId) -> Self {
        self.blocks.push(BasicBlock {
            id,
            instructions: Vec::new(),
        });
        self
    }

    fn edge(mut self, from: BlockId, to: BlockId, kind: EdgeKind) -> Self {
        self.edges.push(FlowEdge { from, to, kind });
        self
    }

    pub(crate) fn goto(self, from: BlockId, to: BlockId) -> Self {
        self.edge(from, to, EdgeKind::Goto)
    }

    /// Taken side of an `if`.
    pub(crate) fn branch(self, from: BlockId, to: BlockId) -> Self {
        self.edge(from, to, EdgeKind::Branch { case: None })
    }

    pub(crate) fn case(self, from: BlockId, to: BlockId, value: i64) -> Self {
        self.edge(from, to, EdgeKind::Branch { case: Some(value) })
    }

    pub(crate) fn throw_edge(self, from: BlockId, to: BlockId) -> Self {
        self.edge(from, to, EdgeKind::Throw)
    }

    pub(crate) fn ghost(self, from: BlockId, to: BlockId) -> Self {
        self.edge(from, to, EdgeKind::Ghost)
    }

    pub(crate) fn exit(mut self, id: BlockId) -> Self {
        self.exit = Some(id);
        self
    }

    fn inferred_registers(&self) -> u32 {
        self.blocks
            .iter()
            .flat_map(|block| block.instructions.iter())
            .flat_map(|instruction| {
                let mut used = instruction.sources();
                if let Some((dest, kind)) = instruction.dest() {
                    used.push(if kind == ValueKind::Wide { dest + 1 } else { dest });
                }
                used
            })
            .map(|reg| reg + 1)
            .max()
            .unwrap_or(0)
    }

    pub(crate) fn build(self) -> Method {
        let code = self.has_code.then(|| ControlFlowGraph {
            registers_size: self.registers.unwrap_or_else(|| self.inferred_registers()),
            entry: 0,
            exit: self.exit,
            blocks: self.blocks.clone(),
            edges: self.edges.clone(),
        });
        Method {
            name: self.name,
            descriptor: self.descriptor,
            access: self.access,
            code,
        }
    }
}

fn field_ref(owner: &str, name: &str, descriptor: &str) -> FieldRef {
    FieldRef {
        owner: owner.to_string(),
        name: name.to_string(),
        descriptor: descriptor.to_string(),
    }
}

fn field_kind(descriptor: &str) -> ValueKind {
    field_category(descriptor)
        .map(|category| category.value_kind())
        .unwrap_or_default()
}

pub(crate) fn konst(dest: Reg, literal: i64) -> Instruction {
    Instruction::Const {
        dest,
        literal,
        kind: ValueKind::Int,
    }
}

pub(crate) fn param(dest: Reg) -> Instruction {
    Instruction::LoadParam {
        dest,
        kind: ValueKind::Int,
    }
}

pub(crate) fn ret(src: Reg) -> Instruction {
    Instruction::Return {
        src,
        kind: ValueKind::Int,
    }
}

/// `if-<cond>z reg`
pub(crate) fn if_zero(cond: IfCond, reg: Reg) -> Instruction {
    Instruction::If {
        cond,
        left: reg,
        right: None,
    }
}

pub(crate) fn sget(owner: &str, name: &str, descriptor: &str) -> Instruction {
    Instruction::Sget {
        field: field_ref(owner, name, descriptor),
        kind: field_kind(descriptor),
    }
}

pub(crate) fn sput(src: Reg, owner: &str, name: &str, descriptor: &str) -> Instruction {
    Instruction::Sput {
        src,
        field: field_ref(owner, name, descriptor),
        kind: field_kind(descriptor),
    }
}

pub(crate) fn iget(object: Reg, owner: &str, name: &str, descriptor: &str) -> Instruction {
    Instruction::Iget {
        object,
        field: field_ref(owner, name, descriptor),
        kind: field_kind(descriptor),
    }
}

pub(crate) fn iput(src: Reg, object: Reg, owner: &str, name: &str, descriptor: &str) -> Instruction {
    Instruction::Iput {
        src,
        object,
        field: field_ref(owner, name, descriptor),
        kind: field_kind(descriptor),
    }
}

pub(crate) fn invoke(
    kind: InvokeKind,
    owner: &str,
    name: &str,
    descriptor: &str,
    args: Vec<Reg>,
) -> Instruction {
    Instruction::Invoke {
        kind,
        method: MethodRef {
            owner: owner.to_string(),
            name: name.to_string(),
            descriptor: descriptor.to_string(),
        },
        args,
    }
}

pub(crate) fn invoke_static(owner: &str, name: &str, descriptor: &str, args: Vec<Reg>) -> Instruction {
    invoke(InvokeKind::Static, owner, name, descriptor, args)
}

pub(crate) fn invoke_virtual(owner: &str, name: &str, descriptor: &str, args: Vec<Reg>) -> Instruction {
    invoke(InvokeKind::Virtual, owner, name, descriptor, args)
}

pub(crate) fn move_result(dest: Reg) -> Instruction {
    Instruction::MoveResult {
        dest,
        kind: ValueKind::Int,
    }
}

pub(crate) fn move_result_pseudo(dest: Reg) -> Instruction {
    Instruction::MoveResultPseudo {
        dest,
        kind: ValueKind::Int,
    }
}

/// Trace of one concrete run.
#[derive(Debug, Default)]
pub(crate) struct Execution {
    pub(crate) visited: BTreeSet<BlockId>,
    pub(crate) returned: Option<i64>,
    /// False when the run hit an instruction the interpreter does not model.
    pub(crate) completed: bool,
}

const STEP_LIMIT: usize = 10_000;

/// Run an integer-only method body. Calls and stores are skipped; reading a
/// call or field result stops the run.
pub(crate) fn interpret(cfg: &ControlFlowGraph, arguments: &[i64]) -> Execution {
    let mut execution = Execution::default();
    let mut registers: BTreeMap<Reg, i64> = BTreeMap::new();
    let mut next_param = 0;
    let mut current = cfg.entry;
    for _ in 0..STEP_LIMIT {
        execution.visited.insert(current);
        let Some(block) = cfg.block(current) else {
            return execution;
        };
        let mut taken: Option<EdgeKind> = None;
        for instruction in &block.instructions {
            let read = |reg: &Reg| registers.get(reg).copied().unwrap_or(0);
            match instruction {
                Instruction::LoadParam { dest, .. } => {
                    registers.insert(*dest, arguments.get(next_param).copied().unwrap_or(0));
                    next_param += 1;
                }
                Instruction::Const { dest, literal, .. } => {
                    registers.insert(*dest, *literal);
                }
                Instruction::Move { dest, src, .. } => {
                    let value = read(src);
                    registers.insert(*dest, value);
                }
                Instruction::BinopLit {
                    op,
                    dest: Some(dest),
                    src,
                    literal,
                } => match fold_binop(*op, read(src), *literal, false) {
                    Some(value) => {
                        registers.insert(*dest, value);
                    }
                    None => return execution,
                },
                Instruction::Binop {
                    op,
                    dest: Some(dest),
                    left,
                    right,
                    wide,
                } => match fold_binop(*op, read(left), read(right), *wide) {
                    Some(value) => {
                        registers.insert(*dest, value);
                    }
                    None => return execution,
                },
                Instruction::Nop | Instruction::Invoke { .. } | Instruction::Sput { .. } => {}
                Instruction::If { cond, left, right } => {
                    let holds = cond.holds(read(left), right.as_ref().map(read).unwrap_or(0));
                    taken = Some(if holds {
                        EdgeKind::Branch { case: None }
                    } else {
                        EdgeKind::Goto
                    });
                }
                Instruction::Switch { src } => {
                    let value = read(src);
                    let matches_case = cfg.edges.iter().any(|edge| {
                        edge.from == current && edge.kind == EdgeKind::Branch { case: Some(value) }
                    });
                    taken = Some(if matches_case {
                        EdgeKind::Branch { case: Some(value) }
                    } else {
                        EdgeKind::Goto
                    });
                }
                Instruction::Return { src, .. } => {
                    execution.returned = Some(read(src));
                    execution.completed = true;
                    return execution;
                }
                Instruction::ReturnVoid => {
                    execution.completed = true;
                    return execution;
                }
                _ => return execution,
            }
        }
        let wanted = taken.unwrap_or(EdgeKind::Goto);
        let Some(edge) = cfg
            .edges
            .iter()
            .find(|edge| edge.from == current && edge.kind == wanted)
        else {
            return execution;
        };
        current = edge.to;
    }
    execution
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_infers_the_register_frame() {
        let method = MethodBuilder::new("f", "()J")
            .instruction(Instruction::Const {
                dest: 2,
                literal: 1,
                kind: ValueKind::Wide,
            })
            .instruction(Instruction::Return {
                src: 2,
                kind: ValueKind::Wide,
            })
            .build();
        assert_eq!(method.code.expect("code").registers_size, 4);
    }

    #[test]
    fn interpreter_follows_taken_branches() {
        let method = MethodBuilder::new("f", "(I)I")
            .instruction(param(0))
            .instruction(if_zero(IfCond::Eq, 0))
            .block(1)
            .instruction(ret(0))
            .block(2)
            .instruction(konst(1, 7))
            .instruction(ret(1))
            .branch(0, 2)
            .goto(0, 1)
            .build();
        let cfg = method.code.expect("code");
        let zero = interpret(&cfg, &[0]);
        assert_eq!(zero.returned, Some(7));
        assert!(!zero.visited.contains(&1));
        let five = interpret(&cfg, &[5]);
        assert_eq!(five.returned, Some(5));
        assert!(five.completed);
    }
}
