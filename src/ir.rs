use std::fmt;

use serde::{Deserialize, Serialize};

/// Virtual register number. Program registers fit in 16 bits; the analysis
/// reserves values above that range for pseudo registers.
pub(crate) type Reg = u32;

/// Stable block label inside one method's CFG.
pub(crate) type BlockId = u32;

/// Whole program handed over by the loader.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub(crate) struct Program {
    pub(crate) classes: Vec<Class>,
}

/// Intermediate representation for a class definition.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct Class {
    pub(crate) name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) super_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub(crate) interfaces: Vec<String>,
    #[serde(default)]
    pub(crate) access: ClassAccess,
    #[serde(default)]
    pub(crate) fields: Vec<Field>,
    #[serde(default)]
    pub(crate) methods: Vec<Method>,
}

/// Class-level flags relevant to constant propagation.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub(crate) struct ClassAccess {
    #[serde(default)]
    pub(crate) is_enum: bool,
    #[serde(default)]
    pub(crate) is_interface: bool,
    #[serde(default)]
    pub(crate) keep: bool,
}

/// Intermediate representation for a field definition.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct Field {
    pub(crate) name: String,
    pub(crate) descriptor: String,
    #[serde(default)]
    pub(crate) access: FieldAccess,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) encoded_value: Option<EncodedValue>,
}

/// Field flags relevant to constant propagation.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub(crate) struct FieldAccess {
    #[serde(default)]
    pub(crate) is_static: bool,
    #[serde(default)]
    pub(crate) is_final: bool,
    #[serde(default)]
    pub(crate) keep: bool,
}

/// Static initial value from the class-file constant table.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "kebab-case")]
pub(crate) enum EncodedValue {
    Int(i128),
    String(String),
    Class(String),
    Null,
}

/// Intermediate representation for a method and its code.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct Method {
    pub(crate) name: String,
    pub(crate) descriptor: String,
    #[serde(default)]
    pub(crate) access: MethodAccess,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) code: Option<ControlFlowGraph>,
}

impl Method {
    pub(crate) fn is_clinit(&self) -> bool {
        self.name == "<clinit>"
    }

    pub(crate) fn is_init(&self) -> bool {
        self.name == "<init>"
    }
}

/// Method flags relevant to constant propagation.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub(crate) struct MethodAccess {
    #[serde(default)]
    pub(crate) is_static: bool,
    #[serde(default)]
    pub(crate) is_private: bool,
    #[serde(default)]
    pub(crate) is_native: bool,
    #[serde(default)]
    pub(crate) is_abstract: bool,
    #[serde(default)]
    pub(crate) keep: bool,
}

/// Control-flow graph of one method body. Gotos are edges, not instructions.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct ControlFlowGraph {
    pub(crate) registers_size: u32,
    pub(crate) entry: BlockId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) exit: Option<BlockId>,
    pub(crate) blocks: Vec<BasicBlock>,
    #[serde(default)]
    pub(crate) edges: Vec<FlowEdge>,
}

/// Straight-line instruction sequence.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct BasicBlock {
    pub(crate) id: BlockId,
    #[serde(default)]
    pub(crate) instructions: Vec<Instruction>,
}

/// Directed CFG edge.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub(crate) struct FlowEdge {
    pub(crate) from: BlockId,
    pub(crate) to: BlockId,
    pub(crate) kind: EdgeKind,
}

/// Edge classification. `Branch` is the taken side of an `if` or one switch case.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub(crate) enum EdgeKind {
    Goto,
    Branch {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        case: Option<i64>,
    },
    Throw,
    Ghost,
}

/// Register width/category of a value moved by an instruction.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) enum ValueKind {
    #[default]
    Int,
    Wide,
    Object,
}

/// Conditional branch predicate.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) enum IfCond {
    Eq,
    Ne,
    Lt,
    Ge,
    Gt,
    Le,
}

impl IfCond {
    pub(crate) fn negate(self) -> Self {
        match self {
            IfCond::Eq => IfCond::Ne,
            IfCond::Ne => IfCond::Eq,
            IfCond::Lt => IfCond::Ge,
            IfCond::Ge => IfCond::Lt,
            IfCond::Gt => IfCond::Le,
            IfCond::Le => IfCond::Gt,
        }
    }

    /// Predicate with both operands swapped (`a < b` is `b > a`).
    pub(crate) fn flip(self) -> Self {
        match self {
            IfCond::Eq => IfCond::Eq,
            IfCond::Ne => IfCond::Ne,
            IfCond::Lt => IfCond::Gt,
            IfCond::Ge => IfCond::Le,
            IfCond::Gt => IfCond::Lt,
            IfCond::Le => IfCond::Ge,
        }
    }

    pub(crate) fn holds(self, left: i64, right: i64) -> bool {
        match self {
            IfCond::Eq => left == right,
            IfCond::Ne => left != right,
            IfCond::Lt => left < right,
            IfCond::Ge => left >= right,
            IfCond::Gt => left > right,
            IfCond::Le => left <= right,
        }
    }
}

/// Two-operand arithmetic.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) enum BinopKind {
    Add,
    Sub,
    Rsub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Ushr,
}

impl BinopKind {
    /// Division and remainder may throw and deliver through the pseudo result.
    pub(crate) fn is_div_rem(self) -> bool {
        matches!(self, BinopKind::Div | BinopKind::Rem)
    }
}

/// One-operand arithmetic and integral conversions.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) enum UnopKind {
    NegInt,
    NotInt,
    NegLong,
    NotLong,
    IntToLong,
    LongToInt,
    IntToByte,
    IntToChar,
    IntToShort,
    IntToFloat,
    IntToDouble,
    LongToFloat,
    LongToDouble,
    FloatToInt,
    FloatToLong,
    DoubleToInt,
    DoubleToLong,
    NegFloat,
    NegDouble,
    FloatToDouble,
    DoubleToFloat,
}

/// Three-way comparisons.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) enum CmpKind {
    CmpLong,
    CmplFloat,
    CmpgFloat,
    CmplDouble,
    CmpgDouble,
}

/// Invoke opcode classification used by resolution.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) enum InvokeKind {
    Virtual,
    Super,
    Direct,
    Static,
    Interface,
}

/// Symbolic field reference as written in the code.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub(crate) struct FieldRef {
    pub(crate) owner: String,
    pub(crate) name: String,
    pub(crate) descriptor: String,
}

impl fmt::Display for FieldRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}:{}", self.owner, self.name, self.descriptor)
    }
}

/// Symbolic method reference as written in the code.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub(crate) struct MethodRef {
    pub(crate) owner: String,
    pub(crate) name: String,
    pub(crate) descriptor: String,
}

impl fmt::Display for MethodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}{}", self.owner, self.name, self.descriptor)
    }
}

/// Register-based bytecode instruction.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "insn", rename_all = "kebab-case")]
pub(crate) enum Instruction {
    Nop,
    LoadParam {
        dest: Reg,
        #[serde(default)]
        kind: ValueKind,
    },
    Const {
        dest: Reg,
        literal: i64,
        #[serde(default)]
        kind: ValueKind,
    },
    ConstString {
        dest: Reg,
        string: String,
    },
    ConstClass {
        dest: Reg,
        class: String,
    },
    Move {
        dest: Reg,
        src: Reg,
        #[serde(default)]
        kind: ValueKind,
    },
    MoveResult {
        dest: Reg,
        #[serde(default)]
        kind: ValueKind,
    },
    MoveResultPseudo {
        dest: Reg,
        #[serde(default)]
        kind: ValueKind,
    },
    MoveException {
        dest: Reg,
    },
    Return {
        src: Reg,
        #[serde(default)]
        kind: ValueKind,
    },
    ReturnVoid,
    If {
        cond: IfCond,
        left: Reg,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        right: Option<Reg>,
    },
    Switch {
        src: Reg,
    },
    Binop {
        op: BinopKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dest: Option<Reg>,
        left: Reg,
        right: Reg,
        #[serde(default)]
        wide: bool,
    },
    BinopLit {
        op: BinopKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dest: Option<Reg>,
        src: Reg,
        literal: i64,
    },
    Unop {
        op: UnopKind,
        dest: Reg,
        src: Reg,
    },
    Cmp {
        op: CmpKind,
        dest: Reg,
        left: Reg,
        right: Reg,
    },
    Sget {
        field: FieldRef,
        #[serde(default)]
        kind: ValueKind,
    },
    Sput {
        src: Reg,
        field: FieldRef,
        #[serde(default)]
        kind: ValueKind,
    },
    Iget {
        object: Reg,
        field: FieldRef,
        #[serde(default)]
        kind: ValueKind,
    },
    Iput {
        src: Reg,
        object: Reg,
        field: FieldRef,
        #[serde(default)]
        kind: ValueKind,
    },
    Aget {
        array: Reg,
        index: Reg,
        #[serde(default)]
        kind: ValueKind,
    },
    Aput {
        src: Reg,
        array: Reg,
        index: Reg,
        #[serde(default)]
        kind: ValueKind,
    },
    ArrayLength {
        array: Reg,
    },
    NewInstance {
        class: String,
    },
    NewArray {
        size: Reg,
        class: String,
    },
    CheckCast {
        src: Reg,
        class: String,
    },
    InstanceOf {
        src: Reg,
        class: String,
    },
    Invoke {
        kind: InvokeKind,
        method: MethodRef,
        #[serde(default)]
        args: Vec<Reg>,
    },
    Throw {
        src: Reg,
    },
    MonitorEnter {
        src: Reg,
    },
    MonitorExit {
        src: Reg,
    },
}

impl Instruction {
    /// Register written directly by the instruction, with its width.
    pub(crate) fn dest(&self) -> Option<(Reg, ValueKind)> {
        match self {
            Instruction::LoadParam { dest, kind }
            | Instruction::Const { dest, kind, .. }
            | Instruction::Move { dest, kind, .. }
            | Instruction::MoveResult { dest, kind }
            | Instruction::MoveResultPseudo { dest, kind } => Some((*dest, *kind)),
            Instruction::ConstString { dest, .. }
            | Instruction::ConstClass { dest, .. }
            | Instruction::MoveException { dest } => Some((*dest, ValueKind::Object)),
            Instruction::Binop {
                dest: Some(dest),
                wide,
                ..
            } => Some((*dest, if *wide { ValueKind::Wide } else { ValueKind::Int })),
            Instruction::BinopLit {
                dest: Some(dest), ..
            } => Some((*dest, ValueKind::Int)),
            Instruction::Unop { dest, op, .. } => Some((*dest, unop_result_kind(*op))),
            Instruction::Cmp { dest, .. } => Some((*dest, ValueKind::Int)),
            _ => None,
        }
    }

    /// Whether the instruction defines the result pseudo register.
    pub(crate) fn writes_result(&self) -> bool {
        self.has_move_result_pseudo() || matches!(self, Instruction::Invoke { .. })
    }

    /// Whether a `move-result-pseudo` must follow this instruction.
    pub(crate) fn has_move_result_pseudo(&self) -> bool {
        match self {
            Instruction::Sget { .. }
            | Instruction::Iget { .. }
            | Instruction::Aget { .. }
            | Instruction::ArrayLength { .. }
            | Instruction::NewInstance { .. }
            | Instruction::NewArray { .. }
            | Instruction::CheckCast { .. }
            | Instruction::InstanceOf { .. } => true,
            Instruction::Binop { op, dest, .. } | Instruction::BinopLit { op, dest, .. } => {
                op.is_div_rem() && dest.is_none()
            }
            _ => false,
        }
    }

    /// Registers read by the instruction.
    pub(crate) fn sources(&self) -> Vec<Reg> {
        match self {
            Instruction::Move { src, .. }
            | Instruction::Return { src, .. }
            | Instruction::Switch { src }
            | Instruction::BinopLit { src, .. }
            | Instruction::Unop { src, .. }
            | Instruction::Sput { src, .. }
            | Instruction::CheckCast { src, .. }
            | Instruction::InstanceOf { src, .. }
            | Instruction::Throw { src }
            | Instruction::MonitorEnter { src }
            | Instruction::MonitorExit { src } => vec![*src],
            Instruction::If { left, right, .. } => {
                let mut sources = vec![*left];
                sources.extend(right.iter().copied());
                sources
            }
            Instruction::Binop { left, right, .. } | Instruction::Cmp { left, right, .. } => {
                vec![*left, *right]
            }
            Instruction::Iget { object, .. } => vec![*object],
            Instruction::Iput { src, object, .. } => vec![*src, *object],
            Instruction::Aget { array, index, .. } => vec![*array, *index],
            Instruction::Aput {
                src, array, index, ..
            } => vec![*src, *array, *index],
            Instruction::ArrayLength { array } => vec![*array],
            Instruction::NewArray { size, .. } => vec![*size],
            Instruction::Invoke { args, .. } => args.clone(),
            _ => Vec::new(),
        }
    }

    /// Whether executing the instruction can raise an exception.
    pub(crate) fn may_throw(&self) -> bool {
        match self {
            Instruction::Sget { .. }
            | Instruction::Sput { .. }
            | Instruction::Iget { .. }
            | Instruction::Iput { .. }
            | Instruction::Aget { .. }
            | Instruction::Aput { .. }
            | Instruction::ArrayLength { .. }
            | Instruction::NewInstance { .. }
            | Instruction::NewArray { .. }
            | Instruction::CheckCast { .. }
            | Instruction::Invoke { .. }
            | Instruction::Throw { .. }
            | Instruction::MonitorEnter { .. }
            | Instruction::MonitorExit { .. }
            | Instruction::ConstClass { .. } => true,
            Instruction::Binop { op, .. } | Instruction::BinopLit { op, .. } => op.is_div_rem(),
            _ => false,
        }
    }

    /// Whether the instruction ends the method normally.
    pub(crate) fn is_return(&self) -> bool {
        matches!(self, Instruction::Return { .. } | Instruction::ReturnVoid)
    }

    pub(crate) fn is_conditional_branch(&self) -> bool {
        matches!(self, Instruction::If { .. } | Instruction::Switch { .. })
    }
}

fn unop_result_kind(op: UnopKind) -> ValueKind {
    match op {
        UnopKind::NegLong
        | UnopKind::NotLong
        | UnopKind::IntToLong
        | UnopKind::IntToDouble
        | UnopKind::LongToDouble
        | UnopKind::FloatToLong
        | UnopKind::DoubleToLong
        | UnopKind::NegDouble
        | UnopKind::FloatToDouble => ValueKind::Wide,
        _ => ValueKind::Int,
    }
}
