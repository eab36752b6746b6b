use crate::dataflow::analyzer::{ApplyOutcome, InstructionAnalyzer, MethodContext};
use crate::ir::{BinopKind, CmpKind, Instruction, Reg, UnopKind, ValueKind};
use crate::lattice::{ConstantEnvironment, ConstantValue, SignInterval};

/// Moves, constant loads, integer arithmetic and the allocation family.
pub(crate) struct PrimitiveAnalyzer;

impl InstructionAnalyzer for PrimitiveAnalyzer {
    fn name(&self) -> &'static str {
        "primitive"
    }

    fn analyze_default(
        &self,
        ctx: &MethodContext<'_>,
        instruction: &Instruction,
        env: &mut ConstantEnvironment,
    ) -> ApplyOutcome {
        match instruction {
            // Parameters are bound when the entry state is built.
            Instruction::Nop | Instruction::LoadParam { .. } => {}
            Instruction::Const {
                dest,
                literal,
                kind,
            } => write(env, *dest, *kind, ConstantValue::of_int(*literal)),
            Instruction::ConstString { dest, string } => {
                let value = ctx
                    .index
                    .strings()
                    .lookup(string)
                    .map(ConstantValue::of_string)
                    .unwrap_or_else(ConstantValue::non_null);
                env.set(*dest, value);
            }
            Instruction::ConstClass { dest, class } => {
                let value = ctx
                    .index
                    .strings()
                    .lookup(class)
                    .map(ConstantValue::of_class)
                    .unwrap_or_else(ConstantValue::non_null);
                env.set(*dest, value);
            }
            Instruction::Move { dest, src, kind } => {
                let value = env.get(*src);
                write(env, *dest, *kind, value);
            }
            Instruction::MoveResult { dest, kind } | Instruction::MoveResultPseudo { dest, kind } => {
                let value = env.result();
                write(env, *dest, *kind, value);
                env.set_result(ConstantValue::top());
            }
            Instruction::MoveException { dest } => env.set(*dest, ConstantValue::non_null()),
            Instruction::Return { .. }
            | Instruction::ReturnVoid
            | Instruction::If { .. }
            | Instruction::Switch { .. }
            | Instruction::Throw { .. }
            | Instruction::MonitorEnter { .. }
            | Instruction::MonitorExit { .. }
            | Instruction::Aput { .. }
            | Instruction::Iput { .. } => {}
            Instruction::Binop {
                op,
                dest,
                left,
                right,
                wide,
            } => {
                let value = evaluate_binop(*op, env.get(*left), env.get(*right), *wide);
                write_arithmetic(env, *dest, *wide, value);
            }
            Instruction::BinopLit {
                op,
                dest,
                src,
                literal,
            } => {
                let value =
                    evaluate_binop(*op, env.get(*src), ConstantValue::of_int(*literal), false);
                write_arithmetic(env, *dest, false, value);
            }
            Instruction::Unop { op, dest, src } => {
                let value = evaluate_unop(*op, env.get(*src));
                match instruction.dest() {
                    Some((_, ValueKind::Wide)) => env.set_wide(*dest, value),
                    _ => env.set(*dest, value),
                }
            }
            Instruction::Cmp {
                op,
                dest,
                left,
                right,
            } => {
                let value = match (op, env.get(*left).get_constant(), env.get(*right).get_constant()) {
                    (CmpKind::CmpLong, Some(left), Some(right)) => {
                        ConstantValue::of_int(left.cmp(&right) as i64)
                    }
                    _ => ConstantValue::top(),
                };
                env.set(*dest, value);
            }
            Instruction::ArrayLength { array } => {
                if env.get(*array) == ConstantValue::of_int(0) {
                    // Always throws a NullPointerException.
                    env.set_to_bottom();
                } else {
                    env.set_result(ConstantValue::of_interval(SignInterval::Gez));
                }
            }
            Instruction::NewInstance { .. } | Instruction::NewArray { .. } => {
                env.set_result(ConstantValue::non_null());
            }
            Instruction::CheckCast { src, .. } => {
                let value = env.get(*src);
                env.set_result(value);
            }
            Instruction::InstanceOf { src, .. } => {
                let value = if env.get(*src) == ConstantValue::of_int(0) {
                    ConstantValue::of_int(0)
                } else {
                    ConstantValue::of_interval(SignInterval::Gez)
                };
                env.set_result(value);
            }
            Instruction::Aget { .. } => env.set_result(ConstantValue::top()),
            Instruction::Sget { .. }
            | Instruction::Sput { .. }
            | Instruction::Iget { .. }
            | Instruction::Invoke { .. } => return ApplyOutcome::NotHandled,
        }
        ApplyOutcome::Applied
    }
}

fn write(env: &mut ConstantEnvironment, dest: Reg, kind: ValueKind, value: ConstantValue) {
    if kind == ValueKind::Wide {
        env.set_wide(dest, value);
    } else {
        env.set(dest, value);
    }
}

fn write_arithmetic(env: &mut ConstantEnvironment, dest: Option<Reg>, wide: bool, value: ConstantValue) {
    match dest {
        Some(dest) if wide => env.set_wide(dest, value),
        Some(dest) => env.set(dest, value),
        None => env.set_result(value),
    }
}

/// Two's-complement arithmetic at 32 or 64 bits.
pub(crate) fn fold_binop(op: BinopKind, left: i64, right: i64, wide: bool) -> Option<i64> {
    if op.is_div_rem() && right == 0 {
        return None;
    }
    if wide {
        let shift = (right & 0x3f) as u32;
        Some(match op {
            BinopKind::Add => left.wrapping_add(right),
            BinopKind::Sub => left.wrapping_sub(right),
            BinopKind::Rsub => right.wrapping_sub(left),
            BinopKind::Mul => left.wrapping_mul(right),
            BinopKind::Div => left.wrapping_div(right),
            BinopKind::Rem => left.wrapping_rem(right),
            BinopKind::And => left & right,
            BinopKind::Or => left | right,
            BinopKind::Xor => left ^ right,
            BinopKind::Shl => left.wrapping_shl(shift),
            BinopKind::Shr => left.wrapping_shr(shift),
            BinopKind::Ushr => ((left as u64) >> shift) as i64,
        })
    } else {
        let left = left as i32;
        let right = right as i32;
        let shift = (right & 0x1f) as u32;
        let value = match op {
            BinopKind::Add => left.wrapping_add(right),
            BinopKind::Sub => left.wrapping_sub(right),
            BinopKind::Rsub => right.wrapping_sub(left),
            BinopKind::Mul => left.wrapping_mul(right),
            BinopKind::Div => left.wrapping_div(right),
            BinopKind::Rem => left.wrapping_rem(right),
            BinopKind::And => left & right,
            BinopKind::Or => left | right,
            BinopKind::Xor => left ^ right,
            BinopKind::Shl => left.wrapping_shl(shift),
            BinopKind::Shr => left.wrapping_shr(shift),
            BinopKind::Ushr => ((left as u32) >> shift) as i32,
        };
        Some(i64::from(value))
    }
}

pub(crate) fn evaluate_binop(
    op: BinopKind,
    left: ConstantValue,
    right: ConstantValue,
    wide: bool,
) -> ConstantValue {
    if left.is_bottom() || right.is_bottom() {
        return ConstantValue::bottom();
    }
    if op.is_div_rem() && right == ConstantValue::of_int(0) {
        return ConstantValue::bottom();
    }
    if let (Some(l), Some(r)) = (left.get_constant(), right.get_constant()) {
        return fold_binop(op, l, r, wide)
            .map(ConstantValue::of_int)
            .unwrap_or_else(ConstantValue::bottom);
    }
    let non_negative = |value: ConstantValue| value.get_interval().leq(SignInterval::Gez);
    match op {
        BinopKind::And if non_negative(left) || non_negative(right) => {
            ConstantValue::of_interval(SignInterval::Gez)
        }
        BinopKind::Ushr => {
            let bits = if wide { 0x3f } else { 0x1f };
            match right.get_constant() {
                Some(amount) if amount & bits != 0 => ConstantValue::of_interval(SignInterval::Gez),
                _ => ConstantValue::top(),
            }
        }
        BinopKind::Rem => {
            ConstantValue::of_interval(left.get_interval().join(SignInterval::Eqz))
        }
        _ => ConstantValue::top(),
    }
}

pub(crate) fn evaluate_unop(op: UnopKind, value: ConstantValue) -> ConstantValue {
    if value.is_bottom() {
        return value;
    }
    let Some(constant) = value.get_constant() else {
        return match op {
            UnopKind::IntToLong => value,
            UnopKind::IntToChar => ConstantValue::of_interval(SignInterval::Gez),
            _ => ConstantValue::top(),
        };
    };
    let folded = match op {
        UnopKind::NegInt => i64::from((constant as i32).wrapping_neg()),
        UnopKind::NotInt => i64::from(!(constant as i32)),
        UnopKind::NegLong => constant.wrapping_neg(),
        UnopKind::NotLong => !constant,
        UnopKind::IntToLong => i64::from(constant as i32),
        UnopKind::LongToInt => i64::from(constant as i32),
        UnopKind::IntToByte => i64::from(constant as i8),
        UnopKind::IntToChar => i64::from(constant as u16),
        UnopKind::IntToShort => i64::from(constant as i16),
        _ => return ConstantValue::top(),
    };
    ConstantValue::of_int(folded)
}
