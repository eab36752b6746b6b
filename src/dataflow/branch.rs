use crate::ir::{IfCond, Reg};
use crate::lattice::{ConstantEnvironment, ConstantValue, SignInterval};

/// Split `env` for `if-<cond>z reg`: `(taken, fall_through)`. A side whose
/// environment is Bottom can never be reached.
pub(crate) fn refine_on_branch(
    env: &ConstantEnvironment,
    reg: Reg,
    cond: IfCond,
) -> (ConstantEnvironment, ConstantEnvironment) {
    let mut taken = env.clone();
    taken.refine(reg, ConstantValue::of_interval(SignInterval::of_zero_test(cond)));
    let mut fall_through = env.clone();
    fall_through.refine(
        reg,
        ConstantValue::of_interval(SignInterval::of_zero_test(cond.negate())),
    );
    (taken, fall_through)
}

/// Outcome of a comparison that the abstract values can decide.
fn decide(cond: IfCond, left: ConstantValue, right: ConstantValue) -> Option<bool> {
    if let (Some(l), Some(r)) = (left.get_constant(), right.get_constant()) {
        return Some(cond.holds(l, r));
    }
    match cond {
        IfCond::Eq => left.runtime_equals(&right),
        IfCond::Ne => left.runtime_equals(&right).map(|equal| !equal),
        _ => None,
    }
}

/// Environment flowing along one side of `if-<cond> left, right`.
pub(crate) fn refine_if(
    env: &ConstantEnvironment,
    cond: IfCond,
    left: Reg,
    right: Option<Reg>,
    taken: bool,
) -> ConstantEnvironment {
    if env.is_bottom() {
        return env.clone();
    }
    let cond = if taken { cond } else { cond.negate() };
    let Some(right) = right else {
        return refine_on_branch(env, left, cond).0;
    };
    let left_value = env.get(left);
    let right_value = env.get(right);
    if decide(cond, left_value, right_value) == Some(false) {
        return ConstantEnvironment::bottom();
    }
    let mut refined = env.clone();
    // A comparison against a known zero is a zero test on the other operand.
    if right_value == ConstantValue::of_int(0) {
        refined = refine_on_branch(&refined, left, cond).0;
    } else if left_value == ConstantValue::of_int(0) {
        refined = refine_on_branch(&refined, right, cond.flip()).0;
    }
    if cond == IfCond::Eq {
        let common = refined.get(left).meet(&refined.get(right));
        refined.set(left, common);
        refined.set(right, common);
    }
    refined
}

/// Environment flowing along a switch edge. `case` is the constant of a case
/// edge; `None` is the default edge, which excludes every listed case.
pub(crate) fn refine_switch(
    env: &ConstantEnvironment,
    src: Reg,
    case: Option<i64>,
    cases: &[i64],
) -> ConstantEnvironment {
    let mut refined = env.clone();
    match case {
        Some(case) => refined.refine(src, ConstantValue::of_int(case)),
        None => {
            if let Some(value) = refined.get(src).get_constant() {
                if cases.contains(&value) {
                    return ConstantEnvironment::bottom();
                }
            }
            if cases.contains(&0) {
                refined.refine(src, ConstantValue::non_null());
            }
        }
    }
    refined
}
