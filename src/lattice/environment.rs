use std::collections::BTreeMap;
use std::fmt;

use crate::hierarchy::FieldId;
use crate::ir::Reg;
use crate::lattice::value::ConstantValue;

/// Pseudo register holding the value produced by the previous instruction
/// for a following `move-result` / `move-result-pseudo`.
pub(crate) const RESULT_REGISTER: Reg = u32::MAX;

/// Map from keys to abstract values where absent keys are Top.
///
/// A Bottom binding anywhere collapses the whole environment, so the map
/// never stores Top or Bottom values and structural equality is lattice
/// equality.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct Environment<K: Ord + Copy> {
    bindings: Option<BTreeMap<K, ConstantValue>>,
}

impl<K: Ord + Copy> Default for Environment<K> {
    fn default() -> Self {
        Self::top()
    }
}

impl<K: Ord + Copy> Environment<K> {
    pub(crate) fn top() -> Self {
        Self {
            bindings: Some(BTreeMap::new()),
        }
    }

    pub(crate) fn bottom() -> Self {
        Self { bindings: None }
    }

    pub(crate) fn is_bottom(&self) -> bool {
        self.bindings.is_none()
    }

    pub(crate) fn is_top(&self) -> bool {
        self.bindings.as_ref().is_some_and(BTreeMap::is_empty)
    }

    pub(crate) fn get(&self, key: K) -> ConstantValue {
        match &self.bindings {
            None => ConstantValue::Bottom,
            Some(bindings) => bindings.get(&key).copied().unwrap_or(ConstantValue::Top),
        }
    }

    pub(crate) fn set(&mut self, key: K, value: ConstantValue) {
        let Some(bindings) = &mut self.bindings else {
            return;
        };
        match value {
            ConstantValue::Bottom => self.bindings = None,
            ConstantValue::Top => {
                bindings.remove(&key);
            }
            value => {
                bindings.insert(key, value);
            }
        }
    }

    /// Narrow one binding; meeting to Bottom collapses the environment.
    pub(crate) fn refine(&mut self, key: K, value: ConstantValue) {
        let current = self.get(key);
        self.set(key, current.meet(&value));
    }

    pub(crate) fn set_to_bottom(&mut self) {
        self.bindings = None;
    }

    /// Forget every binding (back to Top) unless the environment is Bottom.
    pub(crate) fn clear(&mut self) {
        if let Some(bindings) = &mut self.bindings {
            bindings.clear();
        }
    }

    pub(crate) fn bindings(&self) -> impl Iterator<Item = (K, ConstantValue)> + '_ {
        self.bindings
            .iter()
            .flat_map(|bindings| bindings.iter().map(|(key, value)| (*key, *value)))
    }

    pub(crate) fn join(&self, other: &Self) -> Self {
        let (Some(left), Some(right)) = (&self.bindings, &other.bindings) else {
            return if self.is_bottom() {
                other.clone()
            } else {
                self.clone()
            };
        };
        let mut joined = BTreeMap::new();
        for (key, value) in left {
            if let Some(other_value) = right.get(key) {
                let value = value.join(other_value);
                if !value.is_top() {
                    joined.insert(*key, value);
                }
            }
        }
        Self {
            bindings: Some(joined),
        }
    }

    pub(crate) fn join_with(&mut self, other: &Self) {
        *self = self.join(other);
    }

    pub(crate) fn meet(&self, other: &Self) -> Self {
        let (Some(_), Some(right)) = (&self.bindings, &other.bindings) else {
            return Self::bottom();
        };
        let mut met = self.clone();
        for (key, value) in right {
            met.refine(*key, *value);
        }
        met
    }

    pub(crate) fn leq(&self, other: &Self) -> bool {
        match (&self.bindings, &other.bindings) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(_), Some(right)) => right
                .iter()
                .all(|(key, value)| self.get(*key).leq(value)),
        }
    }
}

impl<K: Ord + Copy + fmt::Display> fmt::Display for Environment<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some(bindings) = &self.bindings else {
            return f.write_str("_|_");
        };
        f.write_str("{")?;
        for (index, (key, value)) in bindings.iter().enumerate() {
            if index > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{key} -> {value}")?;
        }
        f.write_str("}")
    }
}

/// Abstract state at a program point: registers plus the class-initialiser
/// field environment.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub(crate) struct ConstantEnvironment {
    registers: Environment<Reg>,
    fields: Environment<FieldId>,
}

impl ConstantEnvironment {
    pub(crate) fn top() -> Self {
        Self::default()
    }

    pub(crate) fn bottom() -> Self {
        Self {
            registers: Environment::bottom(),
            fields: Environment::bottom(),
        }
    }

    pub(crate) fn is_bottom(&self) -> bool {
        self.registers.is_bottom()
    }

    pub(crate) fn is_top(&self) -> bool {
        self.registers.is_top() && self.fields.is_top()
    }

    pub(crate) fn set_to_bottom(&mut self) {
        self.registers.set_to_bottom();
        self.fields.set_to_bottom();
    }

    pub(crate) fn get(&self, reg: Reg) -> ConstantValue {
        self.registers.get(reg)
    }

    pub(crate) fn set(&mut self, reg: Reg, value: ConstantValue) {
        self.registers.set(reg, value);
        self.sync_bottom();
    }

    /// Write a 64-bit value; the high half of the register pair becomes unknown.
    pub(crate) fn set_wide(&mut self, reg: Reg, value: ConstantValue) {
        self.set(reg, value);
        if reg != RESULT_REGISTER {
            self.set(reg + 1, ConstantValue::Top);
        }
    }

    pub(crate) fn refine(&mut self, reg: Reg, value: ConstantValue) {
        self.registers.refine(reg, value);
        self.sync_bottom();
    }

    pub(crate) fn result(&self) -> ConstantValue {
        self.get(RESULT_REGISTER)
    }

    pub(crate) fn set_result(&mut self, value: ConstantValue) {
        self.set(RESULT_REGISTER, value);
    }

    pub(crate) fn field(&self, field: FieldId) -> ConstantValue {
        self.fields.get(field)
    }

    pub(crate) fn set_field(&mut self, field: FieldId, value: ConstantValue) {
        self.fields.set(field, value);
        if self.fields.is_bottom() {
            self.registers.set_to_bottom();
        }
    }

    pub(crate) fn registers(&self) -> &Environment<Reg> {
        &self.registers
    }

    pub(crate) fn fields(&self) -> &Environment<FieldId> {
        &self.fields
    }

    pub(crate) fn join(&self, other: &Self) -> Self {
        if self.is_bottom() {
            return other.clone();
        }
        if other.is_bottom() {
            return self.clone();
        }
        Self {
            registers: self.registers.join(&other.registers),
            fields: self.fields.join(&other.fields),
        }
    }

    pub(crate) fn join_with(&mut self, other: &Self) {
        *self = self.join(other);
    }

    pub(crate) fn leq(&self, other: &Self) -> bool {
        self.is_bottom() || (self.registers.leq(&other.registers) && self.fields.leq(&other.fields))
    }

    fn sync_bottom(&mut self) {
        if self.registers.is_bottom() {
            self.fields.set_to_bottom();
        }
    }
}

impl fmt::Display for ConstantEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_bottom() {
            return f.write_str("_|_");
        }
        write!(f, "regs={} fields={}", self.registers, self.fields)
    }
}
