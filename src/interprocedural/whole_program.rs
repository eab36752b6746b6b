use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::callgraph::{CallGraph, CallGraphMode};
use crate::hierarchy::{FieldId, MethodId, ProgramIndex};
use crate::interprocedural::MethodResults;
use crate::ir::{Instruction, Program};
use crate::lattice::ConstantValue;

/// Summary of every static field, refined instance field and method return,
/// rebuilt at each round boundary and read-only while a round runs.
///
/// Absent entries are Top; storing Top removes the entry, so two states that
/// describe the same values compare equal.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub(crate) struct WholeProgramState {
    fields: BTreeMap<FieldId, ConstantValue>,
    instance_fields: BTreeMap<FieldId, ConstantValue>,
    returns: BTreeMap<MethodId, ConstantValue>,
}

fn bind<K: Ord>(map: &mut BTreeMap<K, ConstantValue>, key: K, value: ConstantValue) {
    if value.is_top() {
        map.remove(&key);
    } else {
        map.insert(key, value);
    }
}

fn lookup<K: Ord>(map: &BTreeMap<K, ConstantValue>, key: &K) -> ConstantValue {
    map.get(key).copied().unwrap_or_else(ConstantValue::top)
}

fn map_leq<K: Ord>(left: &BTreeMap<K, ConstantValue>, right: &BTreeMap<K, ConstantValue>) -> bool {
    right
        .iter()
        .all(|(key, value)| lookup(left, key).leq(value))
}

fn is_constant(value: &ConstantValue) -> bool {
    value.get_constant().is_some() || value.is_handle()
}

impl WholeProgramState {
    /// The state that knows nothing; used for round 0.
    pub(crate) fn top() -> Self {
        Self::default()
    }

    pub(crate) fn field_value(&self, field: FieldId) -> ConstantValue {
        lookup(&self.fields, &field)
    }

    pub(crate) fn instance_field_value(&self, field: FieldId) -> ConstantValue {
        lookup(&self.instance_fields, &field)
    }

    pub(crate) fn return_value(&self, method: MethodId) -> ConstantValue {
        lookup(&self.returns, &method)
    }

    pub(crate) fn set_field_value(&mut self, field: FieldId, value: ConstantValue) {
        bind(&mut self.fields, field, value);
    }

    pub(crate) fn set_instance_field_value(&mut self, field: FieldId, value: ConstantValue) {
        bind(&mut self.instance_fields, field, value);
    }

    pub(crate) fn set_return_value(&mut self, method: MethodId, value: ConstantValue) {
        bind(&mut self.returns, method, value);
    }

    /// Pointwise order: `self` is at least as precise as `other`.
    pub(crate) fn leq(&self, other: &Self) -> bool {
        map_leq(&self.fields, &other.fields)
            && map_leq(&self.instance_fields, &other.instance_fields)
            && map_leq(&self.returns, &other.returns)
    }

    /// Static fields bound to something other than Top.
    pub(crate) fn fields(&self) -> impl Iterator<Item = (FieldId, ConstantValue)> + '_ {
        self.fields.iter().map(|(field, value)| (*field, *value))
    }

    /// Methods whose return is bound to something other than Top.
    pub(crate) fn returns(&self) -> impl Iterator<Item = (MethodId, ConstantValue)> + '_ {
        self.returns.iter().map(|(method, value)| (*method, *value))
    }

    /// Static fields holding one known value.
    pub(crate) fn constant_field_count(&self) -> usize {
        self.fields.values().filter(|value| is_constant(value)).count()
    }

    /// Methods returning one known value.
    pub(crate) fn constant_method_count(&self) -> usize {
        self.returns.values().filter(|value| is_constant(value)).count()
    }
}

/// Join of the values `method` stores into `field` on reachable paths.
/// `None` means the stores cannot be accounted for.
fn stored_values(
    program: &Program,
    index: &ProgramIndex,
    results: &MethodResults,
    method: MethodId,
    field: FieldId,
) -> Option<ConstantValue> {
    let cfg = index.code(program, method)?;
    let result = results.get(&method)?;
    let mut joined = ConstantValue::bottom();
    for block in &cfg.blocks {
        for (position, instruction) in block.instructions.iter().enumerate() {
            let (src, reference) = match instruction {
                Instruction::Sput { src, field, .. } | Instruction::Iput { src, field, .. } => {
                    (*src, field)
                }
                _ => continue,
            };
            if index.resolve_field(reference) != Some(field) {
                continue;
            }
            let state = result.state_before(block.id, position);
            if !state.is_bottom() {
                joined = joined.join(&state.get(src));
            }
        }
    }
    Some(joined)
}

fn static_field_value(
    program: &Program,
    index: &ProgramIndex,
    results: &MethodResults,
    field: FieldId,
) -> ConstantValue {
    let info = index.field(field);
    let class = index.class(info.class);
    if index.is_root_field(field) || class.has_native_method {
        return ConstantValue::top();
    }
    let mut value = match class.clinit {
        None => info.initial_value,
        Some(clinit) => match results.get(&clinit) {
            Some(result) => result.exit_fields().get(field),
            None => return ConstantValue::top(),
        },
    };
    for writer in index.writers(field) {
        if Some(*writer) == class.clinit {
            continue;
        }
        match stored_values(program, index, results, *writer, field) {
            Some(stored) => value = value.join(&stored),
            None => {
                debug!(
                    "{} is written by {} without a result; widening",
                    index.field_label(field),
                    index.method_label(*writer)
                );
                return ConstantValue::top();
            }
        }
    }
    value
}

/// Join of everything stored into an instance field. The binding survives
/// only when it rules out `null`, which is what the constructor facts promise.
fn instance_field_value(
    program: &Program,
    index: &ProgramIndex,
    results: &MethodResults,
    field: FieldId,
) -> ConstantValue {
    let mut value = ConstantValue::bottom();
    for writer in index.writers(field) {
        match stored_values(program, index, results, *writer, field) {
            Some(stored) => value = value.join(&stored),
            None => return ConstantValue::top(),
        }
    }
    if value.leq(&ConstantValue::non_null()) {
        value
    } else {
        ConstantValue::top()
    }
}

/// Virtual methods whose dispatch family has more than one concrete
/// definition. A single-callee graph leaves their call sites unlinked.
fn polymorphic_methods(index: &ProgramIndex) -> BTreeSet<MethodId> {
    let mut methods = BTreeSet::new();
    for method in index.method_ids() {
        if !index.method(method).is_virtual() || index.overrides(method).is_empty() {
            continue;
        }
        let family: Vec<MethodId> = std::iter::once(method)
            .chain(index.overrides(method).iter().copied())
            .filter(|member| !index.method(*member).is_abstract)
            .collect();
        if family.len() > 1 {
            methods.extend(family);
        }
    }
    methods
}

/// Build the next round's state from this round's intraprocedural results.
///
/// `initialised_fields` are the instance fields every constructor assigns
/// before `this` can be observed; other instance fields stay Top.
pub(crate) fn build_whole_program_state(
    program: &Program,
    index: &ProgramIndex,
    call_graph: &CallGraph,
    results: &MethodResults,
    initialised_fields: &BTreeSet<FieldId>,
) -> WholeProgramState {
    let mut state = WholeProgramState::top();
    for field in index.field_ids() {
        if index.field(field).is_static {
            state.set_field_value(field, static_field_value(program, index, results, field));
        } else if initialised_fields.contains(&field) {
            state.set_instance_field_value(
                field,
                instance_field_value(program, index, results, field),
            );
        }
    }
    let polymorphic = match call_graph.mode() {
        CallGraphMode::SingleCallee => polymorphic_methods(index),
        CallGraphMode::MultipleCallee => BTreeSet::new(),
    };
    for method in index.method_ids() {
        if index.is_root_method(method) || polymorphic.contains(&method) {
            continue;
        }
        if let Some(result) = results.get(&method) {
            state.set_return_value(method, result.return_value());
        }
    }
    state
}
