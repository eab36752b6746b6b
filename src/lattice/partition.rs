use std::collections::BTreeMap;

use crate::callgraph::InvokeSite;
use crate::lattice::environment::Environment;
use crate::lattice::value::ConstantValue;

/// Abstract arguments of a call: parameter index to value.
pub(crate) type ArgumentDomain = Environment<u32>;

/// Key of an [`ArgumentPartition`] binding.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub(crate) enum CallSiteLabel {
    Invoke(InvokeSite),
    /// Arguments the method itself was entered with.
    CurrentFrame,
}

/// Union over execution paths of the arguments seen at each label.
///
/// Unlike an environment, an absent label is Bottom: a call site that is never
/// reached contributes nothing and never poisons its neighbours.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub(crate) struct ArgumentPartition {
    bindings: BTreeMap<CallSiteLabel, ArgumentDomain>,
}

impl ArgumentPartition {
    pub(crate) fn bottom() -> Self {
        Self::default()
    }

    pub(crate) fn get(&self, label: CallSiteLabel) -> ArgumentDomain {
        self.bindings
            .get(&label)
            .cloned()
            .unwrap_or_else(ArgumentDomain::bottom)
    }

    pub(crate) fn set(&mut self, label: CallSiteLabel, arguments: ArgumentDomain) {
        if arguments.is_bottom() {
            self.bindings.remove(&label);
        } else {
            self.bindings.insert(label, arguments);
        }
    }

    pub(crate) fn join_at(&mut self, label: CallSiteLabel, arguments: &ArgumentDomain) {
        let joined = self.get(label).join(arguments);
        self.set(label, joined);
    }

    pub(crate) fn join(&self, other: &Self) -> Self {
        let mut joined = self.clone();
        for (label, arguments) in &other.bindings {
            joined.join_at(*label, arguments);
        }
        joined
    }

    pub(crate) fn leq(&self, other: &Self) -> bool {
        self.bindings
            .iter()
            .all(|(label, arguments)| arguments.leq(&other.get(*label)))
    }

    pub(crate) fn is_bottom(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Value of parameter `index` at `label`.
    pub(crate) fn argument(&self, label: CallSiteLabel, index: u32) -> ConstantValue {
        self.get(label).get(index)
    }
}
