//! Whole-program layer: the per-round summary of field and return values and
//! the round driver that refines it.

use std::collections::BTreeMap;

use crate::dataflow::intraprocedural::IntraproceduralResult;
use crate::hierarchy::MethodId;

pub(crate) mod fixpoint;
pub(crate) mod instance_fields;
pub(crate) mod whole_program;

/// Intraprocedural results of one round, keyed by method. Methods without a
/// body have no entry.
pub(crate) type MethodResults = BTreeMap<MethodId, IntraproceduralResult>;
