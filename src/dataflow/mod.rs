//! Intraprocedural constant propagation: the analyzer chain and the
//! block-level fixpoint it runs in.

pub(crate) mod analyzer;
pub(crate) mod boxed_boolean;
pub(crate) mod branch;
pub(crate) mod clinit;
pub(crate) mod enum_field;
pub(crate) mod intraprocedural;
pub(crate) mod primitive;
pub(crate) mod whole_program_aware;
pub(crate) mod worklist;
