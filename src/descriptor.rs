use std::str::FromStr;

use anyhow::{Context, Result};
use jdescriptor::{MethodDescriptor, TypeDescriptor};

use crate::ir::ValueKind;

/// Value category of a JVM type as far as constant propagation cares.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum TypeCategory {
    Void,
    Int,
    Float,
    Long,
    Double,
    Reference,
}

impl TypeCategory {
    fn of(ty: &TypeDescriptor) -> Self {
        match ty {
            TypeDescriptor::Void => TypeCategory::Void,
            TypeDescriptor::Object(_) | TypeDescriptor::Array(_, _) => TypeCategory::Reference,
            TypeDescriptor::Long => TypeCategory::Long,
            TypeDescriptor::Double => TypeCategory::Double,
            TypeDescriptor::Float => TypeCategory::Float,
            _ => TypeCategory::Int,
        }
    }

    pub(crate) fn is_wide(self) -> bool {
        matches!(self, TypeCategory::Long | TypeCategory::Double)
    }

    /// Runtime checks are only emitted for int-like and reference values.
    pub(crate) fn is_checkable(self) -> bool {
        matches!(self, TypeCategory::Int | TypeCategory::Reference)
    }

    pub(crate) fn value_kind(self) -> ValueKind {
        match self {
            TypeCategory::Reference => ValueKind::Object,
            category if category.is_wide() => ValueKind::Wide,
            _ => ValueKind::Int,
        }
    }
}

/// Categories of the declared parameters, excluding the receiver.
pub(crate) fn parameter_categories(descriptor: &str) -> Result<Vec<TypeCategory>> {
    let descriptor =
        MethodDescriptor::from_str(descriptor).context("parse method descriptor")?;
    Ok(descriptor
        .parameter_types()
        .iter()
        .map(TypeCategory::of)
        .collect())
}

pub(crate) fn return_category(descriptor: &str) -> Result<TypeCategory> {
    let descriptor =
        MethodDescriptor::from_str(descriptor).context("parse method descriptor")?;
    Ok(TypeCategory::of(descriptor.return_type()))
}

/// Category of a field type descriptor such as `I` or `Ljava/lang/String;`.
pub(crate) fn field_category(descriptor: &str) -> Result<TypeCategory> {
    let wrapped = format!("({descriptor})V");
    let parsed = MethodDescriptor::from_str(&wrapped)
        .with_context(|| format!("parse field descriptor {descriptor}"))?;
    let types = parsed.parameter_types();
    if types.len() != 1 {
        anyhow::bail!("field descriptor {descriptor} is not a single type");
    }
    Ok(TypeCategory::of(&types[0]))
}
