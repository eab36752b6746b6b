use std::fmt;

use crate::error::CpError;
use crate::hierarchy::{FieldId, Symbol};
use crate::lattice::interval::SignInterval;

/// Abstract value of one register, field or return slot.
///
/// Integers are tracked as an exact constant or as a sign interval; references
/// reuse the same carrier with zero standing for `null`. Handles denote known
/// non-null objects whose identity is fixed for the whole run, which lets the
/// analysis decide equality tests on them.
///
/// Representation invariants: `Interval` never holds `Empty`, `Eqz` or `All`
/// (those are `Bottom`, `Exact(0)` and `Top`), so equal abstract values have
/// equal representations.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub(crate) enum ConstantValue {
    Bottom,
    Exact(i64),
    Interval(SignInterval),
    Class(Symbol),
    String(Symbol),
    EnumField(FieldId),
    BoxedBoolean(bool),
    Top,
}

impl Default for ConstantValue {
    fn default() -> Self {
        ConstantValue::Top
    }
}

impl ConstantValue {
    pub(crate) fn top() -> Self {
        ConstantValue::Top
    }

    pub(crate) fn bottom() -> Self {
        ConstantValue::Bottom
    }

    pub(crate) fn of_int(value: i64) -> Self {
        ConstantValue::Exact(value)
    }

    /// Lift a constant-table integer; anything outside the signed 64-bit range
    /// cannot be represented.
    pub(crate) fn of_encoded(value: i128) -> Result<Self, CpError> {
        let exact = i64::try_from(value).map_err(|_| {
            CpError::InvalidEncoding(format!("integer {value} does not fit in 64 bits"))
        })?;
        Ok(ConstantValue::Exact(exact))
    }

    pub(crate) fn of_interval(interval: SignInterval) -> Self {
        match interval {
            SignInterval::Empty => ConstantValue::Bottom,
            SignInterval::Eqz => ConstantValue::Exact(0),
            SignInterval::All => ConstantValue::Top,
            other => ConstantValue::Interval(other),
        }
    }

    pub(crate) fn of_class(class: Symbol) -> Self {
        ConstantValue::Class(class)
    }

    pub(crate) fn of_string(string: Symbol) -> Self {
        ConstantValue::String(string)
    }

    pub(crate) fn of_enum_field(field: FieldId) -> Self {
        ConstantValue::EnumField(field)
    }

    pub(crate) fn of_boxed_boolean(value: bool) -> Self {
        ConstantValue::BoxedBoolean(value)
    }

    pub(crate) fn non_null() -> Self {
        ConstantValue::Interval(SignInterval::Nez)
    }

    pub(crate) fn is_bottom(&self) -> bool {
        matches!(self, ConstantValue::Bottom)
    }

    pub(crate) fn is_top(&self) -> bool {
        matches!(self, ConstantValue::Top)
    }

    pub(crate) fn is_handle(&self) -> bool {
        matches!(
            self,
            ConstantValue::Class(_)
                | ConstantValue::String(_)
                | ConstantValue::EnumField(_)
                | ConstantValue::BoxedBoolean(_)
        )
    }

    pub(crate) fn get_constant(&self) -> Option<i64> {
        match self {
            ConstantValue::Exact(value) => Some(*value),
            _ => None,
        }
    }

    pub(crate) fn get_interval(&self) -> SignInterval {
        match self {
            ConstantValue::Bottom => SignInterval::Empty,
            ConstantValue::Exact(value) => SignInterval::of_value(*value),
            ConstantValue::Interval(interval) => *interval,
            ConstantValue::Top => SignInterval::All,
            _ => SignInterval::Nez,
        }
    }

    pub(crate) fn join(&self, other: &Self) -> Self {
        match (self, other) {
            (ConstantValue::Bottom, value) | (value, ConstantValue::Bottom) => *value,
            (ConstantValue::Top, _) | (_, ConstantValue::Top) => ConstantValue::Top,
            (left, right) if left == right => *left,
            (left, right) => {
                ConstantValue::of_interval(left.get_interval().join(right.get_interval()))
            }
        }
    }

    pub(crate) fn meet(&self, other: &Self) -> Self {
        match (self, other) {
            (ConstantValue::Top, value) | (value, ConstantValue::Top) => *value,
            (ConstantValue::Bottom, _) | (_, ConstantValue::Bottom) => ConstantValue::Bottom,
            (left, right) if left == right => *left,
            (ConstantValue::Exact(value), ConstantValue::Interval(interval))
            | (ConstantValue::Interval(interval), ConstantValue::Exact(value)) => {
                if interval.contains(*value) {
                    ConstantValue::Exact(*value)
                } else {
                    ConstantValue::Bottom
                }
            }
            (ConstantValue::Interval(left), ConstantValue::Interval(right)) => {
                ConstantValue::of_interval(left.meet(*right))
            }
            (handle, ConstantValue::Interval(interval))
            | (ConstantValue::Interval(interval), handle)
                if handle.is_handle() && SignInterval::Nez.leq(*interval) =>
            {
                *handle
            }
            _ => ConstantValue::Bottom,
        }
    }

    pub(crate) fn leq(&self, other: &Self) -> bool {
        self.meet(other) == *self
    }

    /// Intersect with an interval; used for branch and switch refinement.
    pub(crate) fn refine(&self, interval: SignInterval) -> Self {
        self.meet(&ConstantValue::of_interval(interval))
    }

    /// Whether two runtime values described by `self` and `other` are certainly
    /// identical (`Some(true)`), certainly different (`Some(false)`), or unknown.
    ///
    /// Handles compare by identity: enum singletons, the two boxed booleans,
    /// interned strings and class objects are each unique per value.
    pub(crate) fn runtime_equals(&self, other: &Self) -> Option<bool> {
        if self.is_bottom() || other.is_bottom() {
            return None;
        }
        match (self, other) {
            (ConstantValue::Exact(left), ConstantValue::Exact(right)) => Some(left == right),
            (left, right) if left.is_handle() && right.is_handle() => Some(left == right),
            _ => {
                if self.get_interval().meet(other.get_interval()).is_empty() {
                    Some(false)
                } else {
                    None
                }
            }
        }
    }
}

impl fmt::Display for ConstantValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConstantValue::Bottom => f.write_str("_|_"),
            ConstantValue::Top => f.write_str("T"),
            ConstantValue::Exact(value) => write!(f, "{value}"),
            ConstantValue::Interval(interval) => write!(f, "{interval}"),
            ConstantValue::Class(symbol) => write!(f, "class#{}", symbol.0),
            ConstantValue::String(symbol) => write!(f, "string#{}", symbol.0),
            ConstantValue::EnumField(field) => write!(f, "enum#{}", field.0),
            ConstantValue::BoxedBoolean(value) => write!(f, "Boolean.{}", if *value { "TRUE" } else { "FALSE" }),
        }
    }
}
