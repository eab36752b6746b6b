use std::fmt;

/// Sign abstraction of an integer (or of a reference, where zero is null).
///
/// Encoded as a set over {negative, zero, positive}; join is union and meet is
/// intersection, which makes both tables commutative and idempotent by
/// construction.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub(crate) enum SignInterval {
    Empty,
    Ltz,
    Lez,
    Eqz,
    Nez,
    Gez,
    Gtz,
    All,
}

const NEG: u8 = 0b001;
const ZERO: u8 = 0b010;
const POS: u8 = 0b100;

impl SignInterval {
    fn bits(self) -> u8 {
        match self {
            SignInterval::Empty => 0,
            SignInterval::Ltz => NEG,
            SignInterval::Eqz => ZERO,
            SignInterval::Gtz => POS,
            SignInterval::Lez => NEG | ZERO,
            SignInterval::Nez => NEG | POS,
            SignInterval::Gez => ZERO | POS,
            SignInterval::All => NEG | ZERO | POS,
        }
    }

    fn from_bits(bits: u8) -> Self {
        match bits & (NEG | ZERO | POS) {
            0 => SignInterval::Empty,
            NEG => SignInterval::Ltz,
            ZERO => SignInterval::Eqz,
            POS => SignInterval::Gtz,
            b if b == NEG | ZERO => SignInterval::Lez,
            b if b == NEG | POS => SignInterval::Nez,
            b if b == ZERO | POS => SignInterval::Gez,
            _ => SignInterval::All,
        }
    }

    /// Narrowest interval containing `value`.
    pub(crate) fn of_value(value: i64) -> Self {
        match value.signum() {
            -1 => SignInterval::Ltz,
            0 => SignInterval::Eqz,
            _ => SignInterval::Gtz,
        }
    }

    pub(crate) fn join(self, other: Self) -> Self {
        Self::from_bits(self.bits() | other.bits())
    }

    pub(crate) fn meet(self, other: Self) -> Self {
        Self::from_bits(self.bits() & other.bits())
    }

    pub(crate) fn leq(self, other: Self) -> bool {
        self.bits() & !other.bits() == 0
    }

    pub(crate) fn contains(self, value: i64) -> bool {
        Self::of_value(value).leq(self)
    }

    pub(crate) fn is_empty(self) -> bool {
        self == SignInterval::Empty
    }

    /// Interval of `-x` for every `x` in `self`, ignoring the `MIN` wrap-around.
    pub(crate) fn mirrored(self) -> Self {
        let bits = self.bits();
        let mut mirrored = bits & ZERO;
        if bits & NEG != 0 {
            mirrored |= POS;
        }
        if bits & POS != 0 {
            mirrored |= NEG;
        }
        Self::from_bits(mirrored)
    }

    /// Interval of the values `x` with `x <cond> 0`, i.e. the refinement an
    /// `if-<cond>z` branch imposes on its operand when taken.
    pub(crate) fn of_zero_test(cond: crate::ir::IfCond) -> Self {
        use crate::ir::IfCond;
        match cond {
            IfCond::Eq => SignInterval::Eqz,
            IfCond::Ne => SignInterval::Nez,
            IfCond::Lt => SignInterval::Ltz,
            IfCond::Le => SignInterval::Lez,
            IfCond::Gt => SignInterval::Gtz,
            IfCond::Ge => SignInterval::Gez,
        }
    }
}

impl fmt::Display for SignInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SignInterval::Empty => "EMPTY",
            SignInterval::Ltz => "LTZ",
            SignInterval::Lez => "LEZ",
            SignInterval::Eqz => "EQZ",
            SignInterval::Nez => "NEZ",
            SignInterval::Gez => "GEZ",
            SignInterval::Gtz => "GTZ",
            SignInterval::All => "ALL",
        };
        f.write_str(label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::IfCond;

    const ALL_INTERVALS: [SignInterval; 8] = [
        SignInterval::Empty,
        SignInterval::Ltz,
        SignInterval::Lez,
        SignInterval::Eqz,
        SignInterval::Nez,
        SignInterval::Gez,
        SignInterval::Gtz,
        SignInterval::All,
    ];

    #[test]
    fn join_with_eqz_matches_table() {
        let expected = [
            (SignInterval::Ltz, SignInterval::Lez),
            (SignInterval::Lez, SignInterval::Lez),
            (SignInterval::Eqz, SignInterval::Eqz),
            (SignInterval::Nez, SignInterval::All),
            (SignInterval::Gez, SignInterval::Gez),
            (SignInterval::Gtz, SignInterval::Gez),
            (SignInterval::All, SignInterval::All),
        ];
        for (input, output) in expected {
            assert_eq!(input.join(SignInterval::Eqz), output, "{input} join EQZ");
        }
    }

    #[test]
    fn meet_with_nez_matches_table() {
        let expected = [
            (SignInterval::Ltz, SignInterval::Ltz),
            (SignInterval::Lez, SignInterval::Ltz),
            (SignInterval::Eqz, SignInterval::Empty),
            (SignInterval::Nez, SignInterval::Nez),
            (SignInterval::Gez, SignInterval::Gtz),
            (SignInterval::Gtz, SignInterval::Gtz),
            (SignInterval::All, SignInterval::Nez),
        ];
        for (input, output) in expected {
            assert_eq!(input.meet(SignInterval::Nez), output, "{input} meet NEZ");
        }
    }

    #[test]
    fn tables_are_commutative_and_idempotent() {
        for left in ALL_INTERVALS {
            assert_eq!(left.join(left), left);
            assert_eq!(left.meet(left), left);
            for right in ALL_INTERVALS {
                assert_eq!(left.join(right), right.join(left));
                assert_eq!(left.meet(right), right.meet(left));
                assert!(left.meet(right).leq(left));
                assert!(left.leq(left.join(right)));
            }
        }
    }

    #[test]
    fn zero_tests_partition_the_line() {
        for cond in [IfCond::Eq, IfCond::Lt, IfCond::Le] {
            let taken = SignInterval::of_zero_test(cond);
            let fallthrough = SignInterval::of_zero_test(cond.negate());
            assert_eq!(taken.join(fallthrough), SignInterval::All);
            assert_eq!(taken.meet(fallthrough), SignInterval::Empty);
        }
    }

    #[test]
    fn mirrored_swaps_signs() {
        assert_eq!(SignInterval::Gez.mirrored(), SignInterval::Lez);
        assert_eq!(SignInterval::Nez.mirrored(), SignInterval::Nez);
        assert!(SignInterval::Gtz.contains(5));
        assert!(!SignInterval::Gtz.contains(0));
    }
}
