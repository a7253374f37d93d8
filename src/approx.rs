//! Utilities to approximate equality of floating point values and tensors.

use crate::tensors::Tensor;

/// The max epsilon accepted on `f32`s.
pub const F32_MAX_ERROR: f32 = 1e-3;

/// The expected minimum epsilon accepted on `f32`s.
pub const F32_AVG_ERROR: f32 = 1e-5;

/// The best expected epsilon accepted on `f32`s.
pub const F32_MIN_ERROR: f32 = 1e-6;

/// The approximated equality enumerated, best first.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ApproxEquality {
    /// Very strong epsilon.
    Precise = 0,

    /// Good epsilon.
    Partial = 1,

    /// Acceptable epsilon.
    Relative = 2,

    /// No relative equality.
    Scarce = 3,
}

/// Checks the distance between two values against the epsilons above.
pub trait RelativeEq<Rhs: ?Sized = Self> {
    /// Enumerates the equality of `self` and `rhs`.
    fn approx_eq(&self, rhs: &Rhs) -> ApproxEquality;
}

impl RelativeEq for f32 {
    fn approx_eq(&self, rhs: &Self) -> ApproxEquality {
        let dif = (self - rhs).abs();
        // scale the tolerance for large magnitudes
        let scale = self.abs().max(rhs.abs()).max(1.0);

        if dif < F32_MIN_ERROR * scale {
            ApproxEquality::Precise
        } else if dif < F32_AVG_ERROR * scale {
            ApproxEquality::Partial
        } else if dif < F32_MAX_ERROR * scale {
            ApproxEquality::Relative
        } else {
            ApproxEquality::Scarce
        }
    }
}

/// The worst rating over all pairs; slices of different lengths are `Scarce`.
impl RelativeEq for [f32] {
    fn approx_eq(&self, rhs: &Self) -> ApproxEquality {
        if self.len() != rhs.len() {
            return ApproxEquality::Scarce;
        }
        let mut eq = ApproxEquality::Precise;
        for (a, b) in self.iter().zip(rhs) {
            eq = eq.max(a.approx_eq(b));
            if eq == ApproxEquality::Scarce {
                break;
            }
        }
        eq
    }
}

impl<const N: usize> RelativeEq for [f32; N] {
    fn approx_eq(&self, rhs: &Self) -> ApproxEquality {
        self.as_slice().approx_eq(rhs.as_slice())
    }
}

/// Tensors of different shapes are `Scarce`.
impl RelativeEq for Tensor {
    fn approx_eq(&self, rhs: &Self) -> ApproxEquality {
        if self.shape() != rhs.shape() {
            return ApproxEquality::Scarce;
        }
        self.data().as_slice().approx_eq(rhs.data().as_slice())
    }
}

/// Whether `a` and `b` are at least [`ApproxEquality::Relative`].
pub fn approx_eq<A: RelativeEq<B> + ?Sized, B: ?Sized>(a: &A, b: &B) -> bool {
    a.approx_eq(b) <= ApproxEquality::Relative
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ratings() {
        assert_eq!(1.0f32.approx_eq(&1.0), ApproxEquality::Precise);
        assert_eq!(1.0f32.approx_eq(&1.000_1), ApproxEquality::Relative);
        assert_eq!(1.0f32.approx_eq(&1.1), ApproxEquality::Scarce);
    }

    #[test]
    fn worst_pair_wins() {
        let a: [f32; 3] = [1.0, 2.0, 3.0];
        let b: [f32; 3] = [1.0, 2.000_5, 3.0];
        assert_eq!(a.approx_eq(&b), ApproxEquality::Relative);
        assert!(approx_eq(&a, &b));
        assert!(!approx_eq(&a, &[1.0f32, 2.5, 3.0]));
    }

    #[test]
    fn tensors_compare_shape_first() {
        let a = Tensor::ones([2, 2]);
        let b = Tensor::ones([4]);
        assert_eq!(a.approx_eq(&b), ApproxEquality::Scarce);
        assert!(approx_eq(&a, &a.deep_clone()));
    }
}
