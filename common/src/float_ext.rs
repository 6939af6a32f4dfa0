pub trait FloatExt: Copy {
    fn approximately_eq(self, other: Self) -> bool;

    /// True when adding the value to one does not change one, i.e. the value
    /// vanishes at this precision (`1 + x == 1`).
    fn is_insignificant(self) -> bool;
}

impl FloatExt for f32 {
    fn approximately_eq(self, other: Self) -> bool {
        (self - other).abs() < crate::EPSILON as f32
    }

    fn is_insignificant(self) -> bool {
        1.0 + self == 1.0
    }
}

impl FloatExt for f64 {
    fn approximately_eq(self, other: Self) -> bool {
        (self - other).abs() < crate::EPSILON
    }

    fn is_insignificant(self) -> bool {
        1.0 + self == 1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn f32_approximately_eq() {
        assert!(1.0_f32.approximately_eq(1.0));
        assert!((0.1_f32 + 0.2_f32).approximately_eq(0.3));
        assert!(!1.0_f32.approximately_eq(1.001));
    }

    #[test]
    fn f64_approximately_eq() {
        assert!(1.0_f64.approximately_eq(1.0));
        assert!(!1.0_f64.approximately_eq(1.0001));
    }

    #[test]
    fn nan_is_never_equal() {
        assert!(!f32::NAN.approximately_eq(f32::NAN));
        assert!(!f64::NAN.approximately_eq(0.0));
    }

    #[test]
    fn insignificant_values() {
        assert!(0.0_f64.is_insignificant());
        assert!(1e-17_f64.is_insignificant());
        assert!(!1e-10_f64.is_insignificant());
        assert!(1e-9_f32.is_insignificant());
        assert!(!1e-3_f32.is_insignificant());
    }

    #[test]
    fn nan_is_not_insignificant() {
        assert!(!f64::NAN.is_insignificant());
    }
}
