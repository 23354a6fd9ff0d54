use rand::{thread_rng, Rng};

use super::Generator;

/// Uniform over every `i32`, bounds included.
pub struct UniformI32;

impl Generator<i32> for UniformI32 {
    fn next(&self) -> i32 {
        thread_rng().gen::<i32>()
    }
}

/// Spans the full finite `f32` range in both signs. With probability
/// `extreme_proportion` the value is one of the representable edges instead
/// (min/max, smallest normal, smallest subnormal, signed zero).
pub struct UniformF32 {
    extreme_proportion: f64,
}

impl UniformF32 {
    /// `extreme_proportion` must lie in `[0, 1]`.
    pub fn new(extreme_proportion: f64) -> Option<Self> {
        if (0.0..=1.0).contains(&extreme_proportion) {
            Some(UniformF32 { extreme_proportion })
        } else {
            None
        }
    }
}

fn edge_value(idx: usize) -> f32 {
    match idx {
        0 => f32::MIN,
        1 => f32::MAX,
        2 => f32::MIN_POSITIVE,
        3 => -f32::MIN_POSITIVE,
        4 => f32::from_bits(1),
        5 => -f32::from_bits(1),
        6 => 0.0,
        _ => -0.0,
    }
}

const EDGE_VALUES: usize = 8;

impl Generator<f32> for UniformF32 {
    fn next(&self) -> f32 {
        let mut rng = thread_rng();
        if rng.gen_bool(self.extreme_proportion) {
            return edge_value(rng.gen_range(0..EDGE_VALUES));
        }
        // max - min overflows to infinity, so draw a magnitude and a sign.
        let magnitude = rng.gen::<f32>() * f32::MAX;
        if rng.gen::<bool>() {
            -magnitude
        } else {
            magnitude
        }
    }
}
