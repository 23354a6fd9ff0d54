use super::Generator;

/// Always yields the same value. Used for fixture columns that a later scan
/// filters on.
pub struct Constant<T> {
    value: T,
}

impl<T> Constant<T> {
    pub fn new(value: T) -> Self {
        Constant { value }
    }
}

impl<T: Copy + Send + Sync + 'static> Generator<T> for Constant<T> {
    fn next(&self) -> T {
        self.value
    }
}
