mod constant;
mod uniform;

pub use constant::Constant;
pub use uniform::{UniformF32, UniformI32};

pub trait Generator<T>: 'static + std::marker::Send + std::marker::Sync {
    fn next(&self) -> T;
}
