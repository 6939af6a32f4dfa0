pub mod float_ext;
pub mod log_setup;
pub mod parallel;
pub mod serde;
pub mod shared_fn;

pub use shared_fn::SharedFn;

pub const EPSILON: f64 = 1e-6;
