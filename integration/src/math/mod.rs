//! Numerical building blocks: robust statistics, line fitting and noise
//! estimation.

pub mod linear_fit;
pub mod noise;
pub mod statistics;

pub use linear_fit::LinearFit;
pub use noise::{NoiseEstimate, evaluate_noise, snr};
pub use statistics::{LocationScale, ikss};
