pub mod power;
pub mod resample;

pub use power::derive_power;
pub use resample::Resampler;
