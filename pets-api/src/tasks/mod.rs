pub mod half_cheetah;

pub use half_cheetah::HalfCheetahTask;
