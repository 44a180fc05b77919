pub mod messages;
pub mod calibration;
pub mod synth;

pub use messages::*;
pub use calibration::*;
