pub mod calibration;
pub mod chirp;
pub mod config;
pub mod http;
pub mod playback;

pub use calibration::*;
pub use config::ReceiverConfig;
pub use playback::*;
