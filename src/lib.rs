pub mod announce;
pub mod audio;
pub mod clock_sync;
pub mod config;
pub mod display;
pub mod net;
pub mod protocol;
pub mod rally;
pub mod runtime;
pub mod session;
pub mod speech;
pub mod status;
pub mod traits;
