//! PCM receiver: reader thread, jitter queue, drift-corrected playback and reconnects

pub mod controller;
pub mod drift;
pub mod player;
pub mod session;
pub mod status;

pub use controller::PcmReceiver;
pub use drift::DriftController;
pub use player::{Player, PlayerStats, StepOutcome};
pub use session::{connect, run_session};
pub use status::{StatusEvent, StatusKind, StatusPublisher};
