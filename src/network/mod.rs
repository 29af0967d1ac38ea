//! Network subsystem: raw PCM over TCP and UDP discovery

pub mod discovery;
pub mod tcp;

pub use discovery::{probe, DiscoveryReply, DiscoveryResponder};
pub use tcp::{encode_pcm_frame, stream_pcm, PcmServer, PCM_HEADER_BYTES};
