//! Diskbeat wire protocol
//!
//! Shared by the probe, the collector and the devkit:
//! - Telemetry events (write samples and resource usage) and their JSON shape
//! - Newline framing codec for the reporting connection
//! - Heartbeat datagrams and the multicast transport handles that carry them

pub mod codec;
pub mod event;
pub mod heartbeat;
pub mod multicast;

pub use codec::{encode_frame, CodecError, Frame, FrameError, TelemetryCodec, DEFAULT_MAX_FRAME_LEN};
pub use event::{
    DecodeError, Payload, Resource, Sample, TelemetryEvent, MAX_IDENTITY_LEN,
    PERFORMANCE_SUFFIX,
};
pub use heartbeat::{HeartbeatEvent, HeartbeatTime};
pub use multicast::{MulticastReceiver, MulticastSender, MAX_DATAGRAM_LEN};
