//! Binary wire protocol for device communication
//!
//! Two pure codecs live here: the 12-byte voice frame header that prefixes
//! every audio payload, and the five-segment MQTT topic scheme devices
//! publish on. Neither owns any state.

pub mod frame;
pub mod topic;

pub use frame::{
    build_full, build_stream, decode, encode, AudioProfile, FrameError, FrameHeader, FrameType,
    HEADER_LEN,
};
pub use topic::{Topic, TopicError, TopicFlag};
