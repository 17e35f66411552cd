//! Device topic codec
//!
//! Topics have five `/`-separated segments:
//!
//! ```text
//! <vendor>/<device_type>/<device_sn>/<command_type>/<flag>
//! ```
//!
//! The flag distinguishes direction: `server` is device → backend, `client`
//! is backend → device. Vendors must be registered and device serial numbers
//! are restricted to `[A-Za-z0-9_]+`.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;

/// Registered vendor identifiers
pub const VENDORS: [&str; 3] = ["public", "halcyon", "test"];

/// Vendor used for locally built reply topics
pub const VENDOR_TEST: &str = "test";

/// Number of segments in a device topic
const TOPIC_SEGMENTS: usize = 5;

fn device_sn_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new("^[A-Za-z0-9_]+$").expect("device sn regex"))
}

/// Errors from parsing or validating a topic
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TopicError {
    /// The topic string was empty
    #[error("empty topic")]
    EmptyTopic,

    /// Fewer than five segments
    #[error("topic has {0} segments, need {TOPIC_SEGMENTS}")]
    TooFewSegments(usize),

    /// Vendor is not in the registry
    #[error("unknown vendor: {0}")]
    UnknownVendor(String),

    /// Device serial number fails the `[A-Za-z0-9_]+` pattern
    #[error("bad device sn: {0:?}")]
    BadDeviceSn(String),

    /// Command segment is empty
    #[error("missing command type")]
    MissingCommand,

    /// Flag segment is empty or neither `server` nor `client`
    #[error("missing or invalid flag: {0:?}")]
    MissingFlag(String),
}

/// Direction marker of a topic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicFlag {
    /// Device → backend
    Server,
    /// Backend → device
    Client,
}

impl TopicFlag {
    fn parse(s: &str) -> Result<Self, TopicError> {
        match s {
            "server" => Ok(Self::Server),
            "client" => Ok(Self::Client),
            other => Err(TopicError::MissingFlag(other.to_string())),
        }
    }

    /// The wire segment for this flag
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Server => "server",
            Self::Client => "client",
        }
    }
}

/// A parsed device topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topic {
    /// Registered vendor identifier
    pub vendor: String,
    /// Device model/type code
    pub device_type: String,
    /// Device serial number
    pub device_sn: String,
    /// Command channel, e.g. `voice`
    pub command_type: String,
    /// Direction marker
    pub flag: TopicFlag,
}

impl Topic {
    /// Parse a raw topic string
    ///
    /// # Errors
    ///
    /// Returns a [`TopicError`] describing the first violated constraint.
    pub fn parse(raw: &str) -> Result<Self, TopicError> {
        if raw.is_empty() {
            return Err(TopicError::EmptyTopic);
        }

        let parts: Vec<&str> = raw.split('/').collect();
        if parts.len() < TOPIC_SEGMENTS {
            return Err(TopicError::TooFewSegments(parts.len()));
        }

        let topic = Self {
            vendor: parts[0].to_string(),
            device_type: parts[1].to_string(),
            device_sn: parts[2].to_string(),
            command_type: parts[3].to_string(),
            flag: TopicFlag::parse(parts[4])?,
        };
        topic.validate()?;
        Ok(topic)
    }

    /// Check every segment constraint
    ///
    /// # Errors
    ///
    /// Returns a [`TopicError`] for the first violated constraint.
    pub fn validate(&self) -> Result<(), TopicError> {
        if !VENDORS.contains(&self.vendor.as_str()) {
            return Err(TopicError::UnknownVendor(self.vendor.clone()));
        }
        if self.device_sn.is_empty() || !device_sn_regex().is_match(&self.device_sn) {
            return Err(TopicError::BadDeviceSn(self.device_sn.clone()));
        }
        if self.command_type.is_empty() {
            return Err(TopicError::MissingCommand);
        }
        Ok(())
    }

    /// Render the topic into its wire string
    #[must_use]
    pub fn render(&self) -> String {
        format!(
            "{}/{}/{}/{}/{}",
            self.vendor,
            self.device_type,
            self.device_sn,
            self.command_type,
            self.flag.as_str()
        )
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}
