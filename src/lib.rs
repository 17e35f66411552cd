//! voxrelay - MQTT voice dialog gateway for IoT devices
//!
//! Devices publish framed audio utterances over MQTT; the gateway
//! transcribes, classifies, chats via a streaming LLM, synthesizes speech per
//! sentence, and streams the audio back to the originating device, metering
//! token cost into a durable ledger.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                      Devices                         │
//! │        frame codec ── MQTT ── topic scheme           │
//! └───────────────────────┬──────────────────────────────┘
//!                         │
//! ┌───────────────────────▼──────────────────────────────┐
//! │                  voxrelay gateway                    │
//! │  transport │ middleware │ fragments │ pipeline       │
//! │  segmenter │ egress     │ metering  │ admin api      │
//! └───────────────────────┬──────────────────────────────┘
//!                         │
//! ┌───────────────────────▼──────────────────────────────┐
//! │                 Model services                       │
//! │        ASR │ NLU │ LLM (streaming) │ TTS             │
//! └──────────────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod config;
pub mod daemon;
pub mod db;
pub mod egress;
pub mod error;
pub mod fragment;
pub mod metering;
pub mod pipeline;
pub mod protocol;
pub mod providers;
pub mod ratelimit;
pub mod segmenter;
pub mod transport;

pub use config::{Config, ConfigHandle};
pub use daemon::Daemon;
pub use error::{Error, Result};
pub use fragment::FragmentManager;
pub use pipeline::DialogPipeline;
pub use protocol::{FrameHeader, Topic};
