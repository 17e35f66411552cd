//! Ingress middleware chain
//!
//! Every inbound message passes an ordered list of filters before it reaches
//! the dialog pipeline. A filter returning `false` short-circuits the chain
//! and the message is dropped. The chain is assembled once at startup.

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use super::InboundMessage;
use crate::db::DeviceRepo;
use crate::protocol::Topic;
use crate::ratelimit::RateLimiter;

/// Mutable per-message state accumulated along the chain
#[derive(Debug, Default)]
pub struct MessageContext {
    /// Correlates all logs and background work for one message
    pub trace_id: String,
    /// Parsed topic, set by the device identifier filter
    pub topic: Option<Topic>,
    /// Device serial number, set by the device identifier filter
    pub device_sn: Option<String>,
}

impl MessageContext {
    /// Fresh context with a generated trace id
    #[must_use]
    pub fn new() -> Self {
        Self {
            trace_id: Uuid::new_v4().to_string(),
            topic: None,
            device_sn: None,
        }
    }
}

/// One link of the ingress chain
#[async_trait]
pub trait IngressFilter: Send + Sync {
    /// Inspect a message; `false` drops it and stops the chain
    async fn process(&self, ctx: &mut MessageContext, message: &InboundMessage) -> bool;
}

/// Ordered, short-circuiting filter chain
#[derive(Default)]
pub struct IngressChain {
    filters: Vec<Box<dyn IngressFilter>>,
}

impl IngressChain {
    /// An empty chain
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a filter
    #[must_use]
    pub fn with(mut self, filter: Box<dyn IngressFilter>) -> Self {
        self.filters.push(filter);
        self
    }

    /// Run the chain; `false` when some filter dropped the message
    pub async fn process(&self, ctx: &mut MessageContext, message: &InboundMessage) -> bool {
        for filter in &self.filters {
            if !filter.process(ctx, message).await {
                tracing::info!(
                    trace_id = %ctx.trace_id,
                    topic = %message.topic,
                    "ingress chain stopped"
                );
                return false;
            }
        }
        true
    }
}

/// Parses the topic and stores the device serial number in the context
pub struct DeviceIdentifier;

#[async_trait]
impl IngressFilter for DeviceIdentifier {
    async fn process(&self, ctx: &mut MessageContext, message: &InboundMessage) -> bool {
        match Topic::parse(&message.topic) {
            Ok(topic) => {
                ctx.device_sn = Some(topic.device_sn.clone());
                ctx.topic = Some(topic);
                true
            }
            Err(e) => {
                tracing::error!(
                    error = %e,
                    trace_id = %ctx.trace_id,
                    topic = %message.topic,
                    "topic parse failed"
                );
                false
            }
        }
    }
}

/// Drops messages from devices over their token budget
pub struct RateLimitFilter {
    limiter: Arc<RateLimiter>,
}

impl RateLimitFilter {
    /// Wrap a configured limiter
    #[must_use]
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self { limiter }
    }
}

#[async_trait]
impl IngressFilter for RateLimitFilter {
    async fn process(&self, ctx: &mut MessageContext, message: &InboundMessage) -> bool {
        let Some(device_sn) = ctx.device_sn.as_deref() else {
            return true;
        };
        if self.limiter.allow(device_sn).await {
            return true;
        }
        tracing::warn!(
            device_sn = %device_sn,
            trace_id = %ctx.trace_id,
            topic = %message.topic,
            "Rate limit exceeded"
        );
        false
    }
}

/// Rejects devices missing from the registry; a no-op when no registry is
/// configured
pub struct Authenticator {
    devices: Option<DeviceRepo>,
}

impl Authenticator {
    /// Authenticate against a device registry, or pass everything when
    /// `devices` is `None`
    #[must_use]
    pub fn new(devices: Option<DeviceRepo>) -> Self {
        Self { devices }
    }
}

#[async_trait]
impl IngressFilter for Authenticator {
    async fn process(&self, ctx: &mut MessageContext, message: &InboundMessage) -> bool {
        let Some(repo) = &self.devices else {
            return true;
        };
        let Some(device_sn) = ctx.device_sn.as_deref() else {
            return true;
        };

        match repo.exists(device_sn) {
            Ok(true) => true,
            Ok(false) => {
                tracing::warn!(
                    device_sn = %device_sn,
                    trace_id = %ctx.trace_id,
                    topic = %message.topic,
                    "unknown device rejected"
                );
                false
            }
            Err(e) => {
                // registry trouble must not take down the voice path
                tracing::error!(error = %e, device_sn = %device_sn, "device lookup failed");
                true
            }
        }
    }
}
