//! Daemon - the gateway service
//!
//! Wires configuration, persistence, model clients, the middleware chain,
//! the dialog pipeline, the MQTT transport, and the admin API, then runs
//! until shut down. Initialization order matters: configuration first, then
//! storage, then clients, then the chain, then the transport.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::api::{self, ApiState};
use crate::config::ConfigHandle;
use crate::db::{self, DeviceRepo};
use crate::egress::{EgressPublisher, LazyPublisher, RegistryResolver};
use crate::fragment::FragmentManager;
use crate::metering::{CostCalculator, Metering, SqliteLedger};
use crate::pipeline::DialogPipeline;
use crate::protocol::{AudioProfile, TopicFlag};
use crate::providers::{AsrClient, ChatClient, NluClient, TtsClient};
use crate::ratelimit::{
    DistributedRateLimiter, LocalRateLimiter, RateLimitMode, RateLimiter,
};
use crate::transport::middleware::{
    Authenticator, DeviceIdentifier, IngressChain, MessageContext, RateLimitFilter,
};
use crate::transport::{self, InboundMessage, MessageHandler};
use crate::Result;

/// Command segment that routes into the dialog pipeline
const VOICE_COMMAND: &str = "voice";

/// The voxrelay daemon
pub struct Daemon {
    config: ConfigHandle,
}

/// Runs the ingress chain and routes voice commands into the pipeline
struct IngressDispatcher {
    chain: IngressChain,
    pipeline: Arc<DialogPipeline>,
    shutdown: CancellationToken,
}

#[async_trait]
impl MessageHandler for IngressDispatcher {
    async fn handle(&self, message: InboundMessage) {
        let mut ctx = MessageContext::new();
        if !self.chain.process(&mut ctx, &message).await {
            return;
        }

        let Some(topic) = ctx.topic.as_ref() else {
            return;
        };
        if topic.flag != TopicFlag::Server || topic.command_type != VOICE_COMMAND {
            tracing::debug!(
                topic = %message.topic,
                trace_id = %ctx.trace_id,
                "ignoring non-voice message"
            );
            return;
        }

        let cancel = self.shutdown.child_token();
        if let Err(e) = self
            .pipeline
            .handle_frame(cancel, &ctx, &message.payload)
            .await
        {
            // the failing stage already logged details; one bad utterance
            // never takes down the receive path
            tracing::debug!(error = %e, trace_id = %ctx.trace_id, "utterance aborted");
        }
    }
}

impl Daemon {
    /// Create a daemon over a live configuration handle
    #[must_use]
    pub fn new(config: ConfigHandle) -> Self {
        Self { config }
    }

    /// Run until `shutdown` fires
    ///
    /// # Errors
    ///
    /// Returns an error when a component cannot be initialized or the admin
    /// server fails.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let cfg = self.config.snapshot();

        if !cfg.rule.model.is_empty() {
            tracing::warn!(
                model = %cfg.rule.model,
                "forwarding strategies are not supported, using the in-process pipeline"
            );
        }

        // storage
        let pool = db::init(&cfg.database.path)?;
        let devices = DeviceRepo::new(pool.clone());

        // metering
        let metering = if cfg.pricing.models.is_empty() {
            tracing::info!("no pricing rules configured, metering disabled");
            Metering::disabled()
        } else {
            Metering::new(
                CostCalculator::from_config(&cfg.pricing),
                Arc::new(SqliteLedger::new(pool)),
            )
        };
        let metering = Arc::new(metering);

        // model clients
        let asr = AsrClient::from_config(&cfg.asr)?;
        let nlu = NluClient::from_config(&cfg.nlu)?;
        match nlu.health().await {
            Ok(()) => tracing::info!(endpoint = %cfg.nlu.endpoint, "nlu service healthy"),
            Err(e) => tracing::warn!(error = %e, endpoint = %cfg.nlu.endpoint, "nlu health probe failed"),
        }
        let chat = ChatClient::from_config(&cfg.agent, &cfg.qwen)?;
        let tts = TtsClient::from_config(&cfg.tts)?;

        // fragment reassembly
        let fragments = Arc::new(FragmentManager::new());
        {
            let fragments = Arc::clone(&fragments);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { fragments.run_sweeper(shutdown).await });
        }

        // ingress rate limiting
        let limiter = Arc::new(match cfg.rate_limit.mode {
            RateLimitMode::Local => RateLimiter::Local(LocalRateLimiter::new(
                cfg.rate_limit.requests_per_second,
                cfg.rate_limit.burst,
            )),
            RateLimitMode::Distributed => RateLimiter::Distributed(
                DistributedRateLimiter::connect(
                    &cfg.redis.addr,
                    &cfg.redis.password,
                    cfg.redis.db,
                    f64::from(cfg.rate_limit.requests_per_second),
                    cfg.rate_limit.burst,
                )
                .await?,
            ),
        });
        {
            let limiter = Arc::clone(&limiter);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                if let RateLimiter::Local(local) = &*limiter {
                    local.run_sweeper(shutdown).await;
                }
            });
        }

        // ingress chain, assembled once
        let chain = IngressChain::new()
            .with(Box::new(DeviceIdentifier))
            .with(Box::new(RateLimitFilter::new(Arc::clone(&limiter))))
            .with(Box::new(Authenticator::new(None)));

        // egress and pipeline; the publisher binds to the client below
        let publisher = Arc::new(LazyPublisher::new());
        let egress = Arc::new(EgressPublisher::new(
            Arc::clone(&publisher) as Arc<dyn crate::egress::FramePublisher>,
            Arc::new(RegistryResolver::new(devices.clone())),
            AudioProfile::default(),
        ));

        let archive_dir = if cfg.audio.storage.is_empty() {
            None
        } else {
            Some(std::path::PathBuf::from(&cfg.audio.storage))
        };

        let pipeline = Arc::new(DialogPipeline::new(
            asr,
            nlu,
            chat,
            tts,
            fragments,
            egress,
            metering,
            archive_dir,
        ));

        // transport
        let dispatcher = Arc::new(IngressDispatcher {
            chain,
            pipeline: Arc::clone(&pipeline),
            shutdown: shutdown.clone(),
        });
        let handle = transport::start(
            &cfg.mqtt,
            cfg.topics.clone(),
            dispatcher,
            shutdown.clone(),
        )?;
        publisher.bind(handle);

        // admin api; serves until shutdown
        let state = Arc::new(ApiState {
            devices,
            pipeline,
            shutdown: shutdown.clone(),
        });
        api::serve(state, cfg.http.port, shutdown).await
    }
}
