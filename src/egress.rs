//! Egress publisher
//!
//! Frames synthesized audio and emits it on the device's reply topic. The
//! reply route (vendor and device type) comes from a resolver seam: a static
//! test route by default, the device registry when one is configured.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::db::DeviceRepo;
use crate::protocol::{self, topic::VENDOR_TEST, AudioProfile, Topic, TopicFlag};
use crate::transport::TransportHandle;
use crate::Result;

/// Command segment for voice replies
const VOICE_COMMAND: &str = "voice";

/// Largest audio payload carried by a single frame; bounded by the header's
/// 16-bit length field
const MAX_FRAME_PAYLOAD: usize = 60 * 1024;

/// Sink for framed payloads; the MQTT client in production, a capture in
/// tests
#[async_trait]
pub trait FramePublisher: Send + Sync {
    /// Emit one framed payload on a topic
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        cancel: &CancellationToken,
    ) -> Result<()>;
}

#[async_trait]
impl FramePublisher for TransportHandle {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        TransportHandle::publish(self, topic, payload, cancel).await
    }
}

/// Publisher bound to the MQTT client after the transport starts.
///
/// The pipeline is wired before the transport exists; publishing through an
/// unbound handle fails rather than queueing silently.
#[derive(Default)]
pub struct LazyPublisher {
    inner: std::sync::OnceLock<TransportHandle>,
}

impl LazyPublisher {
    /// An unbound publisher
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind the started transport; later binds are ignored
    pub fn bind(&self, handle: TransportHandle) {
        let _ = self.inner.set(handle);
    }
}

#[async_trait]
impl FramePublisher for LazyPublisher {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let Some(handle) = self.inner.get() else {
            return Err(crate::Error::Mqtt("mqtt client not initialized".to_string()));
        };
        handle.publish(topic, payload, cancel).await
    }
}

/// Resolves the reply route for a device
pub trait ReplyResolver: Send + Sync {
    /// `(vendor, device_type)` to address the device under
    ///
    /// # Errors
    ///
    /// Returns an error when resolution fails hard; implementations should
    /// prefer falling back to the static route.
    fn resolve(&self, device_sn: &str) -> Result<(String, String)>;
}

/// Fixed test route
pub struct StaticResolver {
    vendor: String,
    device_type: String,
}

impl Default for StaticResolver {
    fn default() -> Self {
        Self {
            vendor: VENDOR_TEST.to_string(),
            device_type: "T0001".to_string(),
        }
    }
}

impl ReplyResolver for StaticResolver {
    fn resolve(&self, _device_sn: &str) -> Result<(String, String)> {
        Ok((self.vendor.clone(), self.device_type.clone()))
    }
}

/// Device-registry route with a static fallback for unregistered devices
pub struct RegistryResolver {
    repo: DeviceRepo,
    fallback: StaticResolver,
}

impl RegistryResolver {
    /// Resolve through the given registry
    #[must_use]
    pub fn new(repo: DeviceRepo) -> Self {
        Self {
            repo,
            fallback: StaticResolver::default(),
        }
    }
}

impl ReplyResolver for RegistryResolver {
    fn resolve(&self, device_sn: &str) -> Result<(String, String)> {
        match self.repo.get(device_sn) {
            Ok(Some(device)) => Ok((device.vendor, device.device_type)),
            Ok(None) => self.fallback.resolve(device_sn),
            Err(e) => {
                tracing::error!(error = %e, device_sn = %device_sn, "reply route lookup failed");
                self.fallback.resolve(device_sn)
            }
        }
    }
}

/// Publishes synthesized audio back to devices
pub struct EgressPublisher {
    publisher: Arc<dyn FramePublisher>,
    resolver: Arc<dyn ReplyResolver>,
    profile: AudioProfile,
}

impl EgressPublisher {
    /// Wire a publisher, route resolver, and outbound audio profile
    #[must_use]
    pub fn new(
        publisher: Arc<dyn FramePublisher>,
        resolver: Arc<dyn ReplyResolver>,
        profile: AudioProfile,
    ) -> Self {
        Self {
            publisher,
            resolver,
            profile,
        }
    }

    /// Frame `audio` and publish it on the device's reply topic.
    ///
    /// Audio that fits one frame goes out as a full frame; anything larger
    /// is streamed as fragment frames ending in a last frame, with sequence
    /// numbers starting at 0.
    ///
    /// # Errors
    ///
    /// Returns an error on route resolution, topic validation, or publish
    /// failure.
    pub async fn publish(
        &self,
        cancel: &CancellationToken,
        device_sn: &str,
        audio: &[u8],
    ) -> Result<()> {
        let (vendor, device_type) = self.resolver.resolve(device_sn)?;
        let topic = Topic {
            vendor,
            device_type,
            device_sn: device_sn.to_string(),
            command_type: VOICE_COMMAND.to_string(),
            flag: TopicFlag::Client,
        };
        topic.validate()?;

        tracing::info!(
            topic = %topic,
            format = self.profile.format,
            sample_rate = self.profile.sample_rate,
            channels = self.profile.channels,
            audio_len = audio.len(),
            "publishing reply audio"
        );

        if audio.len() <= MAX_FRAME_PAYLOAD {
            let payload = protocol::build_full(audio, self.profile);
            return self.publisher.publish(&topic.render(), payload, cancel).await;
        }
        self.publish_stream(cancel, &topic, audio).await
    }

    /// Stream oversized audio as an ordered fragment/last frame sequence
    async fn publish_stream(
        &self,
        cancel: &CancellationToken,
        topic: &Topic,
        audio: &[u8],
    ) -> Result<()> {
        let rendered = topic.render();
        let chunks: Vec<&[u8]> = audio.chunks(MAX_FRAME_PAYLOAD).collect();
        let last_index = chunks.len() - 1;

        for (seq, chunk) in chunks.into_iter().enumerate() {
            let payload =
                protocol::build_stream(seq as u16, chunk, self.profile, seq == last_index);
            let payload_len = payload.len();
            self.publisher.publish(&rendered, payload, cancel).await?;
            tracing::debug!(
                topic = %rendered,
                seq,
                is_last = seq == last_index,
                payload_len,
                "published stream frame"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct CapturePublisher {
        published: Mutex<Vec<(String, Vec<u8>)>>,
    }

    #[async_trait]
    impl FramePublisher for CapturePublisher {
        async fn publish(
            &self,
            topic: &str,
            payload: Vec<u8>,
            _cancel: &CancellationToken,
        ) -> Result<()> {
            self.published
                .lock()
                .unwrap()
                .push((topic.to_string(), payload));
            Ok(())
        }
    }

    #[tokio::test]
    async fn publishes_full_frame_on_reply_topic() {
        let capture = Arc::new(CapturePublisher {
            published: Mutex::new(Vec::new()),
        });
        let egress = EgressPublisher::new(
            capture.clone(),
            Arc::new(StaticResolver::default()),
            AudioProfile::default(),
        );

        egress
            .publish(&CancellationToken::new(), "A0001", b"AUDIO")
            .await
            .unwrap();

        let published = capture.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "test/T0001/A0001/voice/client");

        let (header, payload) = protocol::decode(&published[0].1).unwrap();
        assert_eq!(payload, b"AUDIO");
        assert_eq!(header.frame_seq, 0);
        assert_eq!(header.audio_format, protocol::frame::format::WAV);
    }

    #[tokio::test]
    async fn oversized_audio_streams_as_fragments() {
        let capture = Arc::new(CapturePublisher {
            published: Mutex::new(Vec::new()),
        });
        let egress = EgressPublisher::new(
            capture.clone(),
            Arc::new(StaticResolver::default()),
            AudioProfile::default(),
        );

        let audio: Vec<u8> = (0..(MAX_FRAME_PAYLOAD * 2 + 17))
            .map(|i| (i % 251) as u8)
            .collect();
        egress
            .publish(&CancellationToken::new(), "A0001", &audio)
            .await
            .unwrap();

        let published = capture.published.lock().unwrap();
        assert_eq!(published.len(), 3);

        let mut reassembled = Vec::new();
        for (i, (topic, payload)) in published.iter().enumerate() {
            assert_eq!(topic, "test/T0001/A0001/voice/client");
            let (header, body) = protocol::decode(payload).unwrap();
            assert_eq!(usize::from(header.frame_seq), i);
            let expected = if i == published.len() - 1 {
                crate::protocol::FrameType::Last
            } else {
                crate::protocol::FrameType::Fragment
            };
            assert_eq!(header.frame_type, expected.bits());
            reassembled.extend_from_slice(body);
        }
        assert_eq!(reassembled, audio);
    }

    #[tokio::test]
    async fn rejects_invalid_device_sn() {
        let capture = Arc::new(CapturePublisher {
            published: Mutex::new(Vec::new()),
        });
        let egress = EgressPublisher::new(
            capture.clone(),
            Arc::new(StaticResolver::default()),
            AudioProfile::default(),
        );

        let err = egress
            .publish(&CancellationToken::new(), "bad sn!", b"AUDIO")
            .await
            .unwrap_err();
        assert!(matches!(err, crate::Error::Topic(_)));
        assert!(capture.published.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn registry_resolver_prefers_registered_route() {
        let repo = DeviceRepo::new(crate::db::init_memory().unwrap());
        repo.upsert(&crate::db::Device {
            sn: "A0001".to_string(),
            vendor: "halcyon".to_string(),
            device_type: "H2".to_string(),
            name: String::new(),
            status: String::new(),
        })
        .unwrap();

        let resolver = RegistryResolver::new(repo);
        assert_eq!(
            resolver.resolve("A0001").unwrap(),
            ("halcyon".to_string(), "H2".to_string())
        );
        // unregistered devices fall back to the static test route
        assert_eq!(
            resolver.resolve("Z9999").unwrap(),
            ("test".to_string(), "T0001".to_string())
        );
    }
}
