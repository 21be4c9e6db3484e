//! Peer connections backed by the `webrtc` crate
//!
//! Each attached [`LocalTrack`] gets a sample pump that writes placeholder
//! frames (Opus silence, blank video) until the track stops or the connection
//! closes. The far side needs RTP flowing before it reports the track.

use crate::media::{LocalTrack, RemoteTrack};
use crate::rtc::{
    LocalCandidateHandler, RemoteTrackHandler, RtcConfig, RtcConnection, RtcConnector, RtcError,
};
use crate::types::{IceCandidatePayload, MediaKind, SdpKind, SessionDescription};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

/// Builds [`WebRtcConnection`]s with default codecs and interceptors
#[derive(Debug, Clone, Default)]
pub struct WebRtcConnector;

impl WebRtcConnector {
    /// Create a connector
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

fn rtc_configuration(config: &RtcConfig) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: config
            .ice_servers
            .iter()
            .map(|server| RTCIceServer {
                urls: server.urls.clone(),
                ..Default::default()
            })
            .collect(),
        ice_candidate_pool_size: config.ice_candidate_pool_size,
        ..Default::default()
    }
}

#[async_trait]
impl RtcConnector for WebRtcConnector {
    #[tracing::instrument(skip(self, config), fields(ice_servers = config.ice_servers.len()))]
    async fn connect(&self, config: &RtcConfig) -> Result<Arc<dyn RtcConnection>, RtcError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| RtcError::Create(format!("Failed to register codecs: {e}")))?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| RtcError::Create(format!("Failed to register interceptors: {e}")))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        let peer_connection = api
            .new_peer_connection(rtc_configuration(config))
            .await
            .map_err(|e| {
                tracing::error!("Failed to create peer connection: {}", e);
                RtcError::Create(e.to_string())
            })?;

        tracing::debug!("Created peer connection");
        Ok(Arc::new(WebRtcConnection {
            peer_connection: Arc::new(peer_connection),
            pumps: Mutex::new(Vec::new()),
        }))
    }
}

/// [`RtcConnection`] over an `RTCPeerConnection`
pub struct WebRtcConnection {
    peer_connection: Arc<RTCPeerConnection>,
    pumps: Mutex<Vec<JoinHandle<()>>>,
}

/// Opus encoding of 20 ms of silence
const OPUS_SILENCE: &[u8] = &[0xf8, 0xff, 0xfe];
const BLANK_VIDEO: &[u8] = &[0u8; 16];

fn placeholder_frame(kind: MediaKind) -> (Bytes, Duration) {
    match kind {
        MediaKind::Audio => (Bytes::from_static(OPUS_SILENCE), Duration::from_millis(20)),
        MediaKind::Video => (Bytes::from_static(BLANK_VIDEO), Duration::from_millis(33)),
    }
}

async fn pump_samples(sample_track: Arc<TrackLocalStaticSample>, track: LocalTrack) {
    let (data, duration) = placeholder_frame(track.kind());
    let mut ticker = tokio::time::interval(duration);
    let mut written = 0u64;
    loop {
        ticker.tick().await;
        if track.is_stopped() {
            break;
        }
        let sample = Sample {
            data: data.clone(),
            duration,
            ..Default::default()
        };
        // Writes before negotiation completes are no-ops.
        if let Err(e) = sample_track.write_sample(&sample).await {
            tracing::debug!(track_id = %track.id(), error = %e, "Sample write failed");
            break;
        }
        written += 1;
    }
    tracing::trace!(track_id = %track.id(), written, "Sample pump stopped");
}

fn codec_for(kind: MediaKind) -> RTCRtpCodecCapability {
    match kind {
        MediaKind::Audio => RTCRtpCodecCapability {
            mime_type: "audio/opus".to_string(),
            clock_rate: 48000,
            channels: 2,
            sdp_fmtp_line: String::new(),
            rtcp_feedback: vec![],
        },
        MediaKind::Video => RTCRtpCodecCapability {
            mime_type: "video/VP8".to_string(),
            clock_rate: 90000,
            channels: 0,
            sdp_fmtp_line: String::new(),
            rtcp_feedback: vec![],
        },
    }
}

fn to_payload(init: RTCIceCandidateInit) -> IceCandidatePayload {
    IceCandidatePayload {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

fn to_description(description: SessionDescription) -> Result<RTCSessionDescription, RtcError> {
    let converted = match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
    };
    converted.map_err(|e| RtcError::Negotiation(format!("Invalid SDP: {e}")))
}

#[async_trait]
impl RtcConnection for WebRtcConnection {
    async fn add_track(&self, track: &LocalTrack) -> Result<(), RtcError> {
        let sample = Arc::new(TrackLocalStaticSample::new(
            codec_for(track.kind()),
            track.id().to_string(),
            "local".to_string(),
        ));
        self.peer_connection
            .add_track(Arc::clone(&sample) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| RtcError::Track(e.to_string()))?;
        let pump = tokio::spawn(pump_samples(sample, track.clone()));
        self.pumps.lock().push(pump);
        tracing::debug!(track_id = %track.id(), kind = ?track.kind(), "Track attached");
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, RtcError> {
        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .map_err(|e| RtcError::Negotiation(format!("Failed to create offer: {e}")))?;
        self.peer_connection
            .set_local_description(offer.clone())
            .await
            .map_err(|e| {
                RtcError::Negotiation(format!("Failed to set local description: {e}"))
            })?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, RtcError> {
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(|e| RtcError::Negotiation(format!("Failed to create answer: {e}")))?;
        self.peer_connection
            .set_local_description(answer.clone())
            .await
            .map_err(|e| {
                RtcError::Negotiation(format!("Failed to set local description: {e}"))
            })?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), RtcError> {
        self.peer_connection
            .set_remote_description(to_description(description)?)
            .await
            .map_err(|e| {
                RtcError::Negotiation(format!("Failed to set remote description: {e}"))
            })
    }

    async fn add_ice_candidate(&self, candidate: IceCandidatePayload) -> Result<(), RtcError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.peer_connection
            .add_ice_candidate(init)
            .await
            .map_err(|e| RtcError::Candidate(e.to_string()))
    }

    fn on_local_candidate(&self, handler: LocalCandidateHandler) {
        self.peer_connection
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                // `None` marks the end of gathering.
                if let Some(candidate) = candidate {
                    match candidate.to_json() {
                        Ok(init) => handler(to_payload(init)),
                        Err(e) => tracing::warn!(error = %e, "Unserializable local candidate"),
                    }
                }
                Box::pin(async {})
            }));
    }

    fn on_remote_track(&self, handler: RemoteTrackHandler) {
        self.peer_connection
            .on_track(Box::new(move |track, _receiver, _transceiver| {
                let kind = match track.kind() {
                    RTPCodecType::Video => MediaKind::Video,
                    _ => MediaKind::Audio,
                };
                handler(RemoteTrack {
                    id: track.id(),
                    kind,
                    stream_id: track.stream_id(),
                });
                Box::pin(async {})
            }));
    }

    async fn close(&self) -> Result<(), RtcError> {
        for pump in self.pumps.lock().drain(..) {
            pump.abort();
        }
        self.peer_connection
            .close()
            .await
            .map_err(|e| RtcError::Negotiation(format!("Failed to close: {e}")))
    }
}
