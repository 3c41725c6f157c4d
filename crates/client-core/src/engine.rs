//! Protocol engine capability surface.
//!
//! The actual SIP/media engine (wire-level signaling, codec negotiation,
//! audio/video transport) lives outside this crate and is consumed through
//! the [`SipEngine`] trait: a flat set of capabilities covering registration,
//! calls, hold, mute, transfer, codec priorities and IP-change handling.
//! Asynchronous engine callbacks are delivered through a registered
//! [`EngineObserver`] implemented by the orchestration layer; no part of this
//! crate subclasses or otherwise reaches into engine internals.
//!
//! Engine calls are expected to be synchronous-but-fast from the worker's
//! point of view; slow operations (registration, call setup) complete later
//! via observer callbacks.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use crate::client::config::AccountConfig;
use crate::codec::CodecPriority;

/// Engine-assigned call identifier, unique within an account's active set.
pub type CallId = i32;

/// Engine-assigned handle for one media leg of a call.
pub type MediaLegId = u32;

/// SIP status codes used by this layer.
pub mod status {
    /// 100 Trying
    pub const TRYING: u32 = 100;
    /// 180 Ringing
    pub const RINGING: u32 = 180;
    /// 183 Session Progress
    pub const PROGRESS: u32 = 183;
    /// 200 OK
    pub const OK: u32 = 200;
    /// 400 Bad Request
    pub const BAD_REQUEST: u32 = 400;
    /// 486 Busy Here
    pub const BUSY_HERE: u32 = 486;
    /// 487 Request Terminated
    pub const REQUEST_TERMINATED: u32 = 487;
    /// 500 Internal Server Error
    pub const INTERNAL_SERVER_ERROR: u32 = 500;
    /// 603 Decline
    pub const DECLINE: u32 = 603;
}

/// Protocol-level state of a call as reported by the engine.
///
/// `Disconnected` is terminal: once the engine delivers it, the call object
/// is gone on the engine side and any further operation on the call id must
/// be rejected by this layer rather than forwarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallPhase {
    /// Outgoing INVITE sent / incoming INVITE received
    Initiated,
    /// Provisional ringing response exchanged
    Ringing,
    /// Early media (e.g. 180/183 with SDP)
    Early,
    /// Call answered and confirmed
    Confirmed,
    /// Call ended (terminal)
    Disconnected,
}

impl CallPhase {
    /// Whether this is the terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallPhase::Disconnected)
    }
}

/// Video parameters of an outgoing call or answer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VideoSetting {
    /// Whether the call carries video
    pub video: bool,
    /// Whether the call joins a video conference bridge
    pub video_conference: bool,
}

impl VideoSetting {
    /// Audio-only setting.
    pub fn audio_only() -> Self {
        Self::default()
    }
}

/// Camera used as the video capture device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaptureDevice {
    /// Front facing camera
    Front,
    /// Back facing camera
    Back,
}

impl CaptureDevice {
    /// Engine-level capture device index.
    pub fn device_index(&self) -> i32 {
        match self {
            CaptureDevice::Front => 1,
            CaptureDevice::Back => 2,
        }
    }

    /// The other camera.
    pub fn switched(&self) -> Self {
        match self {
            CaptureDevice::Front => CaptureDevice::Back,
            CaptureDevice::Back => CaptureDevice::Front,
        }
    }
}

/// Outcome of the engine's TLS server certificate verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsVerifyStatus {
    /// Verification succeeded
    Success,
    /// Certificate is trusted but its identity does not match the host
    IdentityMismatch,
    /// Verification failed for another reason
    Failed,
}

/// TLS verification details attached to a transport-state callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsVerifyState {
    /// Verification outcome
    pub status: TlsVerifyStatus,
    /// Subject CN and alternative names of the presented certificate
    pub cert_names: Vec<String>,
}

/// Error returned by protocol engine calls.
#[derive(Debug, Clone, Error)]
#[error("engine failure in {operation}: {message}")]
pub struct EngineError {
    /// Name of the failed engine capability
    pub operation: &'static str,
    /// Engine supplied detail
    pub message: String,
}

impl EngineError {
    /// Creates a new engine error.
    pub fn new(operation: &'static str, message: impl Into<String>) -> Self {
        Self { operation, message: message.into() }
    }
}

/// Result type alias for engine calls.
pub type EngineResult<T> = Result<T, EngineError>;

/// Listener interface for asynchronous engine callbacks.
///
/// Implemented by the orchestration layer and registered with the engine at
/// start time. Implementations must not block: the layer funnels every
/// callback into its serialized command queue, so these methods only enqueue.
pub trait EngineObserver: Send + Sync {
    /// Registration status changed for an account.
    fn on_registration_state(&self, account_id: &str, code: u32);

    /// A new inbound call arrived for an account.
    fn on_incoming_call(&self, account_id: &str, call_id: CallId, remote_party: &str, has_video: bool);

    /// A call changed protocol state.
    fn on_call_state(&self, account_id: &str, call_id: CallId, phase: CallPhase, status_code: u32);

    /// Media became active (or was renegotiated) on a call.
    fn on_media_state(&self, account_id: &str, call_id: CallId, active_audio_legs: Vec<MediaLegId>);

    /// Progress of an IP-change / transport restart operation.
    fn on_ip_change_progress(&self, success: bool, completed: bool);

    /// Transport-level state change; carries TLS verification details when
    /// the transport is TLS.
    fn on_transport_state(&self, tls: Option<TlsVerifyState>);
}

/// The capability set this layer requires from the protocol engine.
///
/// All methods are fallible; failures are absorbed by the caller and never
/// propagate past the command boundary. Account-scoped methods take the
/// account's identity URI (`sip:user@realm`).
#[async_trait]
pub trait SipEngine: Send + Sync {
    /// Starts the engine and registers the callback observer.
    /// Starting an already-started engine must be a no-op.
    async fn start(&self, observer: Arc<dyn EngineObserver>) -> EngineResult<()>;

    /// Stops the engine, tearing down transports and media.
    async fn stop(&self) -> EngineResult<()>;

    /// Creates an account on the engine and performs initial registration.
    async fn add_account(&self, config: &AccountConfig) -> EngineResult<()>;

    /// Creates a throwaway guest account that never registers.
    async fn add_guest_account(&self, config: &AccountConfig) -> EngineResult<()>;

    /// Removes an account, unregistering it.
    async fn remove_account(&self, account_id: &str) -> EngineResult<()>;

    /// Re-registers an account, optionally with new expiration/contact params.
    async fn refresh_registration(
        &self,
        account_id: &str,
        expiration_secs: u32,
        contact_uri_params: Option<&str>,
    ) -> EngineResult<()>;

    /// Last known SIP registration status code for an account.
    async fn registration_status(&self, account_id: &str) -> EngineResult<u32>;

    /// Places an outgoing call; returns the engine-assigned call id.
    async fn make_call(&self, account_id: &str, uri: &str, video: VideoSetting) -> EngineResult<CallId>;

    /// Answers a call with the given SIP status code (200 accepts, 180 rings,
    /// 486/603 reject).
    async fn answer(&self, account_id: &str, call_id: CallId, code: u32) -> EngineResult<()>;

    /// Hangs up a call with the given SIP status code.
    async fn hangup(&self, account_id: &str, call_id: CallId, code: u32) -> EngineResult<()>;

    /// Puts a call on hold.
    async fn hold(&self, account_id: &str, call_id: CallId) -> EngineResult<()>;

    /// Releases hold by re-inviting with the un-hold flag.
    async fn reinvite_unhold(&self, account_id: &str, call_id: CallId) -> EngineResult<()>;

    /// Currently active audio media legs of a call.
    async fn audio_legs(&self, account_id: &str, call_id: CallId) -> EngineResult<Vec<MediaLegId>>;

    /// Connects the capture device to a leg's transmit path.
    async fn connect_capture(&self, account_id: &str, call_id: CallId, leg: MediaLegId) -> EngineResult<()>;

    /// Disconnects the capture device from a leg's transmit path.
    async fn disconnect_capture(&self, account_id: &str, call_id: CallId, leg: MediaLegId) -> EngineResult<()>;

    /// Sends a single DTMF tone on a call.
    async fn send_dtmf(&self, account_id: &str, call_id: CallId, tone: &str) -> EngineResult<()>;

    /// Blind transfer of a call to a fully qualified destination.
    async fn transfer(&self, account_id: &str, call_id: CallId, destination: &str) -> EngineResult<()>;

    /// Attended (replaces) transfer of a call to another call.
    async fn attended_transfer(
        &self,
        account_id: &str,
        call_id: CallId,
        destination_call_id: CallId,
    ) -> EngineResult<()>;

    /// Starts or stops outgoing video transmission on a call.
    async fn set_video_transmit(&self, account_id: &str, call_id: CallId, enabled: bool) -> EngineResult<()>;

    /// Selects the video capture device for a call.
    async fn set_capture_device(&self, account_id: &str, call_id: CallId, device: CaptureDevice) -> EngineResult<()>;

    /// Enumerates the engine's codecs with their current priorities.
    async fn codecs(&self) -> EngineResult<Vec<CodecPriority>>;

    /// Applies a priority to a single codec.
    async fn set_codec_priority(&self, codec_id: &str, priority: u8) -> EngineResult<()>;

    /// Restarts transports and refreshes registrations/dialogs after an IP
    /// change. Completion is reported via
    /// [`EngineObserver::on_ip_change_progress`].
    async fn handle_ip_change(&self) -> EngineResult<()>;
}
