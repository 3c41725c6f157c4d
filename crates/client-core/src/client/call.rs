//! Per-call session state.
//!
//! A [`CallSession`] tracks one call owned by an account session: the
//! protocol phase reported by the engine, the orthogonal local hold/mute/
//! video-mute flags, the connect timestamp and the selected capture device.
//! Phase transitions are driven by engine events; the session never drives
//! the SIP transaction itself.
//!
//! A session is created on an outgoing-call request or an inbound-call
//! callback and destroyed exactly once, from within the disconnection event.
//! Operations that reference it afterwards are rejected by the processor
//! with a synthesized disconnected notification instead of panicking.

use chrono::{DateTime, Utc};

pub use crate::engine::{CallId, CallPhase};
use crate::engine::{CaptureDevice, VideoSetting};

/// Direction of a call relative to this client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallDirection {
    /// Call received from a remote party
    Incoming,
    /// Call placed by this client
    Outgoing,
}

/// State of one call owned by an account session.
#[derive(Debug, Clone)]
pub struct CallSession {
    id: CallId,
    account_id: String,
    direction: CallDirection,
    phase: CallPhase,
    local_hold: bool,
    local_mute: bool,
    local_video_mute: bool,
    connected_at: Option<DateTime<Utc>>,
    capture_device: CaptureDevice,
    video: VideoSetting,
    silent: bool,
    ringback_active: bool,
    last_status_code: u32,
}

impl CallSession {
    /// Creates the session for an inbound call.
    pub(crate) fn incoming(id: CallId, account_id: impl Into<String>, video: VideoSetting) -> Self {
        Self::new(id, account_id, CallDirection::Incoming, video)
    }

    /// Creates the session for an outgoing call.
    pub(crate) fn outgoing(id: CallId, account_id: impl Into<String>, video: VideoSetting) -> Self {
        Self::new(id, account_id, CallDirection::Outgoing, video)
    }

    fn new(
        id: CallId,
        account_id: impl Into<String>,
        direction: CallDirection,
        video: VideoSetting,
    ) -> Self {
        Self {
            id,
            account_id: account_id.into(),
            direction,
            phase: CallPhase::Initiated,
            local_hold: false,
            local_mute: false,
            local_video_mute: false,
            connected_at: None,
            capture_device: CaptureDevice::Front,
            video,
            silent: false,
            ringback_active: false,
            last_status_code: 0,
        }
    }

    /// Engine-assigned call id.
    pub fn id(&self) -> CallId {
        self.id
    }

    /// Identity URI of the owning account.
    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    /// Call direction.
    pub fn direction(&self) -> CallDirection {
        self.direction
    }

    /// Current protocol phase.
    pub fn phase(&self) -> CallPhase {
        self.phase
    }

    /// Whether the call has reached its terminal state.
    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    /// Local hold flag.
    pub fn is_local_hold(&self) -> bool {
        self.local_hold
    }

    /// Local microphone mute flag.
    pub fn is_local_mute(&self) -> bool {
        self.local_mute
    }

    /// Local video mute flag.
    pub fn is_local_video_mute(&self) -> bool {
        self.local_video_mute
    }

    /// Video parameters the call was placed or answered with.
    pub fn video(&self) -> VideoSetting {
        self.video
    }

    /// Currently selected video capture device.
    pub fn capture_device(&self) -> CaptureDevice {
        self.capture_device
    }

    /// Whether this call suppresses outgoing-call notifications.
    pub fn is_silent(&self) -> bool {
        self.silent
    }

    /// Connect timestamp in epoch milliseconds, 0 until confirmed.
    pub fn connect_timestamp_ms(&self) -> i64 {
        self.connected_at.map(|t| t.timestamp_millis()).unwrap_or(0)
    }

    /// Call duration so far; zero if the call never connected.
    pub fn duration(&self) -> chrono::Duration {
        match self.connected_at {
            Some(connected_at) => Utc::now() - connected_at,
            None => chrono::Duration::zero(),
        }
    }

    /// SIP status code attached to the most recent state change.
    pub fn last_status_code(&self) -> u32 {
        self.last_status_code
    }

    pub(crate) fn set_phase(&mut self, phase: CallPhase) {
        self.phase = phase;
    }

    pub(crate) fn set_last_status_code(&mut self, code: u32) {
        self.last_status_code = code;
    }

    /// Records the connect time; called once on entering the confirmed phase.
    pub(crate) fn mark_connected(&mut self) {
        if self.connected_at.is_none() {
            self.connected_at = Some(Utc::now());
        }
    }

    pub(crate) fn set_local_hold(&mut self, hold: bool) {
        self.local_hold = hold;
    }

    pub(crate) fn set_local_mute(&mut self, mute: bool) {
        self.local_mute = mute;
    }

    pub(crate) fn set_local_video_mute(&mut self, mute: bool) {
        self.local_video_mute = mute;
    }

    pub(crate) fn set_video(&mut self, video: VideoSetting) {
        self.video = video;
    }

    pub(crate) fn set_capture_device(&mut self, device: CaptureDevice) {
        self.capture_device = device;
    }

    pub(crate) fn set_silent(&mut self, silent: bool) {
        self.silent = silent;
    }

    pub(crate) fn is_ringback_active(&self) -> bool {
        self.ringback_active
    }

    pub(crate) fn set_ringback_active(&mut self, active: bool) {
        self.ringback_active = active;
    }
}
