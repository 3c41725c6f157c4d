//! Local ring indication capability.
//!
//! The host process owns the actual audio output; this layer only signals
//! when a ring or ringback indication should start and stop. The ringtone
//! plays while an admitted inbound call is ringing; the ringback tone plays
//! for an outgoing call once the remote side reports 180 Ringing and stops
//! on 183 progress, confirmation or disconnection.

/// Host-provided ring/ringback indication.
///
/// All methods must be idempotent and non-blocking.
pub trait RingIndicator: Send + Sync {
    /// Starts the inbound-call ringtone.
    fn start_ring(&self);
    /// Stops the inbound-call ringtone.
    fn stop_ring(&self);
    /// Starts the outgoing-call ringback tone.
    fn start_ringback(&self);
    /// Stops the outgoing-call ringback tone.
    fn stop_ringback(&self);
}

/// No-op indicator for hosts without local tone output.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRing;

impl RingIndicator for NoRing {
    fn start_ring(&self) {}
    fn stop_ring(&self) {}
    fn start_ringback(&self) {}
    fn stop_ringback(&self) {}
}
