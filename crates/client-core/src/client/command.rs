//! Command surface of the orchestration layer.
//!
//! Every state-mutating operation is expressed as one [`Command`] value:
//! an immutable message enqueued through a [`ProcessorHandle`] and executed
//! asynchronously, one at a time, by the command processor. Submission never
//! blocks, never reorders, and performs only the validation that can be
//! done synchronously (the canonical `sip:user@host` shape of account
//! identifiers); everything else is absorbed by the worker and reported as
//! notifications.

use tokio::sync::{mpsc, oneshot};

use crate::client::config::{AccountConfig, AccountTransport};
use crate::client::processor::{EngineEvent, WorkItem};
use crate::codec::CodecPriority;
use crate::engine::{
    CallId, CallPhase, EngineObserver, MediaLegId, TlsVerifyState, VideoSetting,
};
use crate::error::{ClientError, ClientResult};

/// A state-mutating operation, processed serially by the command worker.
#[derive(Debug, Clone)]
pub enum Command {
    /// Create or refresh an account and persist its configuration
    SetAccount {
        /// The account configuration
        config: AccountConfig,
    },
    /// Unregister and remove an account
    RemoveAccount {
        /// Identity URI of the account
        account_id: String,
    },
    /// Restart the protocol engine and re-add every configured account
    RestartStack,
    /// Place an outgoing call
    MakeCall {
        /// Identity URI of the account
        account_id: String,
        /// Number or full `sip:` URI to dial
        number: String,
        /// Video parameters
        video: VideoSetting,
        /// Whether this is a consultation call for an attended transfer;
        /// transfer calls may coexist with the one call being transferred
        is_transfer: bool,
    },
    /// Place a call that reports silent-call-status instead of outgoing-call
    MakeSilentCall {
        /// Identity URI of the account
        account_id: String,
        /// Number or full `sip:` URI to dial
        number: String,
    },
    /// Place a call through a throwaway guest session
    MakeDirectCall {
        /// Full `sip:` URI to dial
        uri: String,
        /// SIP server host the guest session connects to
        sip_server: String,
        /// Signaling transport for the guest session
        transport: AccountTransport,
        /// Display name presented by the guest session
        guest_display_name: String,
        /// Video parameters
        video: VideoSetting,
    },
    /// Terminate one call
    HangUpCall {
        /// Identity URI of the account
        account_id: String,
        /// Engine-assigned call id
        call_id: CallId,
    },
    /// Terminate every call of an account
    HangUpCalls {
        /// Identity URI of the account
        account_id: String,
    },
    /// Answer an inbound call
    AcceptIncomingCall {
        /// Identity URI of the account
        account_id: String,
        /// Engine-assigned call id
        call_id: CallId,
        /// Video parameters of the answer
        video: VideoSetting,
    },
    /// Decline an inbound call
    DeclineIncomingCall {
        /// Identity URI of the account
        account_id: String,
        /// Engine-assigned call id
        call_id: CallId,
    },
    /// Set the hold state of a call
    SetHold {
        /// Identity URI of the account
        account_id: String,
        /// Engine-assigned call id
        call_id: CallId,
        /// Desired hold state
        hold: bool,
    },
    /// Toggle the hold state of a call
    ToggleHold {
        /// Identity URI of the account
        account_id: String,
        /// Engine-assigned call id
        call_id: CallId,
    },
    /// Set the microphone mute state of a call
    SetMute {
        /// Identity URI of the account
        account_id: String,
        /// Engine-assigned call id
        call_id: CallId,
        /// Desired mute state
        mute: bool,
    },
    /// Toggle the microphone mute state of a call
    ToggleMute {
        /// Identity URI of the account
        account_id: String,
        /// Engine-assigned call id
        call_id: CallId,
    },
    /// Set the video mute state of a call
    SetVideoMute {
        /// Identity URI of the account
        account_id: String,
        /// Engine-assigned call id
        call_id: CallId,
        /// Desired video mute state
        mute: bool,
    },
    /// Switch between the front and back capture device of a call
    SwitchCaptureDevice {
        /// Identity URI of the account
        account_id: String,
        /// Engine-assigned call id
        call_id: CallId,
    },
    /// Send DTMF tones on a call, one tone at a time
    SendDtmf {
        /// Identity URI of the account
        account_id: String,
        /// Engine-assigned call id
        call_id: CallId,
        /// Tones to send
        digits: String,
    },
    /// Blind transfer of a call
    TransferCall {
        /// Identity URI of the account
        account_id: String,
        /// Engine-assigned call id
        call_id: CallId,
        /// Target number or full `sip:` URI
        destination: String,
    },
    /// Attended (replaces) transfer between two calls of an account
    AttendedTransferCall {
        /// Identity URI of the account
        account_id: String,
        /// Engine-assigned call id of the call being transferred
        call_id: CallId,
        /// Engine-assigned call id of the replacement call
        destination_call_id: CallId,
    },
    /// Republish the current state of a call
    GetCallStatus {
        /// Identity URI of the account
        account_id: String,
        /// Engine-assigned call id
        call_id: CallId,
    },
    /// Query the engine's codec table
    GetCodecPriorities,
    /// Apply and persist a codec priority table
    SetCodecPriorities {
        /// Entries applied in table order
        priorities: Vec<CodecPriority>,
    },
    /// Republish the registration status of an account
    GetRegistrationStatus {
        /// Identity URI of the account
        account_id: String,
    },
    /// Re-register an account, optionally updating registration parameters
    RefreshRegistration {
        /// Identity URI of the account
        account_id: String,
        /// New expiration timeout in seconds, 0 keeps the configured value
        expiration_secs: u32,
        /// New contact URI parameters, `None` keeps the configured value
        contact_uri_params: Option<String>,
    },
    /// Persist the do-not-disturb flag
    SetDnd {
        /// Desired flag value
        enabled: bool,
    },
    /// Drive the IP-change / reconnection state machine
    ReconnectCall,
}

/// Cheap-to-clone handle for submitting commands to the processor.
///
/// The handle is also the [`EngineObserver`] registered with the protocol
/// engine: callbacks are funneled into the same serial queue as user
/// commands, which is what gives the layer its deterministic ordering.
#[derive(Clone)]
pub struct ProcessorHandle {
    pub(crate) tx: mpsc::UnboundedSender<WorkItem>,
    pub(crate) registry: std::sync::Arc<crate::client::registry::SessionRegistry>,
}

impl ProcessorHandle {
    /// Enqueues a command for serial execution. Never blocks.
    ///
    /// Account identifiers are validated against the canonical
    /// `sip:user@host` shape here, before enqueuing; malformed identifiers
    /// are rejected synchronously.
    pub fn submit(&self, command: Command) -> ClientResult<()> {
        if let Some(account_id) = command_account_id(&command) {
            validate_account_id(account_id)?;
        }
        self.push(WorkItem::Command(command))
    }

    /// Waits until every previously submitted command and event has been
    /// processed.
    pub async fn flush(&self) -> ClientResult<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.push(WorkItem::Flush(ack_tx))?;
        ack_rx
            .await
            .map_err(|_| ClientError::internal("command processor stopped"))
    }

    /// Stops the worker after tearing down accounts and the engine.
    pub async fn shutdown(&self) -> ClientResult<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.push(WorkItem::Shutdown(ack_tx))?;
        ack_rx
            .await
            .map_err(|_| ClientError::internal("command processor stopped"))
    }

    /// Creates or refreshes an account; returns its identity URI.
    pub fn set_account(&self, config: AccountConfig) -> ClientResult<String> {
        let account_id = config.id_uri();
        validate_account_id(&account_id)?;
        self.push(WorkItem::Command(Command::SetAccount { config }))?;
        Ok(account_id)
    }

    /// Removes an account.
    pub fn remove_account(&self, account_id: &str) -> ClientResult<()> {
        self.submit(Command::RemoveAccount { account_id: account_id.to_string() })
    }

    /// Places an outgoing call.
    pub fn make_call(
        &self,
        account_id: &str,
        number: &str,
        video: VideoSetting,
    ) -> ClientResult<()> {
        self.submit(Command::MakeCall {
            account_id: account_id.to_string(),
            number: number.to_string(),
            video,
            is_transfer: false,
        })
    }

    /// Terminates a call.
    pub fn hang_up_call(&self, account_id: &str, call_id: CallId) -> ClientResult<()> {
        self.submit(Command::HangUpCall { account_id: account_id.to_string(), call_id })
    }

    /// Answers an inbound call.
    pub fn accept_incoming_call(
        &self,
        account_id: &str,
        call_id: CallId,
        video: VideoSetting,
    ) -> ClientResult<()> {
        self.submit(Command::AcceptIncomingCall {
            account_id: account_id.to_string(),
            call_id,
            video,
        })
    }

    /// Declines an inbound call.
    pub fn decline_incoming_call(&self, account_id: &str, call_id: CallId) -> ClientResult<()> {
        self.submit(Command::DeclineIncomingCall { account_id: account_id.to_string(), call_id })
    }

    /// Sets the hold state of a call.
    pub fn set_hold(&self, account_id: &str, call_id: CallId, hold: bool) -> ClientResult<()> {
        self.submit(Command::SetHold { account_id: account_id.to_string(), call_id, hold })
    }

    /// Sets the mute state of a call.
    pub fn set_mute(&self, account_id: &str, call_id: CallId, mute: bool) -> ClientResult<()> {
        self.submit(Command::SetMute { account_id: account_id.to_string(), call_id, mute })
    }

    /// Blind transfer of a call.
    pub fn transfer_call(
        &self,
        account_id: &str,
        call_id: CallId,
        destination: &str,
    ) -> ClientResult<()> {
        self.submit(Command::TransferCall {
            account_id: account_id.to_string(),
            call_id,
            destination: destination.to_string(),
        })
    }

    /// Identity URIs of the currently registered accounts.
    ///
    /// Safe to call from any thread; the registry supports concurrent reads.
    pub fn account_ids(&self) -> Vec<String> {
        self.registry.account_ids()
    }

    /// Ids of the live calls of an account, or `None` for unknown accounts.
    pub fn call_ids(&self, account_id: &str) -> Option<Vec<CallId>> {
        self.registry.with_account(account_id, |account| account.call_ids())
    }

    pub(crate) fn push_event(&self, event: EngineEvent) {
        // Events after shutdown have nowhere to go; that is fine.
        let _ = self.tx.send(WorkItem::Event(event));
    }

    fn push(&self, item: WorkItem) -> ClientResult<()> {
        self.tx
            .send(item)
            .map_err(|_| ClientError::internal("command processor stopped"))
    }
}

impl EngineObserver for ProcessorHandle {
    fn on_registration_state(&self, account_id: &str, code: u32) {
        self.push_event(EngineEvent::RegistrationState {
            account_id: account_id.to_string(),
            code,
        });
    }

    fn on_incoming_call(
        &self,
        account_id: &str,
        call_id: CallId,
        remote_party: &str,
        has_video: bool,
    ) {
        self.push_event(EngineEvent::IncomingCall {
            account_id: account_id.to_string(),
            call_id,
            remote_party: remote_party.to_string(),
            has_video,
        });
    }

    fn on_call_state(&self, account_id: &str, call_id: CallId, phase: CallPhase, status_code: u32) {
        self.push_event(EngineEvent::CallState {
            account_id: account_id.to_string(),
            call_id,
            phase,
            status_code,
        });
    }

    fn on_media_state(&self, account_id: &str, call_id: CallId, active_audio_legs: Vec<MediaLegId>) {
        self.push_event(EngineEvent::MediaState {
            account_id: account_id.to_string(),
            call_id,
            active_audio_legs,
        });
    }

    fn on_ip_change_progress(&self, success: bool, completed: bool) {
        self.push_event(EngineEvent::IpChangeProgress { success, completed });
    }

    fn on_transport_state(&self, tls: Option<TlsVerifyState>) {
        self.push_event(EngineEvent::TransportState { tls });
    }
}

/// Checks the canonical `sip:user@host` shape of an account identifier.
fn validate_account_id(account_id: &str) -> ClientResult<()> {
    if account_id.len() > 4 && account_id.starts_with("sip:") {
        Ok(())
    } else {
        Err(ClientError::InvalidAccountId(account_id.to_string()))
    }
}

/// The account identifier a command refers to, if any.
fn command_account_id(command: &Command) -> Option<&str> {
    match command {
        Command::RemoveAccount { account_id }
        | Command::MakeCall { account_id, .. }
        | Command::MakeSilentCall { account_id, .. }
        | Command::HangUpCall { account_id, .. }
        | Command::HangUpCalls { account_id }
        | Command::AcceptIncomingCall { account_id, .. }
        | Command::DeclineIncomingCall { account_id, .. }
        | Command::SetHold { account_id, .. }
        | Command::ToggleHold { account_id, .. }
        | Command::SetMute { account_id, .. }
        | Command::ToggleMute { account_id, .. }
        | Command::SetVideoMute { account_id, .. }
        | Command::SwitchCaptureDevice { account_id, .. }
        | Command::SendDtmf { account_id, .. }
        | Command::TransferCall { account_id, .. }
        | Command::AttendedTransferCall { account_id, .. }
        | Command::GetCallStatus { account_id, .. }
        | Command::GetRegistrationStatus { account_id }
        | Command::RefreshRegistration { account_id, .. } => Some(account_id),
        // SetAccount derives its identity from the config; set_account()
        // validates the derived URI before enqueuing.
        Command::SetAccount { .. }
        | Command::RestartStack
        | Command::MakeDirectCall { .. }
        | Command::GetCodecPriorities
        | Command::SetCodecPriorities { .. }
        | Command::SetDnd { .. }
        | Command::ReconnectCall => None,
    }
}
