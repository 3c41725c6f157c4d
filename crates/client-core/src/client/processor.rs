//! The serialized command processor.
//!
//! A single tokio task executes every state-mutating operation of the layer:
//! user commands and protocol-engine callbacks are funneled through one
//! unbounded queue and handled one at a time. This total ordering is the
//! central correctness mechanism — no two mutations of the session graph
//! ever run concurrently, so account and call state needs no per-object
//! locking.
//!
//! The worker also owns the engine lifecycle: it starts the engine lazily
//! when the first account or guest call needs it (applying the persisted or
//! default codec table), and stops it when the last session disappears.
//!
//! # Failure policy
//!
//! A command is either fully applied or produces a reported failure
//! notification. Handlers absorb expected failures where they occur;
//! anything that escapes is caught by the worker loop, logged, and mapped to
//! the most specific failure notification the command allows (a synthesized
//! disconnected call state, a codec-set failure, a registration failure).
//! The worker itself never dies and never skips subsequent commands.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::caller::CallerInfo;
use crate::client::account::AccountSession;
use crate::client::call::CallSession;
use crate::client::command::{Command, ProcessorHandle};
use crate::client::config::AccountConfig;
use crate::client::registry::SessionRegistry;
use crate::codec::{self, CodecPriority};
use crate::engine::{
    status, CallId, CallPhase, MediaLegId, SipEngine, TlsVerifyState, TlsVerifyStatus,
    VideoSetting,
};
use crate::error::{ClientError, ClientResult};
use crate::events::{EventBus, Notification, ReconnectionState};
use crate::obfuscate;
use crate::ring::{NoRing, RingIndicator};
use crate::store::ConfigStore;
use crate::tls;

/// Process-scoped context handed to the processor at spawn time.
///
/// Bundles the external capabilities of the layer: the protocol engine, the
/// persistence helper, the event bus and the local ring indication. There is
/// no hidden global state; one context backs one processor.
pub struct SessionContext {
    /// The protocol engine capability set
    pub engine: Arc<dyn SipEngine>,
    /// Persistence for accounts, codec table and flags
    pub store: Arc<ConfigStore>,
    /// Notification fan-out
    pub events: Arc<EventBus>,
    /// Local ring/ringback indication
    pub ring: Arc<dyn RingIndicator>,
}

impl SessionContext {
    /// Creates a context with no local ring indication.
    pub fn new(engine: Arc<dyn SipEngine>, store: Arc<ConfigStore>, events: Arc<EventBus>) -> Self {
        Self { engine, store, events, ring: Arc::new(NoRing) }
    }

    /// Replaces the ring indication capability.
    pub fn with_ring(mut self, ring: Arc<dyn RingIndicator>) -> Self {
        self.ring = ring;
        self
    }
}

/// Work accepted by the worker queue.
pub(crate) enum WorkItem {
    Command(Command),
    Event(EngineEvent),
    Flush(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

/// Engine callback, reified so it can ride the same queue as commands.
#[derive(Debug, Clone)]
pub(crate) enum EngineEvent {
    RegistrationState {
        account_id: String,
        code: u32,
    },
    IncomingCall {
        account_id: String,
        call_id: CallId,
        remote_party: String,
        has_video: bool,
    },
    CallState {
        account_id: String,
        call_id: CallId,
        phase: CallPhase,
        status_code: u32,
    },
    MediaState {
        account_id: String,
        call_id: CallId,
        active_audio_legs: Vec<MediaLegId>,
    },
    IpChangeProgress {
        success: bool,
        completed: bool,
    },
    TransportState {
        tls: Option<TlsVerifyState>,
    },
}

/// Flavor of an outgoing call, deciding admission and notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutgoingKind {
    Plain,
    Transfer,
    Silent,
}

/// The failure notification a command maps to when its handler errors out.
enum FailureScope {
    Call { account_id: String, call_id: CallId },
    Registration { account_id: String },
    SilentCall { number: String },
    Codec,
    None,
}

impl FailureScope {
    fn for_command(command: &Command) -> Self {
        match command {
            Command::MakeCall { account_id, .. } => {
                FailureScope::Call { account_id: account_id.clone(), call_id: -1 }
            }
            Command::MakeDirectCall { .. } => {
                FailureScope::Call { account_id: "sip:guest".to_string(), call_id: -1 }
            }
            Command::MakeSilentCall { number, .. } => {
                FailureScope::SilentCall { number: number.clone() }
            }
            Command::HangUpCall { account_id, call_id }
            | Command::AcceptIncomingCall { account_id, call_id, .. }
            | Command::DeclineIncomingCall { account_id, call_id }
            | Command::SetHold { account_id, call_id, .. }
            | Command::ToggleHold { account_id, call_id }
            | Command::SetMute { account_id, call_id, .. }
            | Command::ToggleMute { account_id, call_id }
            | Command::SetVideoMute { account_id, call_id, .. }
            | Command::SwitchCaptureDevice { account_id, call_id }
            | Command::SendDtmf { account_id, call_id, .. }
            | Command::TransferCall { account_id, call_id, .. }
            | Command::AttendedTransferCall { account_id, call_id, .. }
            | Command::GetCallStatus { account_id, call_id } => {
                FailureScope::Call { account_id: account_id.clone(), call_id: *call_id }
            }
            Command::SetAccount { config } => {
                FailureScope::Registration { account_id: config.id_uri() }
            }
            Command::GetRegistrationStatus { account_id }
            | Command::RefreshRegistration { account_id, .. } => {
                FailureScope::Registration { account_id: account_id.clone() }
            }
            Command::SetCodecPriorities { .. } => FailureScope::Codec,
            Command::RemoveAccount { .. }
            | Command::RestartStack
            | Command::HangUpCalls { .. }
            | Command::GetCodecPriorities
            | Command::SetDnd { .. }
            | Command::ReconnectCall => FailureScope::None,
        }
    }
}

/// Spawns the serialized worker and returns its submission handle.
pub struct CommandProcessor;

impl CommandProcessor {
    /// Starts the worker task.
    ///
    /// Previously persisted accounts are re-added before the first submitted
    /// command runs (starting the engine if there are any), so the persisted
    /// configuration and the live engine state stay consistent across
    /// restarts.
    pub fn spawn(ctx: SessionContext) -> ProcessorHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let registry = Arc::new(SessionRegistry::new());
        let handle = ProcessorHandle { tx, registry: registry.clone() };

        let worker = Worker {
            ctx,
            registry,
            observer: Arc::new(handle.clone()),
            started: false,
            reconnection: ReconnectionState::Idle,
        };
        tokio::spawn(worker.run(rx));

        handle
    }
}

struct Worker {
    ctx: SessionContext,
    registry: Arc<SessionRegistry>,
    observer: Arc<ProcessorHandle>,
    started: bool,
    reconnection: ReconnectionState,
}

impl Worker {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<WorkItem>) {
        self.bootstrap().await;

        while let Some(item) = rx.recv().await {
            match item {
                WorkItem::Command(command) => {
                    let scope = FailureScope::for_command(&command);
                    if let Err(e) = self.handle_command(command).await {
                        error!(error = %e, "command failed");
                        self.report_failure(scope, &e);
                    }
                }
                WorkItem::Event(event) => {
                    if let Err(e) = self.handle_event(event).await {
                        error!(error = %e, "engine event handling failed");
                    }
                }
                WorkItem::Flush(ack) => {
                    let _ = ack.send(());
                }
                WorkItem::Shutdown(ack) => {
                    self.stop_stack().await;
                    let _ = ack.send(());
                    break;
                }
            }
        }

        debug!("command processor stopped");
    }

    /// Re-adds every persisted account on startup.
    async fn bootstrap(&mut self) {
        let accounts = match self.ctx.store.accounts() {
            Ok(accounts) => accounts,
            Err(e) => {
                error!(error = %e, "persisted accounts could not be loaded");
                return;
            }
        };

        if accounts.is_empty() {
            return;
        }

        if let Err(e) = self.ensure_started().await {
            error!(error = %e, "engine start failed during bootstrap");
            return;
        }

        for config in accounts {
            let account_id = config.id_uri();
            match self.ctx.engine.add_account(&config).await {
                Ok(()) => self.registry.insert(AccountSession::new(config)),
                Err(e) => {
                    error!(account = %self.loggable(&account_id), error = %e, "account not re-added")
                }
            }
        }
    }

    // ===== ENGINE LIFECYCLE =====

    /// Starts the engine if it is not running yet. Idempotent.
    async fn ensure_started(&mut self) -> ClientResult<()> {
        if self.started {
            return Ok(());
        }

        debug!("starting sip stack");
        self.ctx.engine.start(self.observer.clone()).await?;
        self.started = true;

        let table = match self.ctx.store.codec_priorities() {
            Ok(Some(table)) => table,
            Ok(None) => codec::default_table(),
            Err(e) => {
                error!(error = %e, "persisted codec table unreadable, using defaults");
                codec::default_table()
            }
        };
        for entry in &table {
            if let Err(e) = self
                .ctx
                .engine
                .set_codec_priority(entry.codec_id(), entry.priority())
                .await
            {
                warn!(codec = entry.codec_id(), error = %e, "codec priority not applied");
            }
        }

        self.ctx.events.publish(Notification::StackStatus { started: true });
        info!("sip stack started");
        Ok(())
    }

    /// Tears down all sessions and stops the engine. Idempotent.
    async fn stop_stack(&mut self) {
        if !self.started {
            return;
        }

        debug!("stopping sip stack");
        for account_id in self.registry.account_ids() {
            if let Err(e) = self.ctx.engine.remove_account(&account_id).await {
                error!(account = %self.loggable(&account_id), error = %e, "account removal failed during stop");
            }
        }
        self.registry.drain();

        if let Err(e) = self.ctx.engine.stop().await {
            error!(error = %e, "engine stop failed");
        }
        self.started = false;
        self.ctx.events.publish(Notification::StackStatus { started: false });
        info!("sip stack stopped");
    }

    // ===== COMMAND DISPATCH =====

    async fn handle_command(&mut self, command: Command) -> ClientResult<()> {
        match command {
            Command::SetAccount { config } => self.handle_set_account(config).await,
            Command::RemoveAccount { account_id } => self.handle_remove_account(account_id).await,
            Command::RestartStack => self.handle_restart_stack().await,
            Command::MakeCall { account_id, number, video, is_transfer } => {
                let kind = if is_transfer { OutgoingKind::Transfer } else { OutgoingKind::Plain };
                self.handle_make_call(account_id, number, video, kind).await
            }
            Command::MakeSilentCall { account_id, number } => {
                self.handle_make_call(
                    account_id,
                    number,
                    VideoSetting::audio_only(),
                    OutgoingKind::Silent,
                )
                .await
            }
            Command::MakeDirectCall { uri, sip_server, transport, guest_display_name, video } => {
                self.handle_make_direct_call(uri, sip_server, transport, guest_display_name, video)
                    .await
            }
            Command::HangUpCall { account_id, call_id } => {
                self.require_call(&account_id, call_id)?;
                self.ctx.engine.hangup(&account_id, call_id, status::DECLINE).await?;
                Ok(())
            }
            Command::HangUpCalls { account_id } => self.handle_hang_up_calls(account_id).await,
            Command::AcceptIncomingCall { account_id, call_id, video } => {
                self.handle_accept(account_id, call_id, video).await
            }
            Command::DeclineIncomingCall { account_id, call_id } => {
                self.require_call(&account_id, call_id)?;
                self.ctx.engine.answer(&account_id, call_id, status::DECLINE).await?;
                Ok(())
            }
            Command::SetHold { account_id, call_id, hold } => {
                self.handle_set_hold(account_id, call_id, hold).await
            }
            Command::ToggleHold { account_id, call_id } => {
                let current = self
                    .registry
                    .with_call(&account_id, call_id, |call| call.is_local_hold())
                    .ok_or_else(|| self.call_not_found(&account_id, call_id))?;
                self.handle_set_hold(account_id, call_id, !current).await
            }
            Command::SetMute { account_id, call_id, mute } => {
                self.handle_set_mute(account_id, call_id, mute).await
            }
            Command::ToggleMute { account_id, call_id } => {
                let current = self
                    .registry
                    .with_call(&account_id, call_id, |call| call.is_local_mute())
                    .ok_or_else(|| self.call_not_found(&account_id, call_id))?;
                self.handle_set_mute(account_id, call_id, !current).await
            }
            Command::SetVideoMute { account_id, call_id, mute } => {
                self.handle_set_video_mute(account_id, call_id, mute).await
            }
            Command::SwitchCaptureDevice { account_id, call_id } => {
                self.handle_switch_capture_device(account_id, call_id).await
            }
            Command::SendDtmf { account_id, call_id, digits } => {
                self.handle_send_dtmf(account_id, call_id, digits).await
            }
            Command::TransferCall { account_id, call_id, destination } => {
                self.handle_transfer(account_id, call_id, destination).await
            }
            Command::AttendedTransferCall { account_id, call_id, destination_call_id } => {
                self.handle_attended_transfer(account_id, call_id, destination_call_id).await
            }
            Command::GetCallStatus { account_id, call_id } => {
                self.require_call(&account_id, call_id)?;
                self.publish_call_snapshot(&account_id, call_id);
                Ok(())
            }
            Command::GetCodecPriorities => self.handle_get_codec_priorities().await,
            Command::SetCodecPriorities { priorities } => {
                self.handle_set_codec_priorities(priorities).await
            }
            Command::GetRegistrationStatus { account_id } => {
                self.handle_get_registration_status(account_id).await
            }
            Command::RefreshRegistration { account_id, expiration_secs, contact_uri_params } => {
                self.handle_refresh_registration(account_id, expiration_secs, contact_uri_params)
                    .await
            }
            Command::SetDnd { enabled } => {
                if let Err(e) = self.ctx.store.set_dnd(enabled) {
                    error!(error = %e, "dnd flag not persisted");
                }
                Ok(())
            }
            Command::ReconnectCall => self.handle_reconnect().await,
        }
    }

    // ===== ACCOUNT COMMANDS =====

    /// Create-or-refresh semantics: an equivalent valid session only gets a
    /// registration refresh; anything else tears the old session down and
    /// registers a fresh one. The configuration is persisted either way.
    async fn handle_set_account(&mut self, config: AccountConfig) -> ClientResult<()> {
        let account_id = config.id_uri();
        self.ensure_started().await?;

        let existing = self.registry.with_account(&account_id, |account| account.config().clone());
        match existing {
            Some(current) if current == config && current.is_valid() => {
                debug!(account = %self.loggable(&account_id), "account unchanged, refreshing registration");
                self.ctx
                    .engine
                    .refresh_registration(
                        &account_id,
                        config.reg_expiration_secs,
                        contact_params(&config),
                    )
                    .await?;
            }
            Some(_) => {
                debug!(account = %self.loggable(&account_id), "reconfiguring account");
                if let Err(e) = self.ctx.engine.remove_account(&account_id).await {
                    warn!(error = %e, "stale account removal failed");
                }
                self.registry.remove(&account_id);
                self.ctx.engine.add_account(&config).await?;
                self.registry.insert(AccountSession::new(config.clone()));
            }
            None => {
                debug!(account = %self.loggable(&account_id), "adding account");
                self.ctx.engine.add_account(&config).await?;
                self.registry.insert(AccountSession::new(config.clone()));
            }
        }

        // Persistence failures do not roll back the live session; the next
        // successful set-account will repair the stored list.
        if let Err(e) = self.persist_account(config) {
            error!(account = %self.loggable(&account_id), error = %e, "account not persisted");
        }
        Ok(())
    }

    async fn handle_remove_account(&mut self, account_id: String) -> ClientResult<()> {
        match self.registry.remove(&account_id) {
            Some(session) => {
                for call_id in session.call_ids() {
                    if let Err(e) = self.ctx.engine.hangup(&account_id, call_id, status::DECLINE).await
                    {
                        warn!(call = call_id, error = %e, "call hangup failed during account removal");
                    }
                }
                if let Err(e) = self.ctx.engine.remove_account(&account_id).await {
                    error!(account = %self.loggable(&account_id), error = %e, "account unregistration failed");
                }
                debug!(account = %self.loggable(&account_id), "account removed");
            }
            None => {
                error!(account = %self.loggable(&account_id), "no account for id");
            }
        }

        match self.ctx.store.accounts() {
            Ok(mut accounts) => {
                accounts.retain(|account| account.id_uri() != account_id);
                if let Err(e) = self.ctx.store.persist_accounts(&accounts) {
                    error!(error = %e, "account list not persisted");
                }
            }
            Err(e) => error!(error = %e, "persisted accounts unreadable"),
        }

        if self.started && self.registry.is_empty() {
            debug!("no sessions remain, shutting the stack down");
            self.stop_stack().await;
        }
        Ok(())
    }

    async fn handle_restart_stack(&mut self) -> ClientResult<()> {
        self.stop_stack().await;

        let accounts = self.ctx.store.accounts()?;
        if accounts.is_empty() {
            return Ok(());
        }

        self.ensure_started().await?;
        for config in accounts {
            let account_id = config.id_uri();
            match self.ctx.engine.add_account(&config).await {
                Ok(()) => self.registry.insert(AccountSession::new(config)),
                Err(e) => {
                    error!(account = %self.loggable(&account_id), error = %e, "account not re-added")
                }
            }
        }
        Ok(())
    }

    // ===== CALL COMMANDS =====

    async fn handle_make_call(
        &mut self,
        account_id: String,
        number: String,
        video: VideoSetting,
        kind: OutgoingKind,
    ) -> ClientResult<()> {
        let realm = self
            .registry
            .with_account(&account_id, |account| account.config().realm.clone())
            .ok_or_else(|| ClientError::AccountNotFound { account_id: account_id.clone() })?;

        // One live call at a time, mirroring single-device audio routing; a
        // consultation call for an attended transfer may coexist with the
        // call being transferred.
        let allowed = if kind == OutgoingKind::Transfer { 1 } else { 0 };
        if self.registry.total_calls() > allowed {
            return Err(ClientError::internal("another call is already in progress"));
        }

        let uri = dial_uri(&number, &realm);
        let call_id = self.ctx.engine.make_call(&account_id, &uri, video).await?;

        self.registry.with_account_mut(&account_id, |account| {
            let mut call = CallSession::outgoing(call_id, &account_id, video);
            call.set_silent(kind == OutgoingKind::Silent);
            account.insert_call(call);
        });
        debug!(account = %self.loggable(&account_id), call = call_id, "outgoing call placed");

        if kind == OutgoingKind::Silent {
            self.ctx
                .events
                .publish(Notification::SilentCallStatus { success: true, number });
        } else {
            self.ctx.events.publish(Notification::OutgoingCall {
                account_id,
                call_id,
                number,
                is_video: video.video,
                is_video_conference: video.video_conference,
                is_transfer: kind == OutgoingKind::Transfer,
            });
        }
        Ok(())
    }

    /// Guest call: a throwaway unregistered session that lives exactly as
    /// long as its one call.
    async fn handle_make_direct_call(
        &mut self,
        uri: String,
        sip_server: String,
        transport: crate::client::config::AccountTransport,
        guest_display_name: String,
        video: VideoSetting,
    ) -> ClientResult<()> {
        self.ensure_started().await?;

        if self.registry.has_guest() {
            return Err(ClientError::internal("a guest session is already active"));
        }

        let config = AccountConfig::new()
            .with_username("guest")
            .with_realm("*")
            .with_host(sip_server)
            .with_transport(transport)
            .with_guest_display_name(guest_display_name);
        let account_id = config.id_uri();

        self.ctx.engine.add_guest_account(&config).await?;
        self.registry.insert(AccountSession::new_guest(config));

        let call_id = match self.ctx.engine.make_call(&account_id, &uri, video).await {
            Ok(call_id) => call_id,
            Err(e) => {
                if let Err(remove_err) = self.ctx.engine.remove_account(&account_id).await {
                    warn!(error = %remove_err, "guest session removal failed");
                }
                self.registry.remove(&account_id);
                if self.registry.is_empty() {
                    self.stop_stack().await;
                }
                return Err(e.into());
            }
        };

        self.registry.with_account_mut(&account_id, |account| {
            account.insert_call(CallSession::outgoing(call_id, &account_id, video));
        });
        debug!(call = call_id, "direct call placed through guest session");

        self.ctx.events.publish(Notification::OutgoingCall {
            account_id,
            call_id,
            number: uri,
            is_video: video.video,
            is_video_conference: video.video_conference,
            is_transfer: false,
        });
        Ok(())
    }

    async fn handle_hang_up_calls(&mut self, account_id: String) -> ClientResult<()> {
        let call_ids = match self.registry.with_account(&account_id, |account| account.call_ids()) {
            Some(call_ids) => call_ids,
            None => {
                warn!(account = %self.loggable(&account_id), "hang-up-calls for unknown account");
                return Ok(());
            }
        };

        for call_id in call_ids {
            if let Err(e) = self.ctx.engine.hangup(&account_id, call_id, status::DECLINE).await {
                warn!(call = call_id, error = %e, "hangup failed");
                self.publish_disconnected(&account_id, call_id);
            }
        }
        Ok(())
    }

    async fn handle_accept(
        &mut self,
        account_id: String,
        call_id: CallId,
        video: VideoSetting,
    ) -> ClientResult<()> {
        self.require_call(&account_id, call_id)?;
        self.ctx.engine.answer(&account_id, call_id, status::OK).await?;
        self.registry.with_call_mut(&account_id, call_id, |call| call.set_video(video));
        Ok(())
    }

    /// No-op when the call is already in the requested hold state; the local
    /// flag changes only after the engine accepted the transition, and a
    /// failed engine call leaves both flag and call untouched.
    async fn handle_set_hold(
        &mut self,
        account_id: String,
        call_id: CallId,
        hold: bool,
    ) -> ClientResult<()> {
        let (current, terminal) = self
            .registry
            .with_call(&account_id, call_id, |call| (call.is_local_hold(), call.is_terminal()))
            .ok_or_else(|| self.call_not_found(&account_id, call_id))?;
        if terminal {
            return Err(self.call_not_found(&account_id, call_id));
        }
        if current == hold {
            debug!(call = call_id, hold, "call already in requested hold state");
            return Ok(());
        }

        let result = if hold {
            debug!(call = call_id, "holding call");
            self.ctx.engine.hold(&account_id, call_id).await
        } else {
            debug!(call = call_id, "un-holding call");
            self.ctx.engine.reinvite_unhold(&account_id, call_id).await
        };

        match result {
            Ok(()) => {
                self.registry.with_call_mut(&account_id, call_id, |call| call.set_local_hold(hold));
                self.publish_call_snapshot(&account_id, call_id);
            }
            Err(e) => {
                let operation = if hold { "hold" } else { "unhold" };
                error!(call = call_id, error = %e, "{operation} failed, state unchanged");
            }
        }
        Ok(())
    }

    /// Mute disconnects the capture device from every active audio leg's
    /// transmit path, unmute reconnects it; the flag follows only when every
    /// leg switched.
    async fn handle_set_mute(
        &mut self,
        account_id: String,
        call_id: CallId,
        mute: bool,
    ) -> ClientResult<()> {
        let (current, terminal) = self
            .registry
            .with_call(&account_id, call_id, |call| (call.is_local_mute(), call.is_terminal()))
            .ok_or_else(|| self.call_not_found(&account_id, call_id))?;
        if terminal {
            return Err(self.call_not_found(&account_id, call_id));
        }
        if current == mute {
            return Ok(());
        }

        let legs = self.ctx.engine.audio_legs(&account_id, call_id).await?;
        let mut all_switched = true;
        for leg in legs {
            let result = if mute {
                self.ctx.engine.disconnect_capture(&account_id, call_id, leg).await
            } else {
                self.ctx.engine.connect_capture(&account_id, call_id, leg).await
            };
            if let Err(e) = result {
                error!(call = call_id, leg, error = %e, "capture path switch failed");
                all_switched = false;
            }
        }

        if all_switched {
            self.registry.with_call_mut(&account_id, call_id, |call| call.set_local_mute(mute));
            self.publish_call_snapshot(&account_id, call_id);
        }
        Ok(())
    }

    async fn handle_set_video_mute(
        &mut self,
        account_id: String,
        call_id: CallId,
        mute: bool,
    ) -> ClientResult<()> {
        let current = self
            .registry
            .with_call(&account_id, call_id, |call| call.is_local_video_mute())
            .ok_or_else(|| self.call_not_found(&account_id, call_id))?;
        if current == mute {
            return Ok(());
        }

        self.ctx.engine.set_video_transmit(&account_id, call_id, !mute).await?;
        self.registry.with_call_mut(&account_id, call_id, |call| call.set_local_video_mute(mute));
        self.publish_call_snapshot(&account_id, call_id);
        Ok(())
    }

    async fn handle_switch_capture_device(
        &mut self,
        account_id: String,
        call_id: CallId,
    ) -> ClientResult<()> {
        let device = self
            .registry
            .with_call(&account_id, call_id, |call| call.capture_device().switched())
            .ok_or_else(|| self.call_not_found(&account_id, call_id))?;

        self.ctx.engine.set_capture_device(&account_id, call_id, device).await?;
        self.registry.with_call_mut(&account_id, call_id, |call| call.set_capture_device(device));
        Ok(())
    }

    /// Tones go out one at a time; the first engine error stops the
    /// sequence and is reported, never retried.
    async fn handle_send_dtmf(
        &mut self,
        account_id: String,
        call_id: CallId,
        digits: String,
    ) -> ClientResult<()> {
        self.require_call(&account_id, call_id)?;

        if !digits.chars().all(|c| c.is_ascii_digit() || c == '*' || c == '#') {
            warn!(call = call_id, "dtmf string contains unsupported characters, not sent");
            return Ok(());
        }

        for tone in digits.chars() {
            if let Err(e) = self
                .ctx
                .engine
                .send_dtmf(&account_id, call_id, tone.to_string().as_str())
                .await
            {
                error!(call = call_id, error = %e, "dtmf tone not sent");
                break;
            }
        }
        Ok(())
    }

    async fn handle_transfer(
        &mut self,
        account_id: String,
        call_id: CallId,
        destination: String,
    ) -> ClientResult<()> {
        self.require_call(&account_id, call_id)?;
        let realm = self
            .registry
            .with_account(&account_id, |account| account.config().realm.clone())
            .unwrap_or_default();

        let target = transfer_uri(&destination, &realm);
        self.ctx.engine.transfer(&account_id, call_id, &target).await?;
        debug!(call = call_id, "blind transfer requested");
        Ok(())
    }

    /// A missing destination call is a reported not-found condition for the
    /// source call, not a crash.
    async fn handle_attended_transfer(
        &mut self,
        account_id: String,
        call_id: CallId,
        destination_call_id: CallId,
    ) -> ClientResult<()> {
        self.require_call(&account_id, call_id)?;
        if self.registry.with_call(&account_id, destination_call_id, |_| ()).is_none() {
            return Err(ClientError::CallNotFound {
                account_id,
                call_id: destination_call_id,
            });
        }

        self.ctx
            .engine
            .attended_transfer(&account_id, call_id, destination_call_id)
            .await?;
        debug!(call = call_id, dest = destination_call_id, "attended transfer requested");
        Ok(())
    }

    // ===== CODEC COMMANDS =====

    async fn handle_get_codec_priorities(&mut self) -> ClientResult<()> {
        self.ensure_started().await?;

        let mut priorities = self.ctx.engine.codecs().await?;
        let mut seen = HashSet::new();
        priorities.retain(|codec| seen.insert(codec.codec_id().to_string()));
        codec::sort_descending(&mut priorities);

        self.ctx.events.publish(Notification::CodecPriorities { priorities });
        Ok(())
    }

    /// Applies entries in table order. The table is persisted and success is
    /// reported only when every entry applied; on a partial failure the
    /// entries already applied to the engine stay applied — per-entry engine
    /// calls are not reversible, and this layer does not pretend otherwise.
    async fn handle_set_codec_priorities(
        &mut self,
        priorities: Vec<CodecPriority>,
    ) -> ClientResult<()> {
        self.ensure_started().await?;

        for entry in &priorities {
            if let Err(e) = self
                .ctx
                .engine
                .set_codec_priority(entry.codec_id(), entry.priority())
                .await
            {
                error!(codec = entry.codec_id(), error = %e, "codec priority rejected, aborting table");
                self.ctx
                    .events
                    .publish(Notification::CodecPrioritiesSetStatus { success: false });
                return Ok(());
            }
        }

        match self.ctx.store.persist_codec_priorities(&priorities) {
            Ok(()) => {
                self.ctx
                    .events
                    .publish(Notification::CodecPrioritiesSetStatus { success: true });
            }
            Err(e) => {
                error!(error = %e, "codec table not persisted");
                self.ctx
                    .events
                    .publish(Notification::CodecPrioritiesSetStatus { success: false });
            }
        }
        Ok(())
    }

    // ===== REGISTRATION COMMANDS =====

    async fn handle_get_registration_status(&mut self, account_id: String) -> ClientResult<()> {
        if !self.started || !self.registry.contains(&account_id) {
            self.ctx.events.publish(Notification::RegistrationState {
                account_id,
                code: status::BAD_REQUEST,
            });
            return Ok(());
        }

        let code = self.ctx.engine.registration_status(&account_id).await?;
        self.ctx.events.publish(Notification::RegistrationState { account_id, code });
        Ok(())
    }

    async fn handle_refresh_registration(
        &mut self,
        account_id: String,
        expiration_secs: u32,
        contact_uri_params: Option<String>,
    ) -> ClientResult<()> {
        let (config, changed) = self
            .registry
            .with_account_mut(&account_id, |account| {
                let config = account.config_mut();
                let mut changed = false;
                if expiration_secs != 0 && expiration_secs != config.reg_expiration_secs {
                    config.reg_expiration_secs = expiration_secs;
                    changed = true;
                }
                if let Some(params) = &contact_uri_params {
                    if *params != config.contact_uri_params {
                        config.contact_uri_params = params.clone();
                        changed = true;
                    }
                }
                (config.clone(), changed)
            })
            .ok_or_else(|| ClientError::AccountNotFound { account_id: account_id.clone() })?;

        if changed {
            if let Err(e) = self.persist_account(config.clone()) {
                error!(error = %e, "updated registration parameters not persisted");
            }
        }

        self.ctx
            .engine
            .refresh_registration(&account_id, config.reg_expiration_secs, contact_params(&config))
            .await?;
        Ok(())
    }

    // ===== RECONNECTION =====

    /// Explicit reconnect: ask the engine to restart transports and refresh
    /// registrations/dialogs. No automatic retry happens here; retry policy
    /// belongs to the caller.
    async fn handle_reconnect(&mut self) -> ClientResult<()> {
        self.set_reconnection(ReconnectionState::Progress);
        if let Err(e) = self.ctx.engine.handle_ip_change().await {
            error!(error = %e, "ip change handling failed");
            self.fail_reconnection().await;
        }
        Ok(())
    }

    fn set_reconnection(&mut self, state: ReconnectionState) {
        if self.reconnection != state {
            debug!(from = ?self.reconnection, to = ?state, "reconnection state changed");
        }
        self.reconnection = state;
        self.ctx.events.publish(Notification::ReconnectionState { state });
    }

    /// Reconnection failed: all calls are unconditionally hung up.
    async fn fail_reconnection(&mut self) {
        for account_id in self.registry.account_ids() {
            let call_ids = self
                .registry
                .with_account(&account_id, |account| account.call_ids())
                .unwrap_or_default();
            for call_id in call_ids {
                if let Err(e) = self.ctx.engine.hangup(&account_id, call_id, status::DECLINE).await
                {
                    warn!(call = call_id, error = %e, "hangup failed during reconnection failure");
                }
            }
        }
        self.set_reconnection(ReconnectionState::Failed);
    }

    // ===== ENGINE EVENTS =====

    async fn handle_event(&mut self, event: EngineEvent) -> ClientResult<()> {
        match event {
            EngineEvent::RegistrationState { account_id, code } => {
                self.ctx.events.publish(Notification::RegistrationState { account_id, code });
                Ok(())
            }
            EngineEvent::IncomingCall { account_id, call_id, remote_party, has_video } => {
                self.on_incoming_call(account_id, call_id, remote_party, has_video).await
            }
            EngineEvent::CallState { account_id, call_id, phase, status_code } => {
                self.on_call_state(account_id, call_id, phase, status_code).await
            }
            EngineEvent::MediaState { account_id, call_id, active_audio_legs } => {
                self.on_media_state(account_id, call_id, active_audio_legs).await
            }
            EngineEvent::IpChangeProgress { success, completed } => {
                if !success {
                    self.fail_reconnection().await;
                } else if completed {
                    self.set_reconnection(ReconnectionState::Success);
                }
                Ok(())
            }
            EngineEvent::TransportState { tls } => self.on_transport_state(tls).await,
        }
    }

    /// Inbound admission: one concurrent inbound call per account. A second
    /// call is auto-declined busy and surfaces only as a missed call; a
    /// do-not-disturb decline behaves the same with a 603.
    async fn on_incoming_call(
        &mut self,
        account_id: String,
        call_id: CallId,
        remote_party: String,
        has_video: bool,
    ) -> ClientResult<()> {
        if !self.registry.contains(&account_id) {
            warn!(account = %self.loggable(&account_id), "incoming call for unknown account, declining");
            let _ = self.ctx.engine.answer(&account_id, call_id, status::DECLINE).await;
            return Ok(());
        }

        let caller = CallerInfo::parse(&remote_party);
        let video = VideoSetting { video: has_video, video_conference: false };

        let tracked = self
            .registry
            .with_account_mut(&account_id, |account| {
                account.insert_call(CallSession::incoming(call_id, &account_id, video));
                account.call_count()
            })
            .unwrap_or(0);

        if self.ctx.store.is_dnd() {
            debug!(call = call_id, "declining call, do-not-disturb is active");
            self.ctx.events.publish(Notification::MissedCall {
                display_name: caller.display_name,
                remote_uri: caller.remote_uri,
            });
            if let Err(e) = self.ctx.engine.answer(&account_id, call_id, status::DECLINE).await {
                error!(call = call_id, error = %e, "decline failed");
            }
            return Ok(());
        }

        if tracked > 1 {
            debug!(call = call_id, "sending busy, another call is active");
            self.ctx.events.publish(Notification::MissedCall {
                display_name: caller.display_name,
                remote_uri: caller.remote_uri,
            });
            if let Err(e) = self.ctx.engine.answer(&account_id, call_id, status::BUSY_HERE).await {
                error!(call = call_id, error = %e, "busy answer failed");
            }
            return Ok(());
        }

        if let Err(e) = self.ctx.engine.answer(&account_id, call_id, status::RINGING).await {
            error!(call = call_id, error = %e, "provisional ringing answer failed");
        }
        self.registry.with_call_mut(&account_id, call_id, |call| {
            call.set_phase(CallPhase::Ringing);
            call.set_last_status_code(status::RINGING);
        });
        self.ctx.ring.start_ring();

        debug!(account = %self.loggable(&account_id), call = call_id, "incoming call admitted");
        self.ctx.events.publish(Notification::IncomingCall {
            account_id,
            call_id,
            display_name: caller.display_name,
            remote_uri: caller.remote_uri,
            is_video: has_video,
        });
        Ok(())
    }

    /// Applies an engine-reported phase change.
    ///
    /// Disconnection is terminal: the call is detached from its account
    /// exactly once, and a second disconnection event for the same id is a
    /// no-op rather than an error.
    async fn on_call_state(
        &mut self,
        account_id: String,
        call_id: CallId,
        phase: CallPhase,
        status_code: u32,
    ) -> ClientResult<()> {
        let known = self
            .registry
            .with_call(&account_id, call_id, |call| {
                (call.direction(), call.is_ringback_active())
            });
        let Some((direction, ringback_active)) = known else {
            if phase == CallPhase::Disconnected {
                debug!(call = call_id, "disconnect for already-detached call ignored");
            } else {
                warn!(call = call_id, ?phase, "state change for unknown call ignored");
            }
            return Ok(());
        };

        match phase {
            CallPhase::Disconnected => {
                self.ctx.ring.stop_ring();
                if ringback_active {
                    self.ctx.ring.stop_ringback();
                }

                let removed = self
                    .registry
                    .with_account_mut(&account_id, |account| account.remove_call(call_id))
                    .flatten();
                let Some(call) = removed else {
                    return Ok(());
                };
                debug!(call = call_id, "call disconnected and detached");

                self.ctx.events.publish(Notification::CallState {
                    account_id: account_id.clone(),
                    call_id,
                    phase: CallPhase::Disconnected,
                    status_code,
                    connect_timestamp: call.connect_timestamp_ms(),
                    local_hold: call.is_local_hold(),
                    local_mute: call.is_local_mute(),
                    local_video_mute: call.is_local_video_mute(),
                });

                let idle_guest = self
                    .registry
                    .with_account(&account_id, |account| {
                        account.is_guest() && account.call_count() == 0
                    })
                    .unwrap_or(false);
                if idle_guest {
                    debug!("guest session finished, tearing it down");
                    if let Err(e) = self.ctx.engine.remove_account(&account_id).await {
                        warn!(error = %e, "guest session removal failed");
                    }
                    self.registry.remove(&account_id);
                    if self.registry.is_empty() {
                        self.stop_stack().await;
                    }
                }
            }
            CallPhase::Confirmed => {
                self.ctx.ring.stop_ring();
                if ringback_active {
                    self.ctx.ring.stop_ringback();
                }
                self.registry.with_call_mut(&account_id, call_id, |call| {
                    call.set_phase(CallPhase::Confirmed);
                    call.set_last_status_code(status_code);
                    call.set_ringback_active(false);
                    call.mark_connected();
                });
                self.publish_call_snapshot(&account_id, call_id);
            }
            CallPhase::Early => {
                let ringback = if status_code == status::RINGING
                    && direction == crate::client::call::CallDirection::Outgoing
                {
                    // 180 from the remote side: play local ringback
                    if ringback_active {
                        self.ctx.ring.stop_ringback();
                    }
                    self.ctx.ring.start_ringback();
                    true
                } else if status_code == status::PROGRESS {
                    // 183 carries early media, stop the local tone
                    if ringback_active {
                        self.ctx.ring.stop_ringback();
                    }
                    false
                } else {
                    ringback_active
                };

                self.registry.with_call_mut(&account_id, call_id, |call| {
                    call.set_phase(CallPhase::Early);
                    call.set_last_status_code(status_code);
                    call.set_ringback_active(ringback);
                });
                self.publish_call_snapshot(&account_id, call_id);
            }
            CallPhase::Initiated | CallPhase::Ringing => {
                self.registry.with_call_mut(&account_id, call_id, |call| {
                    call.set_phase(phase);
                    call.set_last_status_code(status_code);
                });
                self.publish_call_snapshot(&account_id, call_id);
            }
        }
        Ok(())
    }

    /// Media (re)activation: stop any ring indication and re-apply the mute
    /// flag, which the engine forgets across re-invites.
    async fn on_media_state(
        &mut self,
        account_id: String,
        call_id: CallId,
        active_audio_legs: Vec<MediaLegId>,
    ) -> ClientResult<()> {
        self.ctx.ring.stop_ring();

        let muted = self.registry.with_call(&account_id, call_id, |call| call.is_local_mute());
        let Some(muted) = muted else {
            return Ok(());
        };

        if muted {
            for leg in active_audio_legs {
                if let Err(e) = self.ctx.engine.disconnect_capture(&account_id, call_id, leg).await
                {
                    error!(call = call_id, leg, error = %e, "mute not re-applied to new media leg");
                }
            }
        }
        Ok(())
    }

    async fn on_transport_state(&mut self, tls: Option<TlsVerifyState>) -> ClientResult<()> {
        let Some(tls) = tls else {
            return Ok(());
        };
        if !self.ctx.store.is_verify_server_cert() {
            return Ok(());
        }

        match tls.status {
            TlsVerifyStatus::Success => {
                debug!("sip server certificate verification succeeded");
            }
            TlsVerifyStatus::IdentityMismatch => {
                let host = self
                    .registry
                    .account_ids()
                    .first()
                    .and_then(|id| self.registry.with_account(id, |a| a.config().host.clone()));
                let rescued = match host {
                    Some(host) => tls::is_wildcard_valid(&tls.cert_names, &host),
                    None => false,
                };
                if rescued {
                    info!("certificate identity mismatch rescued by wildcard name");
                } else {
                    error!("sip server certificate is not valid");
                    self.ctx.events.publish(Notification::TlsVerifyFailed);
                    self.stop_stack().await;
                }
            }
            TlsVerifyStatus::Failed => {
                error!("sip server certificate verification failed");
                self.ctx.events.publish(Notification::TlsVerifyFailed);
                self.stop_stack().await;
            }
        }
        Ok(())
    }

    // ===== HELPERS =====

    fn report_failure(&self, scope: FailureScope, error: &ClientError) {
        match scope {
            FailureScope::Call { account_id, call_id } => {
                self.publish_disconnected(&account_id, call_id);
            }
            FailureScope::Registration { account_id } => {
                let code = match error {
                    ClientError::AccountNotFound { .. } => status::BAD_REQUEST,
                    _ => status::INTERNAL_SERVER_ERROR,
                };
                self.ctx.events.publish(Notification::RegistrationState { account_id, code });
            }
            FailureScope::SilentCall { number } => {
                self.ctx
                    .events
                    .publish(Notification::SilentCallStatus { success: false, number });
            }
            FailureScope::Codec => {
                self.ctx
                    .events
                    .publish(Notification::CodecPrioritiesSetStatus { success: false });
            }
            FailureScope::None => {}
        }
    }

    /// Synthesized terminal notification for operations referencing a call
    /// that no longer exists (or could not be created).
    fn publish_disconnected(&self, account_id: &str, call_id: CallId) {
        self.ctx.events.publish(Notification::CallState {
            account_id: account_id.to_string(),
            call_id,
            phase: CallPhase::Disconnected,
            status_code: status::REQUEST_TERMINATED,
            connect_timestamp: 0,
            local_hold: false,
            local_mute: false,
            local_video_mute: false,
        });
    }

    fn publish_call_snapshot(&self, account_id: &str, call_id: CallId) {
        let snapshot = self.registry.with_call(account_id, call_id, |call| {
            Notification::CallState {
                account_id: account_id.to_string(),
                call_id,
                phase: call.phase(),
                status_code: call.last_status_code(),
                connect_timestamp: call.connect_timestamp_ms(),
                local_hold: call.is_local_hold(),
                local_mute: call.is_local_mute(),
                local_video_mute: call.is_local_video_mute(),
            }
        });
        if let Some(notification) = snapshot {
            self.ctx.events.publish(notification);
        }
    }

    fn require_call(&self, account_id: &str, call_id: CallId) -> ClientResult<()> {
        self.registry
            .with_call(account_id, call_id, |_| ())
            .ok_or_else(|| self.call_not_found(account_id, call_id))
    }

    fn call_not_found(&self, account_id: &str, call_id: CallId) -> ClientError {
        ClientError::CallNotFound { account_id: account_id.to_string(), call_id }
    }

    fn persist_account(&self, config: AccountConfig) -> ClientResult<()> {
        let mut accounts = self.ctx.store.accounts()?;
        match accounts.iter().position(|a| a.id_uri() == config.id_uri()) {
            Some(index) => accounts[index] = config,
            None => accounts.push(config),
        }
        self.ctx.store.persist_accounts(&accounts)
    }

    fn loggable(&self, account_id: &str) -> String {
        obfuscate::log_value(self.ctx.store.is_obfuscation_enabled(), account_id)
    }
}

/// Composes the URI to dial from a raw number and the account realm.
fn dial_uri(number: &str, realm: &str) -> String {
    if number.starts_with("sip:") {
        number.to_string()
    } else if realm == "*" {
        format!("sip:{number}")
    } else {
        format!("sip:{number}@{realm}")
    }
}

/// Composes a transfer target; destinations that are not fully qualified are
/// completed with the owning account's realm.
fn transfer_uri(destination: &str, realm: &str) -> String {
    if destination.starts_with("sip:") {
        format!("<{destination}>")
    } else if realm == "*" {
        format!("<sip:{destination}>")
    } else {
        format!("<sip:{destination}@{realm}>")
    }
}

fn contact_params(config: &AccountConfig) -> Option<&str> {
    if config.contact_uri_params.is_empty() {
        None
    } else {
        Some(config.contact_uri_params.as_str())
    }
}

#[cfg(test)]
mod uri_tests {
    use super::*;

    #[test]
    fn dial_uri_composition() {
        assert_eq!(dial_uri("sip:bob@elsewhere.com", "example.com"), "sip:bob@elsewhere.com");
        assert_eq!(dial_uri("200", "example.com"), "sip:200@example.com");
        assert_eq!(dial_uri("200", "*"), "sip:200");
    }

    #[test]
    fn transfer_uri_composition() {
        assert_eq!(transfer_uri("sip:200@mycompany.com", "example.com"), "<sip:200@mycompany.com>");
        assert_eq!(transfer_uri("200", "example.com"), "<sip:200@example.com>");
        assert_eq!(transfer_uri("200", "*"), "<sip:200>");
    }
}
