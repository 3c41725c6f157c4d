//! Integration tests for the command processor.
//!
//! A scripted mock engine records every capability invocation and lets the
//! tests inject engine callbacks through the registered observer, so the
//! full command → engine → callback → notification loop runs in-process.

use std::collections::HashSet;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::client::command::ProcessorHandle;
use crate::client::config::{AccountConfig, AccountTransport};
use crate::client::processor::{CommandProcessor, SessionContext};
use crate::codec::{self, CodecPriority};
use crate::engine::{
    status, CallId, CallPhase, CaptureDevice, EngineError, EngineObserver, EngineResult,
    MediaLegId, SipEngine, TlsVerifyState, TlsVerifyStatus, VideoSetting,
};
use crate::error::ClientError;
use crate::events::{EventBus, Notification, NotificationKind, ReconnectionState, Subscription};
use crate::store::{ConfigStore, MemoryStore};

// ===== MOCK ENGINE =====

#[derive(Default)]
struct MockEngine {
    log: Mutex<Vec<String>>,
    fail_ops: Mutex<HashSet<String>>,
    observer: Mutex<Option<Arc<dyn EngineObserver>>>,
    next_call_id: AtomicI32,
    codecs: Mutex<Vec<CodecPriority>>,
    audio_legs: Mutex<Vec<MediaLegId>>,
    registration_code: AtomicI32,
}

impl MockEngine {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            next_call_id: AtomicI32::new(1),
            audio_legs: Mutex::new(vec![0]),
            registration_code: AtomicI32::new(status::OK as i32),
            ..Default::default()
        })
    }

    fn fail(&self, key: &str) {
        self.fail_ops.lock().unwrap().insert(key.to_string());
    }

    fn set_codecs(&self, codecs: Vec<CodecPriority>) {
        *self.codecs.lock().unwrap() = codecs;
    }

    fn count(&self, prefix: &str) -> usize {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|entry| entry.starts_with(prefix))
            .count()
    }

    fn record(&self, entry: String) {
        self.log.lock().unwrap().push(entry);
    }

    fn check(&self, op: &'static str, detail: &str) -> EngineResult<()> {
        let fail_ops = self.fail_ops.lock().unwrap();
        if fail_ops.contains(op) || fail_ops.contains(&format!("{op}:{detail}")) {
            Err(EngineError::new(op, "scripted failure"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl SipEngine for MockEngine {
    async fn start(&self, observer: Arc<dyn EngineObserver>) -> EngineResult<()> {
        self.record("start".to_string());
        self.check("start", "")?;
        *self.observer.lock().unwrap() = Some(observer);
        Ok(())
    }

    async fn stop(&self) -> EngineResult<()> {
        self.record("stop".to_string());
        self.check("stop", "")
    }

    async fn add_account(&self, config: &AccountConfig) -> EngineResult<()> {
        let id = config.id_uri();
        self.record(format!("add_account {id}"));
        self.check("add_account", &id)
    }

    async fn add_guest_account(&self, config: &AccountConfig) -> EngineResult<()> {
        let id = config.id_uri();
        self.record(format!("add_guest_account {id}"));
        self.check("add_guest_account", &id)
    }

    async fn remove_account(&self, account_id: &str) -> EngineResult<()> {
        self.record(format!("remove_account {account_id}"));
        self.check("remove_account", account_id)
    }

    async fn refresh_registration(
        &self,
        account_id: &str,
        expiration_secs: u32,
        _contact_uri_params: Option<&str>,
    ) -> EngineResult<()> {
        self.record(format!("refresh_registration {account_id} {expiration_secs}"));
        self.check("refresh_registration", account_id)
    }

    async fn registration_status(&self, account_id: &str) -> EngineResult<u32> {
        self.record(format!("registration_status {account_id}"));
        self.check("registration_status", account_id)?;
        Ok(self.registration_code.load(Ordering::SeqCst) as u32)
    }

    async fn make_call(&self, account_id: &str, uri: &str, _video: VideoSetting) -> EngineResult<CallId> {
        self.record(format!("make_call {account_id} {uri}"));
        self.check("make_call", uri)?;
        Ok(self.next_call_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn answer(&self, account_id: &str, call_id: CallId, code: u32) -> EngineResult<()> {
        self.record(format!("answer {account_id} {call_id} {code}"));
        self.check("answer", &code.to_string())
    }

    async fn hangup(&self, account_id: &str, call_id: CallId, code: u32) -> EngineResult<()> {
        self.record(format!("hangup {account_id} {call_id} {code}"));
        self.check("hangup", &call_id.to_string())
    }

    async fn hold(&self, account_id: &str, call_id: CallId) -> EngineResult<()> {
        self.record(format!("hold {account_id} {call_id}"));
        self.check("hold", &call_id.to_string())
    }

    async fn reinvite_unhold(&self, account_id: &str, call_id: CallId) -> EngineResult<()> {
        self.record(format!("reinvite_unhold {account_id} {call_id}"));
        self.check("reinvite_unhold", &call_id.to_string())
    }

    async fn audio_legs(&self, account_id: &str, call_id: CallId) -> EngineResult<Vec<MediaLegId>> {
        self.record(format!("audio_legs {account_id} {call_id}"));
        self.check("audio_legs", &call_id.to_string())?;
        Ok(self.audio_legs.lock().unwrap().clone())
    }

    async fn connect_capture(&self, account_id: &str, call_id: CallId, leg: MediaLegId) -> EngineResult<()> {
        self.record(format!("connect_capture {account_id} {call_id} {leg}"));
        self.check("connect_capture", &leg.to_string())
    }

    async fn disconnect_capture(&self, account_id: &str, call_id: CallId, leg: MediaLegId) -> EngineResult<()> {
        self.record(format!("disconnect_capture {account_id} {call_id} {leg}"));
        self.check("disconnect_capture", &leg.to_string())
    }

    async fn send_dtmf(&self, account_id: &str, call_id: CallId, tone: &str) -> EngineResult<()> {
        self.record(format!("send_dtmf {account_id} {call_id} {tone}"));
        self.check("send_dtmf", tone)
    }

    async fn transfer(&self, account_id: &str, call_id: CallId, destination: &str) -> EngineResult<()> {
        self.record(format!("transfer {account_id} {call_id} {destination}"));
        self.check("transfer", destination)
    }

    async fn attended_transfer(
        &self,
        account_id: &str,
        call_id: CallId,
        destination_call_id: CallId,
    ) -> EngineResult<()> {
        self.record(format!("attended_transfer {account_id} {call_id} {destination_call_id}"));
        self.check("attended_transfer", &destination_call_id.to_string())
    }

    async fn set_video_transmit(&self, account_id: &str, call_id: CallId, enabled: bool) -> EngineResult<()> {
        self.record(format!("set_video_transmit {account_id} {call_id} {enabled}"));
        self.check("set_video_transmit", "")
    }

    async fn set_capture_device(&self, account_id: &str, call_id: CallId, device: CaptureDevice) -> EngineResult<()> {
        self.record(format!("set_capture_device {account_id} {call_id} {device:?}"));
        self.check("set_capture_device", "")
    }

    async fn codecs(&self) -> EngineResult<Vec<CodecPriority>> {
        self.record("codecs".to_string());
        self.check("codecs", "")?;
        Ok(self.codecs.lock().unwrap().clone())
    }

    async fn set_codec_priority(&self, codec_id: &str, priority: u8) -> EngineResult<()> {
        self.record(format!("set_codec_priority {codec_id} {priority}"));
        self.check("set_codec_priority", codec_id)
    }

    async fn handle_ip_change(&self) -> EngineResult<()> {
        self.record("handle_ip_change".to_string());
        self.check("handle_ip_change", "")
    }
}

// ===== FIXTURE =====

struct Fixture {
    engine: Arc<MockEngine>,
    events: Arc<EventBus>,
    store: Arc<ConfigStore>,
    handle: ProcessorHandle,
    sub: Subscription,
}

fn alice() -> AccountConfig {
    AccountConfig::new()
        .with_username("alice")
        .with_password("secret")
        .with_realm("example.com")
        .with_host("pbx.example.com")
}

const ALICE: &str = "sip:alice@example.com";

fn fixture() -> Fixture {
    fixture_with_store(Arc::new(ConfigStore::new(Arc::new(MemoryStore::new()))))
}

fn fixture_with_store(store: Arc<ConfigStore>) -> Fixture {
    let engine = MockEngine::new();
    let events = Arc::new(EventBus::new());
    let sub = events.subscribe();
    let handle = CommandProcessor::spawn(SessionContext::new(
        engine.clone(),
        store.clone(),
        events.clone(),
    ));
    Fixture { engine, events, store, handle, sub }
}

impl Fixture {
    /// Waits for all queued work, then returns every notification seen so far.
    async fn drain(&mut self) -> Vec<Notification> {
        tokio::time::timeout(Duration::from_secs(5), self.handle.flush())
            .await
            .expect("flush timed out")
            .expect("processor alive");
        let mut out = Vec::new();
        while let Some(notification) = self.sub.try_recv() {
            out.push(notification);
        }
        out
    }

    async fn add_alice(&mut self) {
        self.handle.set_account(alice()).unwrap();
        self.drain().await;
    }

    /// Sets up one confirmed outgoing call and returns its id.
    async fn confirmed_call(&mut self) -> CallId {
        self.add_alice().await;
        self.handle.make_call(ALICE, "200", VideoSetting::audio_only()).unwrap();
        self.drain().await;
        let call_id = self.handle.call_ids(ALICE).unwrap()[0];
        self.handle.on_call_state(ALICE, call_id, CallPhase::Confirmed, status::OK);
        self.drain().await;
        call_id
    }
}

fn of_kind(notifications: &[Notification], kind: NotificationKind) -> Vec<&Notification> {
    notifications.iter().filter(|n| n.kind() == kind).collect()
}

// ===== ACCOUNT LIFECYCLE =====

#[tokio::test]
async fn set_account_starts_stack_registers_and_persists() {
    let mut fx = fixture();
    fx.handle.set_account(alice()).unwrap();
    let notifications = fx.drain().await;

    assert_eq!(fx.engine.count("start"), 1);
    assert_eq!(fx.engine.count(&format!("add_account {ALICE}")), 1);
    assert!(notifications.contains(&Notification::StackStatus { started: true }));
    assert_eq!(fx.store.accounts().unwrap(), vec![alice()]);
    assert_eq!(fx.handle.account_ids(), vec![ALICE.to_string()]);
}

#[tokio::test]
async fn replaying_an_unchanged_account_only_refreshes_registration() {
    let mut fx = fixture();
    fx.handle.set_account(alice()).unwrap();
    fx.handle.set_account(alice()).unwrap();
    fx.drain().await;

    assert_eq!(fx.engine.count(&format!("add_account {ALICE}")), 1);
    assert_eq!(fx.engine.count(&format!("refresh_registration {ALICE}")), 1);
    assert_eq!(fx.store.accounts().unwrap().len(), 1);
}

#[tokio::test]
async fn changing_an_account_recreates_the_session() {
    let mut fx = fixture();
    fx.handle.set_account(alice()).unwrap();
    fx.handle.set_account(alice().with_port(5080)).unwrap();
    fx.drain().await;

    assert_eq!(fx.engine.count(&format!("remove_account {ALICE}")), 1);
    assert_eq!(fx.engine.count(&format!("add_account {ALICE}")), 2);
    assert_eq!(fx.store.accounts().unwrap(), vec![alice().with_port(5080)]);
}

#[tokio::test]
async fn removing_the_last_account_stops_the_stack() {
    let mut fx = fixture();
    fx.add_alice().await;

    fx.handle.remove_account(ALICE).unwrap();
    let notifications = fx.drain().await;

    assert_eq!(fx.engine.count(&format!("remove_account {ALICE}")), 1);
    assert_eq!(fx.engine.count("stop"), 1);
    assert!(notifications.contains(&Notification::StackStatus { started: false }));
    assert!(fx.store.accounts().unwrap().is_empty());
    assert!(fx.handle.account_ids().is_empty());
}

#[tokio::test]
async fn persisted_accounts_are_readded_on_startup() {
    let store = Arc::new(ConfigStore::new(Arc::new(MemoryStore::new())));
    store.persist_accounts(&[alice()]).unwrap();

    let mut fx = fixture_with_store(store);
    fx.drain().await;

    assert_eq!(fx.engine.count("start"), 1);
    assert_eq!(fx.engine.count(&format!("add_account {ALICE}")), 1);
    assert_eq!(fx.handle.account_ids(), vec![ALICE.to_string()]);
}

#[tokio::test]
async fn malformed_account_ids_are_rejected_before_enqueuing() {
    let fx = fixture();
    let err = fx.handle.make_call("alice@example.com", "200", VideoSetting::audio_only());
    assert!(matches!(err, Err(ClientError::InvalidAccountId(_))));

    let err = fx.handle.remove_account("");
    assert!(matches!(err, Err(ClientError::InvalidAccountId(_))));
}

// ===== OUTGOING CALLS =====

#[tokio::test]
async fn make_call_composes_uri_from_realm_and_notifies() {
    let mut fx = fixture();
    fx.add_alice().await;

    fx.handle.make_call(ALICE, "200", VideoSetting::audio_only()).unwrap();
    let notifications = fx.drain().await;

    assert_eq!(fx.engine.count(&format!("make_call {ALICE} sip:200@example.com")), 1);
    let outgoing = of_kind(&notifications, NotificationKind::OutgoingCall);
    assert_eq!(outgoing.len(), 1);
    assert!(matches!(
        outgoing[0],
        Notification::OutgoingCall { number, is_transfer: false, .. } if number == "200"
    ));
    assert_eq!(fx.handle.call_ids(ALICE).unwrap().len(), 1);
}

#[tokio::test]
async fn make_call_for_unknown_account_reports_a_disconnected_call() {
    let mut fx = fixture();
    fx.add_alice().await;

    fx.handle.make_call("sip:ghost@example.com", "200", VideoSetting::audio_only()).unwrap();
    let notifications = fx.drain().await;

    assert!(notifications.iter().any(|n| matches!(
        n,
        Notification::CallState { call_id: -1, phase: CallPhase::Disconnected, .. }
    )));
}

#[tokio::test]
async fn silent_call_reports_status_instead_of_outgoing_call() {
    let mut fx = fixture();
    fx.add_alice().await;

    fx.handle
        .submit(crate::client::command::Command::MakeSilentCall {
            account_id: ALICE.to_string(),
            number: "6001".to_string(),
        })
        .unwrap();
    let notifications = fx.drain().await;

    assert!(notifications.contains(&Notification::SilentCallStatus {
        success: true,
        number: "6001".to_string(),
    }));
    assert!(of_kind(&notifications, NotificationKind::OutgoingCall).is_empty());
}

#[tokio::test]
async fn failed_silent_call_reports_failure_status() {
    let mut fx = fixture();
    fx.add_alice().await;
    fx.engine.fail("make_call");

    fx.handle
        .submit(crate::client::command::Command::MakeSilentCall {
            account_id: ALICE.to_string(),
            number: "6001".to_string(),
        })
        .unwrap();
    let notifications = fx.drain().await;

    assert!(notifications.contains(&Notification::SilentCallStatus {
        success: false,
        number: "6001".to_string(),
    }));
    assert!(of_kind(&notifications, NotificationKind::OutgoingCall).is_empty());
}

// ===== INCOMING CALL ADMISSION =====

#[tokio::test]
async fn incoming_call_rings_and_publishes_caller_info() {
    let mut fx = fixture();
    fx.add_alice().await;

    fx.handle.on_incoming_call(ALICE, 7, "\"Bob\" <sip:bob@x.com>", false);
    let notifications = fx.drain().await;

    assert_eq!(fx.engine.count(&format!("answer {ALICE} 7 {}", status::RINGING)), 1);
    let incoming = of_kind(&notifications, NotificationKind::IncomingCall);
    assert_eq!(incoming.len(), 1);
    assert!(matches!(
        incoming[0],
        Notification::IncomingCall { call_id: 7, display_name, remote_uri, .. }
            if display_name == "Bob" && remote_uri == "bob@x.com"
    ));
}

#[tokio::test]
async fn second_incoming_call_is_declined_busy_without_ringing() {
    let mut fx = fixture();
    fx.add_alice().await;

    fx.handle.on_incoming_call(ALICE, 7, "<sip:bob@x.com>", false);
    fx.drain().await;

    fx.handle.on_incoming_call(ALICE, 8, "<sip:carol@x.com>", false);
    let notifications = fx.drain().await;

    assert_eq!(fx.engine.count(&format!("answer {ALICE} 8 {}", status::BUSY_HERE)), 1);
    assert_eq!(fx.engine.count(&format!("answer {ALICE} 8 {}", status::RINGING)), 0);
    assert!(of_kind(&notifications, NotificationKind::IncomingCall).is_empty());
    assert!(notifications.contains(&Notification::MissedCall {
        display_name: "carol@x.com".to_string(),
        remote_uri: "carol@x.com".to_string(),
    }));

    // The declined call transitions straight to disconnected.
    fx.handle.on_call_state(ALICE, 8, CallPhase::Disconnected, status::BUSY_HERE);
    let notifications = fx.drain().await;
    assert!(notifications.iter().any(|n| matches!(
        n,
        Notification::CallState { call_id: 8, phase: CallPhase::Disconnected, .. }
    )));
    assert_eq!(fx.handle.call_ids(ALICE).unwrap(), vec![7]);
}

#[tokio::test]
async fn dnd_declines_incoming_calls_with_a_missed_call() {
    let mut fx = fixture();
    fx.add_alice().await;
    fx.store.set_dnd(true).unwrap();

    fx.handle.on_incoming_call(ALICE, 7, "\"Bob\" <sip:bob@x.com>", false);
    let notifications = fx.drain().await;

    assert_eq!(fx.engine.count(&format!("answer {ALICE} 7 {}", status::DECLINE)), 1);
    assert!(of_kind(&notifications, NotificationKind::IncomingCall).is_empty());
    assert!(notifications.contains(&Notification::MissedCall {
        display_name: "Bob".to_string(),
        remote_uri: "bob@x.com".to_string(),
    }));
}

// ===== CALL STATE / DISCONNECTION =====

#[tokio::test]
async fn confirmation_records_the_connect_timestamp() {
    let mut fx = fixture();
    fx.add_alice().await;
    fx.handle.make_call(ALICE, "200", VideoSetting::audio_only()).unwrap();
    fx.drain().await;
    let call_id = fx.handle.call_ids(ALICE).unwrap()[0];

    fx.handle.on_call_state(ALICE, call_id, CallPhase::Confirmed, status::OK);
    let notifications = fx.drain().await;

    let states = of_kind(&notifications, NotificationKind::CallState);
    assert_eq!(states.len(), 1);
    assert!(matches!(
        states[0],
        Notification::CallState { phase: CallPhase::Confirmed, connect_timestamp, .. }
            if *connect_timestamp > 0
    ));
}

#[tokio::test]
async fn disconnection_is_terminal_and_idempotent() {
    let mut fx = fixture();
    let call_id = fx.confirmed_call().await;

    fx.handle.on_call_state(ALICE, call_id, CallPhase::Disconnected, status::DECLINE);
    fx.handle.on_call_state(ALICE, call_id, CallPhase::Disconnected, status::DECLINE);
    let notifications = fx.drain().await;

    // One terminal notification, one detach; the duplicate event is a no-op.
    let disconnects: Vec<_> = notifications
        .iter()
        .filter(|n| matches!(n, Notification::CallState { phase: CallPhase::Disconnected, .. }))
        .collect();
    assert_eq!(disconnects.len(), 1);
    assert!(fx.handle.call_ids(ALICE).unwrap().is_empty());

    // Operations on the detached id are rejected with a synthesized
    // disconnected notification, not a crash.
    fx.handle.set_hold(ALICE, call_id, true).unwrap();
    let notifications = fx.drain().await;
    assert!(notifications.iter().any(|n| matches!(
        n,
        Notification::CallState { phase: CallPhase::Disconnected, connect_timestamp: 0, .. }
    )));
    assert_eq!(fx.engine.count(&format!("hold {ALICE}")), 0);
}

#[tokio::test]
async fn hangup_of_a_missing_call_synthesizes_a_disconnected_state() {
    let mut fx = fixture();
    fx.add_alice().await;

    fx.handle.hang_up_call(ALICE, 99).unwrap();
    let notifications = fx.drain().await;

    assert_eq!(fx.engine.count("hangup"), 0);
    assert!(notifications.iter().any(|n| matches!(
        n,
        Notification::CallState { call_id: 99, phase: CallPhase::Disconnected, .. }
    )));
}

// ===== HOLD / MUTE =====

#[tokio::test]
async fn set_hold_is_idempotent() {
    let mut fx = fixture();
    let call_id = fx.confirmed_call().await;

    fx.handle.set_hold(ALICE, call_id, true).unwrap();
    let notifications = fx.drain().await;
    assert_eq!(fx.engine.count(&format!("hold {ALICE} {call_id}")), 1);
    let states = of_kind(&notifications, NotificationKind::CallState);
    assert_eq!(states.len(), 1);
    assert!(matches!(states[0], Notification::CallState { local_hold: true, .. }));

    // Same request again: no engine call, no state change.
    fx.handle.set_hold(ALICE, call_id, true).unwrap();
    let notifications = fx.drain().await;
    assert_eq!(fx.engine.count(&format!("hold {ALICE} {call_id}")), 1);
    assert!(of_kind(&notifications, NotificationKind::CallState).is_empty());
}

#[tokio::test]
async fn unhold_reinvites_and_toggle_round_trips() {
    let mut fx = fixture();
    let call_id = fx.confirmed_call().await;

    fx.handle.set_hold(ALICE, call_id, true).unwrap();
    fx.handle.set_hold(ALICE, call_id, false).unwrap();
    fx.drain().await;
    assert_eq!(fx.engine.count(&format!("reinvite_unhold {ALICE} {call_id}")), 1);

    fx.handle
        .submit(crate::client::command::Command::ToggleHold {
            account_id: ALICE.to_string(),
            call_id,
        })
        .unwrap();
    fx.drain().await;
    assert_eq!(fx.engine.count(&format!("hold {ALICE} {call_id}")), 2);
}

#[tokio::test]
async fn hold_failure_leaves_the_flag_unchanged() {
    let mut fx = fixture();
    let call_id = fx.confirmed_call().await;
    fx.engine.fail("hold");

    fx.handle.set_hold(ALICE, call_id, true).unwrap();
    let notifications = fx.drain().await;

    assert!(of_kind(&notifications, NotificationKind::CallState).is_empty());

    // Still un-held, so a retry issues a second engine call.
    fx.engine.fail_ops.lock().unwrap().clear();
    fx.handle.set_hold(ALICE, call_id, true).unwrap();
    fx.drain().await;
    assert_eq!(fx.engine.count(&format!("hold {ALICE} {call_id}")), 2);
}

#[tokio::test]
async fn mute_switches_every_audio_leg_and_is_idempotent() {
    let mut fx = fixture();
    let call_id = fx.confirmed_call().await;
    *fx.engine.audio_legs.lock().unwrap() = vec![0, 1];

    fx.handle.set_mute(ALICE, call_id, true).unwrap();
    let notifications = fx.drain().await;
    assert_eq!(fx.engine.count(&format!("disconnect_capture {ALICE} {call_id}")), 2);
    let states = of_kind(&notifications, NotificationKind::CallState);
    assert!(matches!(states[0], Notification::CallState { local_mute: true, .. }));

    fx.handle.set_mute(ALICE, call_id, true).unwrap();
    fx.drain().await;
    assert_eq!(fx.engine.count(&format!("disconnect_capture {ALICE} {call_id}")), 2);

    fx.handle.set_mute(ALICE, call_id, false).unwrap();
    fx.drain().await;
    assert_eq!(fx.engine.count(&format!("connect_capture {ALICE} {call_id}")), 2);
}

#[tokio::test]
async fn media_reactivation_reapplies_mute() {
    let mut fx = fixture();
    let call_id = fx.confirmed_call().await;
    fx.handle.set_mute(ALICE, call_id, true).unwrap();
    fx.drain().await;

    fx.handle.on_media_state(ALICE, call_id, vec![3]);
    fx.drain().await;
    assert_eq!(fx.engine.count(&format!("disconnect_capture {ALICE} {call_id} 3")), 1);
}

// ===== DTMF / TRANSFER =====

#[tokio::test]
async fn dtmf_goes_out_one_tone_at_a_time() {
    let mut fx = fixture();
    let call_id = fx.confirmed_call().await;

    fx.handle
        .submit(crate::client::command::Command::SendDtmf {
            account_id: ALICE.to_string(),
            call_id,
            digits: "12#".to_string(),
        })
        .unwrap();
    fx.drain().await;

    assert_eq!(fx.engine.count(&format!("send_dtmf {ALICE} {call_id} 1")), 1);
    assert_eq!(fx.engine.count(&format!("send_dtmf {ALICE} {call_id} 2")), 1);
    assert_eq!(fx.engine.count(&format!("send_dtmf {ALICE} {call_id} #")), 1);
}

#[tokio::test]
async fn transfer_completes_destination_with_the_account_realm() {
    let mut fx = fixture();
    let call_id = fx.confirmed_call().await;

    fx.handle.transfer_call(ALICE, call_id, "200").unwrap();
    fx.drain().await;
    assert_eq!(
        fx.engine.count(&format!("transfer {ALICE} {call_id} <sip:200@example.com>")),
        1
    );

    fx.handle.transfer_call(ALICE, call_id, "sip:200@mycompany.com").unwrap();
    fx.drain().await;
    assert_eq!(
        fx.engine.count(&format!("transfer {ALICE} {call_id} <sip:200@mycompany.com>")),
        1
    );
}

#[tokio::test]
async fn transfer_failure_surfaces_as_a_disconnection() {
    let mut fx = fixture();
    let call_id = fx.confirmed_call().await;
    fx.engine.fail("transfer");

    fx.handle.transfer_call(ALICE, call_id, "200").unwrap();
    let notifications = fx.drain().await;

    assert!(notifications.iter().any(|n| matches!(
        n,
        Notification::CallState { call_id: id, phase: CallPhase::Disconnected, .. } if *id == call_id
    )));
}

#[tokio::test]
async fn a_second_outgoing_call_is_only_allowed_for_attended_transfer() {
    let mut fx = fixture();
    let call_id = fx.confirmed_call().await;

    // A plain second call is rejected and reported as disconnected.
    fx.handle.make_call(ALICE, "300", VideoSetting::audio_only()).unwrap();
    let notifications = fx.drain().await;
    assert!(notifications.iter().any(|n| matches!(
        n,
        Notification::CallState { call_id: -1, phase: CallPhase::Disconnected, .. }
    )));
    assert_eq!(fx.handle.call_ids(ALICE).unwrap().len(), 1);

    // A consultation call flagged as transfer goes through.
    fx.handle
        .submit(crate::client::command::Command::MakeCall {
            account_id: ALICE.to_string(),
            number: "300".to_string(),
            video: VideoSetting::audio_only(),
            is_transfer: true,
        })
        .unwrap();
    let notifications = fx.drain().await;
    assert!(notifications.iter().any(|n| matches!(
        n,
        Notification::OutgoingCall { is_transfer: true, .. }
    )));
    let call_ids = fx.handle.call_ids(ALICE).unwrap();
    assert_eq!(call_ids.len(), 2);

    // The attended transfer now has a live destination.
    let destination_call_id = call_ids.into_iter().find(|id| *id != call_id).unwrap();
    fx.handle
        .submit(crate::client::command::Command::AttendedTransferCall {
            account_id: ALICE.to_string(),
            call_id,
            destination_call_id,
        })
        .unwrap();
    fx.drain().await;
    assert_eq!(fx.engine.count("attended_transfer"), 1);
}

#[tokio::test]
async fn attended_transfer_with_missing_destination_is_reported_not_a_crash() {
    let mut fx = fixture();
    let call_id = fx.confirmed_call().await;

    fx.handle
        .submit(crate::client::command::Command::AttendedTransferCall {
            account_id: ALICE.to_string(),
            call_id,
            destination_call_id: 42,
        })
        .unwrap();
    let notifications = fx.drain().await;

    assert_eq!(fx.engine.count("attended_transfer"), 0);
    assert!(notifications.iter().any(|n| matches!(
        n,
        Notification::CallState { call_id: id, phase: CallPhase::Disconnected, .. } if *id == call_id
    )));
}

// ===== CODEC PRIORITIES =====

#[tokio::test]
async fn get_codec_priorities_dedupes_and_sorts_descending() {
    let mut fx = fixture();
    fx.engine.set_codecs(vec![
        CodecPriority::new("PCMU/8000/1", 100),
        CodecPriority::new("opus/48000/2", 254),
        CodecPriority::new("PCMU/8000/1", 90),
        CodecPriority::new("G729/8000/1", 0),
    ]);

    fx.handle.submit(crate::client::command::Command::GetCodecPriorities).unwrap();
    let notifications = fx.drain().await;

    // The query lazily starts the stack.
    assert_eq!(fx.engine.count("start"), 1);

    let tables = of_kind(&notifications, NotificationKind::CodecPriorities);
    assert_eq!(tables.len(), 1);
    let Notification::CodecPriorities { priorities } = tables[0] else { unreachable!() };
    let ids: Vec<&str> = priorities.iter().map(|c| c.codec_id()).collect();
    assert_eq!(ids, ["opus/48000/2", "PCMU/8000/1", "G729/8000/1"]);
}

#[tokio::test]
async fn default_codec_table_is_applied_on_startup() {
    let mut fx = fixture();
    fx.add_alice().await;

    for entry in codec::default_table() {
        assert_eq!(
            fx.engine.count(&format!("set_codec_priority {} {}", entry.codec_id(), entry.priority())),
            1
        );
    }
}

#[tokio::test]
async fn set_codec_priorities_persists_on_full_success() {
    let mut fx = fixture();
    let table = vec![
        CodecPriority::new("opus/48000/2", 254),
        CodecPriority::new("PCMA/8000/1", 100),
    ];

    fx.handle
        .submit(crate::client::command::Command::SetCodecPriorities { priorities: table.clone() })
        .unwrap();
    let notifications = fx.drain().await;

    assert!(notifications.contains(&Notification::CodecPrioritiesSetStatus { success: true }));
    assert_eq!(fx.store.codec_priorities().unwrap(), Some(table));
}

#[tokio::test]
async fn partial_codec_failure_reports_failure_and_keeps_applied_entries() {
    let mut fx = fixture();
    fx.engine.fail("set_codec_priority:EVS/32000/1");
    let table = vec![
        CodecPriority::new("AMR/8000/1", 240),
        CodecPriority::new("EVS/32000/1", 200),
        CodecPriority::new("PCMA/8000/1", 100),
    ];

    fx.handle
        .submit(crate::client::command::Command::SetCodecPriorities { priorities: table })
        .unwrap();
    let notifications = fx.drain().await;

    assert!(notifications.contains(&Notification::CodecPrioritiesSetStatus { success: false }));
    // Entry before the failure was applied and stays applied; the one after
    // the failure was never attempted; nothing was persisted.
    assert_eq!(fx.engine.count("set_codec_priority AMR/8000/1 240"), 1);
    assert_eq!(fx.engine.count("set_codec_priority PCMA/8000/1 100"), 0);
    assert_eq!(fx.store.codec_priorities().unwrap(), None);
}

// ===== REGISTRATION =====

#[tokio::test]
async fn registration_state_events_are_relayed() {
    let mut fx = fixture();
    fx.add_alice().await;

    fx.handle.on_registration_state(ALICE, status::OK);
    let notifications = fx.drain().await;

    assert!(notifications.contains(&Notification::RegistrationState {
        account_id: ALICE.to_string(),
        code: status::OK,
    }));
}

#[tokio::test]
async fn registration_status_of_an_unknown_account_reports_bad_request() {
    let mut fx = fixture();
    fx.add_alice().await;

    fx.handle
        .submit(crate::client::command::Command::GetRegistrationStatus {
            account_id: "sip:ghost@example.com".to_string(),
        })
        .unwrap();
    let notifications = fx.drain().await;

    assert!(notifications.contains(&Notification::RegistrationState {
        account_id: "sip:ghost@example.com".to_string(),
        code: status::BAD_REQUEST,
    }));
}

#[tokio::test]
async fn refresh_registration_updates_and_persists_parameters() {
    let mut fx = fixture();
    fx.add_alice().await;

    fx.handle
        .submit(crate::client::command::Command::RefreshRegistration {
            account_id: ALICE.to_string(),
            expiration_secs: 600,
            contact_uri_params: Some(";ob".to_string()),
        })
        .unwrap();
    fx.drain().await;

    assert_eq!(fx.engine.count(&format!("refresh_registration {ALICE} 600")), 1);
    let persisted = fx.store.accounts().unwrap();
    assert_eq!(persisted[0].reg_expiration_secs, 600);
    assert_eq!(persisted[0].contact_uri_params, ";ob");
}

// ===== RECONNECTION =====

#[tokio::test]
async fn reconnect_publishes_progress_then_success() {
    let mut fx = fixture();
    fx.add_alice().await;

    fx.handle.submit(crate::client::command::Command::ReconnectCall).unwrap();
    let notifications = fx.drain().await;
    assert!(notifications.contains(&Notification::ReconnectionState {
        state: ReconnectionState::Progress,
    }));
    assert_eq!(fx.engine.count("handle_ip_change"), 1);

    fx.handle.on_ip_change_progress(true, true);
    let notifications = fx.drain().await;
    assert!(notifications.contains(&Notification::ReconnectionState {
        state: ReconnectionState::Success,
    }));
}

#[tokio::test]
async fn reconnect_failure_hangs_up_all_calls() {
    let mut fx = fixture();
    let call_id = fx.confirmed_call().await;

    fx.handle.submit(crate::client::command::Command::ReconnectCall).unwrap();
    fx.drain().await;

    fx.handle.on_ip_change_progress(false, false);
    let notifications = fx.drain().await;

    assert_eq!(fx.engine.count(&format!("hangup {ALICE} {call_id}")), 1);
    assert!(notifications.contains(&Notification::ReconnectionState {
        state: ReconnectionState::Failed,
    }));
}

// ===== GUEST / DIRECT CALLS =====

#[tokio::test]
async fn direct_call_creates_a_guest_session_and_tears_it_down() {
    let mut fx = fixture();

    fx.handle
        .submit(crate::client::command::Command::MakeDirectCall {
            uri: "sip:900@conf.example.com".to_string(),
            sip_server: "conf.example.com".to_string(),
            transport: AccountTransport::Tcp,
            guest_display_name: "Visitor".to_string(),
            video: VideoSetting::audio_only(),
        })
        .unwrap();
    let notifications = fx.drain().await;

    assert_eq!(fx.engine.count("add_guest_account sip:guest"), 1);
    assert!(notifications.iter().any(|n| matches!(
        n,
        Notification::OutgoingCall { account_id, .. } if account_id == "sip:guest"
    )));
    let call_id = fx.handle.call_ids("sip:guest").unwrap()[0];

    fx.handle.on_call_state("sip:guest", call_id, CallPhase::Disconnected, status::OK);
    let notifications = fx.drain().await;

    assert_eq!(fx.engine.count("remove_account sip:guest"), 1);
    assert!(fx.handle.account_ids().is_empty());
    // Nothing else keeps the engine alive.
    assert!(notifications.contains(&Notification::StackStatus { started: false }));
}

// ===== TLS VERIFICATION =====

#[tokio::test]
async fn tls_identity_mismatch_is_rescued_by_a_wildcard_name() {
    let mut fx = fixture();
    fx.store.set_verify_server_cert(true).unwrap();
    fx.handle.set_account(alice().with_host("cert.test.com")).unwrap();
    fx.drain().await;

    fx.handle.on_transport_state(Some(TlsVerifyState {
        status: TlsVerifyStatus::IdentityMismatch,
        cert_names: vec!["c*.test.com".to_string()],
    }));
    let notifications = fx.drain().await;

    assert!(of_kind(&notifications, NotificationKind::TlsVerifyFailed).is_empty());
    assert_eq!(fx.engine.count("stop"), 0);
}

#[tokio::test]
async fn tls_mismatch_without_wildcard_match_stops_the_stack() {
    let mut fx = fixture();
    fx.store.set_verify_server_cert(true).unwrap();
    fx.handle.set_account(alice().with_host("cert.test.com")).unwrap();
    fx.drain().await;

    fx.handle.on_transport_state(Some(TlsVerifyState {
        status: TlsVerifyStatus::IdentityMismatch,
        cert_names: vec!["first.c*.test.com".to_string()],
    }));
    let notifications = fx.drain().await;

    assert!(notifications.contains(&Notification::TlsVerifyFailed));
    assert_eq!(fx.engine.count("stop"), 1);
}

// ===== EVENT BUS INTEGRATION =====

#[tokio::test]
async fn late_subscribers_only_see_new_notifications() {
    let mut fx = fixture();
    fx.add_alice().await;

    let mut late = fx.events.subscribe();
    fx.handle.on_registration_state(ALICE, status::OK);
    fx.drain().await;

    assert!(matches!(
        late.try_recv(),
        Some(Notification::RegistrationState { code, .. }) if code == status::OK
    ));
    assert!(late.try_recv().is_none());
}
