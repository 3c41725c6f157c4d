//! Event bus for state-change notifications.
//!
//! Every externally observable state change of the orchestration layer is
//! republished as a typed [`Notification`] on the [`EventBus`]. Publication
//! is one-to-many and fire-and-forget: the publisher never waits on
//! subscriber processing, subscribers may join and leave at any time, and
//! within one notification kind the delivery order to a subscriber equals
//! the publication order in the command processor.
//!
//! # Usage
//!
//! ```rust
//! use voxline_client_core::events::{EventBus, Notification};
//!
//! # async fn example() {
//! let bus = EventBus::new();
//! let mut subscription = bus.subscribe();
//!
//! bus.publish(Notification::StackStatus { started: true });
//!
//! if let Some(notification) = subscription.recv().await {
//!     println!("got {:?}", notification.kind());
//! }
//!
//! bus.unsubscribe(subscription.id());
//! # }
//! ```

use std::collections::HashMap;
use std::sync::RwLock;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::codec::CodecPriority;
use crate::engine::{CallId, CallPhase};

/// State of the IP-change / reconnection machinery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectionState {
    /// No reconnection in progress
    Idle,
    /// Transport restart and re-registration running
    Progress,
    /// Reconnection completed
    Success,
    /// Reconnection failed; calls were hung up
    Failed,
}

/// Notification kinds, used for filtering and assertions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationKind {
    /// [`Notification::RegistrationState`]
    RegistrationState,
    /// [`Notification::IncomingCall`]
    IncomingCall,
    /// [`Notification::CallState`]
    CallState,
    /// [`Notification::OutgoingCall`]
    OutgoingCall,
    /// [`Notification::StackStatus`]
    StackStatus,
    /// [`Notification::CodecPriorities`]
    CodecPriorities,
    /// [`Notification::CodecPrioritiesSetStatus`]
    CodecPrioritiesSetStatus,
    /// [`Notification::MissedCall`]
    MissedCall,
    /// [`Notification::ReconnectionState`]
    ReconnectionState,
    /// [`Notification::SilentCallStatus`]
    SilentCallStatus,
    /// [`Notification::TlsVerifyFailed`]
    TlsVerifyFailed,
}

/// A state-change notification published by the orchestration layer.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// SIP registration status changed for an account
    RegistrationState {
        /// Identity URI of the account
        account_id: String,
        /// SIP registration status code
        code: u32,
    },
    /// An inbound call was admitted and is ringing
    IncomingCall {
        /// Identity URI of the account
        account_id: String,
        /// Engine-assigned call id
        call_id: CallId,
        /// Display name of the remote party
        display_name: String,
        /// Canonical URI of the remote party
        remote_uri: String,
        /// Whether the caller offered video
        is_video: bool,
    },
    /// A call changed state
    CallState {
        /// Identity URI of the account
        account_id: String,
        /// Engine-assigned call id
        call_id: CallId,
        /// Protocol state after the change
        phase: CallPhase,
        /// SIP status code attached to the state change
        status_code: u32,
        /// Connect timestamp in epoch milliseconds, 0 if never connected
        connect_timestamp: i64,
        /// Local hold flag
        local_hold: bool,
        /// Local microphone mute flag
        local_mute: bool,
        /// Local video mute flag
        local_video_mute: bool,
    },
    /// An outgoing call was placed
    OutgoingCall {
        /// Identity URI of the account
        account_id: String,
        /// Engine-assigned call id
        call_id: CallId,
        /// The dialed number or URI as given by the caller
        number: String,
        /// Whether the call carries video
        is_video: bool,
        /// Whether the call joins a video conference bridge
        is_video_conference: bool,
        /// Whether the call was placed as part of a transfer
        is_transfer: bool,
    },
    /// The protocol engine was started or stopped
    StackStatus {
        /// True after start, false after stop
        started: bool,
    },
    /// Result of a codec priority query
    CodecPriorities {
        /// Deduplicated table, highest priority first
        priorities: Vec<CodecPriority>,
    },
    /// Result of applying a codec priority table
    CodecPrioritiesSetStatus {
        /// True if every entry was applied and persisted
        success: bool,
    },
    /// An inbound call was declined without ringing (busy or do-not-disturb)
    MissedCall {
        /// Display name of the remote party
        display_name: String,
        /// Canonical URI of the remote party
        remote_uri: String,
    },
    /// The reconnection state machine advanced
    ReconnectionState {
        /// New state
        state: ReconnectionState,
    },
    /// Result of a silent call attempt
    SilentCallStatus {
        /// Whether the call was placed
        success: bool,
        /// The dialed number
        number: String,
    },
    /// TLS server certificate verification failed
    TlsVerifyFailed,
}

impl Notification {
    /// The kind of this notification.
    pub fn kind(&self) -> NotificationKind {
        match self {
            Notification::RegistrationState { .. } => NotificationKind::RegistrationState,
            Notification::IncomingCall { .. } => NotificationKind::IncomingCall,
            Notification::CallState { .. } => NotificationKind::CallState,
            Notification::OutgoingCall { .. } => NotificationKind::OutgoingCall,
            Notification::StackStatus { .. } => NotificationKind::StackStatus,
            Notification::CodecPriorities { .. } => NotificationKind::CodecPriorities,
            Notification::CodecPrioritiesSetStatus { .. } => {
                NotificationKind::CodecPrioritiesSetStatus
            }
            Notification::MissedCall { .. } => NotificationKind::MissedCall,
            Notification::ReconnectionState { .. } => NotificationKind::ReconnectionState,
            Notification::SilentCallStatus { .. } => NotificationKind::SilentCallStatus,
            Notification::TlsVerifyFailed => NotificationKind::TlsVerifyFailed,
        }
    }
}

/// A live subscription to the event bus.
///
/// Dropping the subscription (or calling [`EventBus::unsubscribe`]) stops
/// delivery; notifications buffered before that point are discarded.
pub struct Subscription {
    id: Uuid,
    receiver: mpsc::UnboundedReceiver<Notification>,
}

impl Subscription {
    /// Unique identifier of this subscription, used to unsubscribe.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Waits for the next notification. Returns `None` once unsubscribed.
    pub async fn recv(&mut self) -> Option<Notification> {
        self.receiver.recv().await
    }

    /// Returns the next already-delivered notification, if any.
    pub fn try_recv(&mut self) -> Option<Notification> {
        self.receiver.try_recv().ok()
    }
}

/// One-to-many, fire-and-forget notification channel.
///
/// Each subscriber owns an unbounded queue; publishing pushes into every
/// live queue without waiting, so a slow subscriber can never stall the
/// command processor.
pub struct EventBus {
    subscribers: RwLock<HashMap<Uuid, mpsc::UnboundedSender<Notification>>>,
}

impl EventBus {
    /// Creates an event bus with no subscribers.
    pub fn new() -> Self {
        Self { subscribers: RwLock::new(HashMap::new()) }
    }

    /// Registers a new subscriber and returns its subscription.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        self.subscribers.write().unwrap().insert(id, tx);
        Subscription { id, receiver: rx }
    }

    /// Removes a subscriber. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: Uuid) -> bool {
        self.subscribers.write().unwrap().remove(&id).is_some()
    }

    /// Publishes a notification to every live subscriber.
    ///
    /// Never blocks; subscribers whose receiving side has been dropped are
    /// pruned here.
    pub fn publish(&self, notification: Notification) {
        let mut subscribers = self.subscribers.write().unwrap();
        subscribers.retain(|_, tx| tx.send(notification.clone()).is_ok());
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().unwrap().len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
