//! # voxline-client-core
//!
//! SIP account and call orchestration above a lower-level protocol engine.
//!
//! The engine — wire-level signaling, codec negotiation, media transport —
//! is an external collaborator consumed through the [`engine::SipEngine`]
//! capability trait. This crate owns everything above it: the lifecycle of
//! accounts and their calls, deterministic ordering of user commands and
//! engine callbacks, persisted (optionally encrypted) credentials, codec
//! priority configuration, and decoupled notifications for observers.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────┐
//! │        Embedding host         │
//! └────────┬──────────────▲───────┘
//!          │ commands     │ notifications
//! ┌────────▼──────────────┴───────┐
//! │  ProcessorHandle │ EventBus   │
//! │ ┌───────────────────────────┐ │
//! │ │  CommandProcessor (serial)│ │ ◄── this crate
//! │ │  SessionRegistry          │ │
//! │ │  AccountSession/CallSession│ │
//! │ └───────────┬──────────▲────┘ │
//! └─────────────│──────────│──────┘
//!               │ calls    │ callbacks (EngineObserver)
//! ┌─────────────▼──────────┴──────┐
//! │     SIP / media engine        │
//! └───────────────────────────────┘
//! ```
//!
//! A single worker task executes all commands and engine callbacks serially;
//! this total ordering replaces per-object locking. Observers subscribe to
//! the [`events::EventBus`] and only ever see notifications — no command has
//! a synchronous return value.
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use voxline_client_core::{
//!     AccountConfig, CommandProcessor, ConfigStore, EventBus, MemoryStore, SessionContext,
//! };
//! # use voxline_client_core::engine::SipEngine;
//!
//! # async fn example(engine: Arc<dyn SipEngine>) -> Result<(), Box<dyn std::error::Error>> {
//! let events = Arc::new(EventBus::new());
//! let store = Arc::new(ConfigStore::new(Arc::new(MemoryStore::new())));
//! let handle = CommandProcessor::spawn(SessionContext::new(engine, store, events.clone()));
//!
//! let mut notifications = events.subscribe();
//!
//! let account_id = handle.set_account(
//!     AccountConfig::new()
//!         .with_username("alice")
//!         .with_password("secret")
//!         .with_realm("example.com")
//!         .with_host("pbx.example.com"),
//! )?;
//! handle.make_call(&account_id, "200", Default::default())?;
//!
//! while let Some(notification) = notifications.recv().await {
//!     println!("{:?}", notification.kind());
//! }
//! # Ok(())
//! # }
//! ```

pub mod caller;
pub mod client;
pub mod codec;
pub mod engine;
pub mod error;
pub mod events;
pub mod obfuscate;
pub mod ring;
pub mod store;
pub mod tls;

pub use caller::CallerInfo;
pub use client::{
    AccountConfig, AccountSession, AccountTransport, AuthScheme, CallDirection, CallSession,
    Command, CommandProcessor, ProcessorHandle, SessionContext, SessionRegistry, SrtpPolicy,
};
pub use codec::CodecPriority;
pub use engine::{
    CallId, CallPhase, CaptureDevice, EngineError, EngineObserver, EngineResult, SipEngine,
    TlsVerifyState, TlsVerifyStatus, VideoSetting,
};
pub use error::{ClientError, ClientResult};
pub use events::{EventBus, Notification, NotificationKind, ReconnectionState, Subscription};
pub use ring::RingIndicator;
pub use store::{ConfigStore, Crypto, KeyValueStore, MemoryStore};
