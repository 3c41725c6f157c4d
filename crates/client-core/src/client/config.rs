//! Account configuration.
//!
//! [`AccountConfig`] is the value object describing one account: identity,
//! transport, credentials, registration parameters and media policy. It is
//! created by the caller, persisted (optionally encrypted) on every
//! successful add or update, and compared field-for-field when the same
//! add-account command is replayed to decide between re-creating the session
//! and merely refreshing its registration.

use serde::{Deserialize, Serialize};

/// Default SIP signaling port.
pub const DEFAULT_SIP_PORT: u16 = 5060;
/// Default registration expiration in seconds.
pub const DEFAULT_REG_EXPIRATION_SECS: u32 = 300;

/// Transport used for SIP signaling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountTransport {
    /// UDP transport
    #[default]
    Udp,
    /// TCP transport
    Tcp,
    /// TLS transport
    Tls,
}

impl AccountTransport {
    /// Maps a numeric transport code (0 = UDP, 1 = TCP, 2 = TLS).
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => AccountTransport::Tcp,
            2 => AccountTransport::Tls,
            _ => AccountTransport::Udp,
        }
    }

    /// URI parameter suffix for the proxy URI, if the transport needs one.
    pub fn uri_param(&self) -> Option<&'static str> {
        match self {
            AccountTransport::Udp => None,
            AccountTransport::Tcp => Some(";transport=tcp"),
            AccountTransport::Tls => Some(";transport=tls"),
        }
    }
}

/// Authentication scheme for registration credentials.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthScheme {
    /// Digest authentication
    #[default]
    Digest,
    /// Plain credentials
    Plain,
}

impl AuthScheme {
    /// Scheme name as the engine expects it.
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthScheme::Digest => "digest",
            AuthScheme::Plain => "plain",
        }
    }
}

/// SRTP media policy for an account's calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SrtpPolicy {
    /// Never use SRTP
    #[default]
    Disabled,
    /// Offer SRTP, accept plain RTP
    Optional,
    /// Require SRTP
    Mandatory,
}

/// Configuration data of one SIP account.
///
/// ```rust
/// use voxline_client_core::client::config::AccountConfig;
///
/// let config = AccountConfig::new()
///     .with_username("alice")
///     .with_password("secret")
///     .with_realm("example.com")
///     .with_host("pbx.example.com");
///
/// assert!(config.is_valid());
/// assert_eq!(config.id_uri(), "sip:alice@example.com");
/// assert_eq!(config.registrar_uri(), "sip:pbx.example.com:5060");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountConfig {
    /// Account username (the user part of the identity URI)
    pub username: String,
    /// Authentication password
    pub password: String,
    /// Registration realm; `"*"` produces a realm-less identity URI
    pub realm: String,
    /// Registrar/proxy host
    pub host: String,
    /// Registrar/proxy port
    pub port: u16,
    /// Signaling transport
    pub transport: AccountTransport,
    /// Authentication scheme
    pub auth_scheme: AuthScheme,
    /// Extra parameters appended to the registration contact URI
    pub contact_uri_params: String,
    /// Registration expiration timeout in seconds
    pub reg_expiration_secs: u32,
    /// Fixed registration call-id, empty to let the engine choose
    pub reg_call_id: String,
    /// SRTP policy for this account's media
    pub srtp: SrtpPolicy,
    /// Display name used when this config backs a guest session
    pub guest_display_name: String,
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            username: String::new(),
            password: String::new(),
            realm: String::new(),
            host: String::new(),
            port: DEFAULT_SIP_PORT,
            transport: AccountTransport::default(),
            auth_scheme: AuthScheme::default(),
            contact_uri_params: String::new(),
            reg_expiration_secs: DEFAULT_REG_EXPIRATION_SECS,
            reg_call_id: String::new(),
            srtp: SrtpPolicy::default(),
            guest_display_name: String::new(),
        }
    }
}

impl AccountConfig {
    /// Creates an empty configuration with default port and timeouts.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the username.
    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = username.into();
        self
    }

    /// Sets the password.
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }

    /// Sets the realm.
    pub fn with_realm(mut self, realm: impl Into<String>) -> Self {
        self.realm = realm.into();
        self
    }

    /// Sets the registrar host.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Sets the registrar port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets the signaling transport.
    pub fn with_transport(mut self, transport: AccountTransport) -> Self {
        self.transport = transport;
        self
    }

    /// Sets the authentication scheme.
    pub fn with_auth_scheme(mut self, scheme: AuthScheme) -> Self {
        self.auth_scheme = scheme;
        self
    }

    /// Sets the contact URI parameters.
    pub fn with_contact_uri_params(mut self, params: impl Into<String>) -> Self {
        self.contact_uri_params = params.into();
        self
    }

    /// Sets the registration expiration timeout.
    pub fn with_reg_expiration_secs(mut self, secs: u32) -> Self {
        self.reg_expiration_secs = secs;
        self
    }

    /// Sets a fixed registration call-id.
    pub fn with_reg_call_id(mut self, call_id: impl Into<String>) -> Self {
        self.reg_call_id = call_id.into();
        self
    }

    /// Sets the SRTP policy.
    pub fn with_srtp(mut self, srtp: SrtpPolicy) -> Self {
        self.srtp = srtp;
        self
    }

    /// Sets the guest display name.
    pub fn with_guest_display_name(mut self, name: impl Into<String>) -> Self {
        self.guest_display_name = name.into();
        self
    }

    /// Identity URI of this account.
    ///
    /// A realm of `"*"` yields `sip:user`, anything else `sip:user@realm`.
    pub fn id_uri(&self) -> String {
        if self.realm == "*" {
            format!("sip:{}", self.username)
        } else {
            format!("sip:{}@{}", self.username, self.realm)
        }
    }

    /// Identity URI decorated with the guest display name, when present.
    pub fn guest_id_uri(&self) -> String {
        if self.guest_display_name.is_empty() {
            self.id_uri()
        } else {
            format!("\"{}\" <{}>", self.guest_display_name, self.id_uri())
        }
    }

    /// Proxy URI, including the transport parameter for TCP/TLS.
    pub fn proxy_uri(&self) -> String {
        let mut uri = format!("sip:{}:{}", self.host, self.port);
        if let Some(param) = self.transport.uri_param() {
            uri.push_str(param);
        }
        uri
    }

    /// Registrar URI.
    pub fn registrar_uri(&self) -> String {
        format!("sip:{}:{}", self.host, self.port)
    }

    /// A configuration is valid only when username, password, host and realm
    /// are all non-empty.
    pub fn is_valid(&self) -> bool {
        !self.username.is_empty()
            && !self.password.is_empty()
            && !self.host.is_empty()
            && !self.realm.is_empty()
    }
}
