use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::IceServerInfo;
use crate::packet::ENGINE_IO_QUERY;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub signaling: SignalingConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub ice: IceConfig,
    #[serde(default)]
    pub media: MediaConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalingConfig {
    /// Signaling server base URL (http/https/ws/wss)
    #[serde(default = "default_url")]
    pub url: String,
    /// PEM certificate to pin for the server connection
    pub tls_cert: Option<String>,
    /// Maximum inbound WebSocket message size in bytes
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

/// Bounds on every round-trip the session waits for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Opening the WebSocket and the Socket.IO handshake
    #[serde(default = "default_connect_secs")]
    pub connect_secs: u64,
    /// `authenticate` until `authenticated` / `auth-error`
    #[serde(default = "default_auth_secs")]
    pub auth_secs: u64,
    /// `join-room` until `room-joined`
    #[serde(default = "default_join_secs")]
    pub join_secs: u64,
    /// Local description sent until the peer connection reports connected
    #[serde(default = "default_negotiation_secs")]
    pub negotiation_secs: u64,
}

/// ICE/TURN server configuration for WebRTC NAT traversal.
///
/// Without TURN, WebRTC fails behind symmetric NATs (~20% of enterprise networks).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceConfig {
    /// STUN server URLs (default: Google's public STUN servers)
    #[serde(default = "default_stun_urls")]
    pub stun_urls: Vec<String>,
    /// TURN server URLs (e.g., "turn:turn.example.com:3478")
    #[serde(default)]
    pub turn_urls: Vec<String>,
    /// TURN username (for long-term credential mechanism)
    pub turn_username: Option<String>,
    /// TURN credential/password
    pub turn_credential: Option<String>,
}

/// Local capture constraints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    #[serde(default = "default_true")]
    pub audio: bool,
    #[serde(default = "default_true")]
    pub video: bool,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_framerate")]
    pub framerate: u32,
    /// Camera device node that must exist before capture starts (e.g. "/dev/video0")
    pub video_device: Option<String>,
    /// Microphone device node that must exist before capture starts (e.g. "/dev/snd/pcmC0D0c")
    pub audio_device: Option<String>,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            tls_cert: None,
            max_message_size: default_max_message_size(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_secs: default_connect_secs(),
            auth_secs: default_auth_secs(),
            join_secs: default_join_secs(),
            negotiation_secs: default_negotiation_secs(),
        }
    }
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_urls: default_stun_urls(),
            turn_urls: Vec::new(),
            turn_username: None,
            turn_credential: None,
        }
    }
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
            width: default_width(),
            height: default_height(),
            framerate: default_framerate(),
            video_device: None,
            audio_device: None,
        }
    }
}

impl SignalingConfig {
    /// WebSocket URL of the Socket.IO endpoint, derived from the base URL.
    ///
    /// `http://host:3000` becomes `ws://host:3000/socket.io/?EIO=4&transport=websocket`.
    pub fn socket_url(&self) -> String {
        let url = self.url.trim();
        let url = if let Some(rest) = url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else if let Some(rest) = url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else {
            url.to_string()
        };
        let (base, query) = match url.split_once('?') {
            Some((base, query)) => (base.trim_end_matches('/').to_string(), Some(query)),
            None => (url.trim_end_matches('/').to_string(), None),
        };
        let base = if base.ends_with("/socket.io") {
            base
        } else {
            format!("{base}/socket.io")
        };
        match query {
            Some(q) if !q.is_empty() => format!("{base}/?{q}&{ENGINE_IO_QUERY}"),
            _ => format!("{base}/?{ENGINE_IO_QUERY}"),
        }
    }

    pub fn is_secure(&self) -> bool {
        let url = self.url.trim();
        url.starts_with("https://") || url.starts_with("wss://")
    }
}

impl TimeoutConfig {
    pub fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }
    pub fn auth(&self) -> Duration {
        Duration::from_secs(self.auth_secs)
    }
    pub fn join(&self) -> Duration {
        Duration::from_secs(self.join_secs)
    }
    pub fn negotiation(&self) -> Duration {
        Duration::from_secs(self.negotiation_secs)
    }
}

impl IceConfig {
    /// ICE servers in the shape handed to the peer connection.
    pub fn servers(&self) -> Vec<IceServerInfo> {
        let mut servers = Vec::new();
        if !self.stun_urls.is_empty() {
            servers.push(IceServerInfo {
                urls: self.stun_urls.clone(),
                username: None,
                credential: None,
            });
        }
        if !self.turn_urls.is_empty() {
            servers.push(IceServerInfo {
                urls: self.turn_urls.clone(),
                username: self.turn_username.clone(),
                credential: self.turn_credential.clone(),
            });
        }
        servers
    }
}

impl ClientConfig {
    /// Validate the configuration, returning a list of issues found.
    ///
    /// Issues are prefixed with "ERROR:" (fatal, the session should not start) or
    /// "WARNING:" (advisory, the session can start but the config is likely wrong).
    ///
    /// Returns `Ok(())` if no issues, or `Err(issues)` with all found problems.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        // --- Signaling ---
        let url = self.signaling.url.trim();
        if url.is_empty() {
            issues.push("ERROR: signaling.url is empty".to_string());
        } else if !["http://", "https://", "ws://", "wss://"]
            .iter()
            .any(|scheme| url.starts_with(scheme))
        {
            issues.push(format!(
                "ERROR: signaling.url '{url}' must start with http://, https://, ws:// or wss://"
            ));
        }
        if let Some(cert) = &self.signaling.tls_cert {
            if !std::path::Path::new(cert).exists() {
                issues.push(format!("ERROR: signaling.tls_cert '{cert}' does not exist"));
            }
            if !self.signaling.is_secure() {
                issues.push(format!(
                    "WARNING: signaling.tls_cert is set but '{url}' is not a TLS URL, the certificate will be ignored"
                ));
            }
        }
        if self.signaling.max_message_size < 1024 {
            issues.push(format!(
                "ERROR: signaling.max_message_size {} is too small (minimum 1024 bytes)",
                self.signaling.max_message_size
            ));
        }

        // --- Timeouts ---
        for (name, value) in [
            ("connect_secs", self.timeouts.connect_secs),
            ("auth_secs", self.timeouts.auth_secs),
            ("join_secs", self.timeouts.join_secs),
            ("negotiation_secs", self.timeouts.negotiation_secs),
        ] {
            if value == 0 {
                issues.push(format!("ERROR: timeouts.{name} must be greater than 0"));
            } else if value > 600 {
                issues.push(format!(
                    "WARNING: timeouts.{name} = {value}s is very long, a stuck step will hang the session"
                ));
            }
        }

        // --- ICE ---
        for url in &self.ice.stun_urls {
            if !url.starts_with("stun:") && !url.starts_with("stuns:") {
                issues.push(format!(
                    "ERROR: ice.stun_urls entry '{url}' must start with stun: or stuns:"
                ));
            }
        }
        for url in &self.ice.turn_urls {
            if !url.starts_with("turn:") && !url.starts_with("turns:") {
                issues.push(format!(
                    "ERROR: ice.turn_urls entry '{url}' must start with turn: or turns:"
                ));
            }
        }
        if !self.ice.turn_urls.is_empty()
            && (self.ice.turn_username.is_none() || self.ice.turn_credential.is_none())
        {
            issues.push(
                "WARNING: ice.turn_urls set without turn_username/turn_credential, TURN allocation will fail"
                    .to_string(),
            );
        }
        if self.ice.stun_urls.is_empty() && self.ice.turn_urls.is_empty() {
            issues.push(
                "WARNING: no ICE servers configured, falling back to public STUN servers".to_string(),
            );
        }

        // --- Media ---
        if !self.media.audio && !self.media.video {
            issues.push("ERROR: media.audio and media.video are both disabled".to_string());
        }
        if self.media.video {
            if self.media.width < 160 || self.media.height < 120 {
                issues.push(format!(
                    "ERROR: media resolution {}x{} is too small (minimum 160x120)",
                    self.media.width, self.media.height
                ));
            }
            if self.media.framerate == 0 || self.media.framerate > 60 {
                issues.push(format!(
                    "ERROR: media.framerate {} must be in 1..=60",
                    self.media.framerate
                ));
            }
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(issues)
        }
    }
}

fn default_url() -> String {
    "http://localhost:3000".to_string()
}
fn default_max_message_size() -> usize {
    1024 * 1024
}
fn default_connect_secs() -> u64 {
    10
}
fn default_auth_secs() -> u64 {
    15
}
fn default_join_secs() -> u64 {
    15
}
fn default_negotiation_secs() -> u64 {
    30
}
fn default_true() -> bool {
    true
}
fn default_width() -> u32 {
    1280
}
fn default_height() -> u32 {
    720
}
fn default_framerate() -> u32 {
    30
}
fn default_stun_urls() -> Vec<String> {
    vec![
        "stun:stun.l.google.com:19302".to_string(),
        "stun:stun1.l.google.com:19302".to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_from_empty_string() {
        let config: ClientConfig =
            toml::from_str("").expect("empty string should deserialize to default config");
        assert_eq!(config.signaling.url, "http://localhost:3000");
        assert!(config.signaling.tls_cert.is_none());
        assert_eq!(config.signaling.max_message_size, 1024 * 1024);
        assert_eq!(config.timeouts.auth_secs, 15);
        assert_eq!(config.timeouts.negotiation_secs, 30);
        assert_eq!(config.ice.stun_urls.len(), 2);
        assert!(config.ice.turn_urls.is_empty());
        assert!(config.media.audio);
        assert!(config.media.video);
        assert_eq!(config.media.width, 1280);
        assert_eq!(config.media.height, 720);
        assert_eq!(config.media.framerate, 30);
    }

    #[test]
    fn partial_config_only_timeouts_section() {
        let toml_str = r#"
[timeouts]
auth_secs = 5
"#;
        let config: ClientConfig = toml::from_str(toml_str).expect("partial config");
        assert_eq!(config.timeouts.auth_secs, 5);
        // Other fields retain defaults
        assert_eq!(config.timeouts.join_secs, 15);
        assert_eq!(config.timeouts.connect_secs, 10);
        assert_eq!(config.media.framerate, 30);
    }

    #[test]
    fn custom_values_override_defaults() {
        let toml_str = r#"
[signaling]
url = "https://consult.example.com"
tls_cert = "/etc/teleconsult/server.pem"
max_message_size = 65536

[timeouts]
connect_secs = 3
auth_secs = 4
join_secs = 5
negotiation_secs = 20

[ice]
stun_urls = ["stun:custom.stun.example.com:3478"]
turn_urls = ["turn:turn.example.com:3478"]
turn_username = "user"
turn_credential = "pass"

[media]
audio = true
video = false
width = 640
height = 480
framerate = 15
video_device = "/dev/video2"
"#;
        let config: ClientConfig = toml::from_str(toml_str).expect("full custom config");
        assert_eq!(config.signaling.url, "https://consult.example.com");
        assert_eq!(
            config.signaling.tls_cert.as_deref(),
            Some("/etc/teleconsult/server.pem")
        );
        assert_eq!(config.signaling.max_message_size, 65536);
        assert_eq!(config.timeouts.connect(), Duration::from_secs(3));
        assert_eq!(config.timeouts.auth(), Duration::from_secs(4));
        assert_eq!(config.timeouts.join(), Duration::from_secs(5));
        assert_eq!(config.timeouts.negotiation(), Duration::from_secs(20));
        assert_eq!(config.ice.turn_username.as_deref(), Some("user"));
        assert!(!config.media.video);
        assert_eq!(config.media.width, 640);
        assert_eq!(config.media.video_device.as_deref(), Some("/dev/video2"));
    }

    #[test]
    fn default_trait_matches_empty_toml() {
        let from_toml: ClientConfig = toml::from_str("").expect("default config");
        let config = ClientConfig::default();
        assert_eq!(config.signaling.url, from_toml.signaling.url);
        assert_eq!(
            config.signaling.max_message_size,
            from_toml.signaling.max_message_size
        );
        assert_eq!(config.timeouts.auth_secs, from_toml.timeouts.auth_secs);
        assert_eq!(config.timeouts.join_secs, from_toml.timeouts.join_secs);
        assert_eq!(
            config.timeouts.negotiation_secs,
            from_toml.timeouts.negotiation_secs
        );
        assert_eq!(config.ice.stun_urls, from_toml.ice.stun_urls);
        assert_eq!(config.media.audio, from_toml.media.audio);
        assert_eq!(config.media.width, from_toml.media.width);
        assert_eq!(config.media.framerate, from_toml.media.framerate);
    }

    #[test]
    fn socket_url_from_http_base() {
        let mut signaling = SignalingConfig::default();
        assert_eq!(
            signaling.socket_url(),
            "ws://localhost:3000/socket.io/?EIO=4&transport=websocket"
        );

        signaling.url = "https://consult.example.com/".to_string();
        assert_eq!(
            signaling.socket_url(),
            "wss://consult.example.com/socket.io/?EIO=4&transport=websocket"
        );
        assert!(signaling.is_secure());

        signaling.url = "wss://consult.example.com/socket.io/?tenant=a".to_string();
        assert_eq!(
            signaling.socket_url(),
            "wss://consult.example.com/socket.io/?tenant=a&EIO=4&transport=websocket"
        );
    }

    #[test]
    fn ice_servers_group_stun_and_turn() {
        let ice = IceConfig {
            turn_urls: vec!["turn:turn.example.com:3478".to_string()],
            turn_username: Some("u".to_string()),
            turn_credential: Some("p".to_string()),
            ..Default::default()
        };
        let servers = ice.servers();
        assert_eq!(servers.len(), 2);
        assert!(servers[0].username.is_none());
        assert_eq!(servers[1].credential.as_deref(), Some("p"));
    }

    // --- Validation tests ---

    fn validate_issues(config: &ClientConfig) -> Vec<String> {
        match config.validate() {
            Ok(()) => Vec::new(),
            Err(issues) => issues,
        }
    }

    fn has_error(issues: &[String], substring: &str) -> bool {
        issues
            .iter()
            .any(|i| i.starts_with("ERROR:") && i.contains(substring))
    }

    fn has_warning(issues: &[String], substring: &str) -> bool {
        issues
            .iter()
            .any(|i| i.starts_with("WARNING:") && i.contains(substring))
    }

    #[test]
    fn validate_default_config_passes() {
        assert!(ClientConfig::default().validate().is_ok());
    }

    #[test]
    fn validate_bad_url_scheme_is_error() {
        let mut config = ClientConfig::default();
        config.signaling.url = "ftp://example.com".to_string();
        assert!(has_error(&validate_issues(&config), "signaling.url"));
    }

    #[test]
    fn validate_missing_tls_cert_is_error() {
        let mut config = ClientConfig::default();
        config.signaling.url = "wss://example.com".to_string();
        config.signaling.tls_cert = Some("/nonexistent/teleconsult/cert.pem".to_string());
        let issues = validate_issues(&config);
        assert!(has_error(&issues, "tls_cert"));
        assert!(!has_warning(&issues, "not a TLS URL"));
    }

    #[test]
    fn validate_tls_cert_on_plain_url_is_warning() {
        let mut config = ClientConfig::default();
        config.signaling.tls_cert = Some("/nonexistent/cert.pem".to_string());
        assert!(has_warning(&validate_issues(&config), "not a TLS URL"));
    }

    #[test]
    fn validate_zero_timeout_is_error() {
        let mut config = ClientConfig::default();
        config.timeouts.negotiation_secs = 0;
        assert!(has_error(&validate_issues(&config), "negotiation_secs"));
    }

    #[test]
    fn validate_long_timeout_is_warning() {
        let mut config = ClientConfig::default();
        config.timeouts.auth_secs = 3600;
        let issues = validate_issues(&config);
        assert!(has_warning(&issues, "auth_secs"));
        assert!(!has_error(&issues, "auth_secs"));
    }

    #[test]
    fn validate_turn_without_credentials_is_warning() {
        let mut config = ClientConfig::default();
        config.ice.turn_urls = vec!["turn:turn.example.com:3478".to_string()];
        assert!(has_warning(&validate_issues(&config), "turn_username"));
    }

    #[test]
    fn validate_bad_ice_scheme_is_error() {
        let mut config = ClientConfig::default();
        config.ice.stun_urls = vec!["turn:wrong.example.com".to_string()];
        assert!(has_error(&validate_issues(&config), "stun_urls"));
    }

    #[test]
    fn validate_no_media_is_error() {
        let mut config = ClientConfig::default();
        config.media.audio = false;
        config.media.video = false;
        assert!(has_error(&validate_issues(&config), "both disabled"));
    }

    #[test]
    fn validate_framerate_bounds() {
        let mut config = ClientConfig::default();
        config.media.framerate = 0;
        assert!(has_error(&validate_issues(&config), "framerate"));
        config.media.framerate = 61;
        assert!(has_error(&validate_issues(&config), "framerate"));
        config.media.framerate = 60;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_resolution_ignored_when_video_disabled() {
        let mut config = ClientConfig::default();
        config.media.video = false;
        config.media.width = 0;
        assert!(config.validate().is_ok());
    }
}
