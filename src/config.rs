use std::time::Duration;
use url::form_urlencoded;

/// Where the rendezvous server lives and how long to wait on it.
#[derive(Debug, Clone)]
pub struct SignalingConfig {
    pub host: String,
    pub port: u16,
    pub path: String,
    pub secure: bool,
    /// Ask the server for this id instead of a generated one.
    pub requested_id: Option<String>,
    pub register_timeout: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 3000,
            path: "/peerjs".to_string(),
            secure: false,
            requested_id: None,
            register_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(5),
        }
    }
}

impl SignalingConfig {
    pub fn url(&self) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        let path = normalize_path(&self.path);
        let mut url = format!("{}://{}:{}{}", scheme, self.host, self.port, path);
        if let Some(id) = &self.requested_id {
            let query = form_urlencoded::Serializer::new(String::new())
                .append_pair("id", id)
                .finish();
            url.push('?');
            url.push_str(&query);
        }
        url
    }
}

/// Client-side settings: signaling plus the ICE servers handed to WebRTC.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub signaling: SignalingConfig,
    pub ice_servers: Vec<String>,
    pub camera_index: Option<u32>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            signaling: SignalingConfig::default(),
            ice_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
            camera_index: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            path: "/peerjs".to_string(),
        }
    }
}

/// Leading slash, no trailing slash (except for the bare root).
pub fn normalize_path(path: &str) -> String {
    let trimmed = path.trim().trim_matches('/');
    format!("/{}", trimmed)
}
