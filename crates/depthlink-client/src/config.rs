use depthlink_protocol::{PeerId, Role};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub signalling_url: String,
    pub peer_id: PeerId,
    pub role: Role,
    pub join_interval: Duration,
    pub stun_servers: Vec<String>,
    /// Raw 48 kHz mono s16le capture used as the microphone
    pub microphone_pcm: Option<PathBuf>,
    /// Server origin whose stream pools are joined as well
    pub stream_url: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            signalling_url: "ws://127.0.0.1:8080/signalling".to_string(),
            peer_id: PeerId::random(),
            role: Role::Consumer,
            join_interval: Duration::from_millis(5000),
            stun_servers: vec![],
            microphone_pcm: None,
            stream_url: None,
        }
    }
}

impl ClientConfig {
    pub fn load() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let signalling_url = std::env::var("SIGNALLING_URL").unwrap_or(defaults.signalling_url);

        let peer_id = std::env::var("PEER_ID")
            .map(PeerId::from)
            .unwrap_or(defaults.peer_id);

        let role = match std::env::var("PEER_ROLE") {
            Ok(role) => role.parse::<Role>().map_err(|e| anyhow::anyhow!(e))?,
            Err(_) => defaults.role,
        };

        let join_interval = match std::env::var("JOIN_INTERVAL_MS") {
            Ok(ms) => Duration::from_millis(ms.parse()?),
            Err(_) => defaults.join_interval,
        };
        if join_interval.is_zero() {
            anyhow::bail!("JOIN_INTERVAL_MS must be positive");
        }

        let stun_servers = std::env::var("STUN_SERVERS")
            .map(|s| parse_list(&s))
            .unwrap_or(defaults.stun_servers);

        let microphone_pcm = std::env::var("MICROPHONE_PCM").ok().map(PathBuf::from);
        let stream_url = std::env::var("STREAM_URL").ok();

        Ok(Self {
            signalling_url,
            peer_id,
            role,
            join_interval,
            stun_servers,
            microphone_pcm,
            stream_url,
        })
    }
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
