use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Public STUN servers used when no other rendezvous helpers are configured.
pub const DEFAULT_STUN_SERVERS: [&str; 2] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

/// Network rendezvous and relay endpoints handed to every peer connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IceConfig {
    pub ice_servers: Vec<IceServer>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IceConfigError {
    /// No STUN server is configured, peers behind NAT will not be able to discover each other.
    #[error("at least one STUN server is required")]
    MissingStunServer,
    /// A TURN server was configured without username or credential.
    #[error("TURN server {0} requires username and credential")]
    MissingTurnCredentials(String),
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            ..Default::default()
        }
    }

    pub fn turn(
        url: impl Into<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            urls: vec![url.into()],
            username: Some(username.into()),
            credential: Some(credential.into()),
        }
    }

    pub fn is_stun(&self) -> bool {
        self.urls.iter().any(|url| url.starts_with("stun:"))
    }

    pub fn has_credentials(&self) -> bool {
        self.username.is_some() && self.credential.is_some()
    }

    pub fn is_turn(&self) -> bool {
        self.urls
            .iter()
            .any(|url| url.starts_with("turn:") || url.starts_with("turns:"))
    }
}

impl IceConfig {
    pub fn new(ice_servers: Vec<IceServer>) -> Self {
        Self { ice_servers }
    }

    /// Checks that at least one STUN server is present and every TURN relay carries credentials.
    pub fn validate(&self) -> Result<(), IceConfigError> {
        if !self.ice_servers.iter().any(IceServer::is_stun) {
            return Err(IceConfigError::MissingStunServer);
        }

        if let Some(turn) = self
            .ice_servers
            .iter()
            .find(|server| server.is_turn() && !server.has_credentials())
        {
            return Err(IceConfigError::MissingTurnCredentials(turn.urls.join(",")));
        }

        Ok(())
    }

    pub fn has_relay(&self) -> bool {
        self.ice_servers.iter().any(IceServer::is_turn)
    }
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            ice_servers: DEFAULT_STUN_SERVERS
                .iter()
                .map(|url| IceServer::stun(*url))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn default_config_is_valid() {
        let config = IceConfig::default();
        assert_eq!(config.ice_servers.len(), 2);
        assert_eq!(config.validate(), Ok(()));
        assert!(!config.has_relay());
    }

    #[test]
    fn empty_config_is_invalid() {
        assert_eq!(
            IceConfig::new(vec![]).validate(),
            Err(IceConfigError::MissingStunServer)
        );
    }

    #[test]
    fn turn_only_config_is_invalid() {
        let config = IceConfig::new(vec![IceServer::turn("turn:relay.example:3478", "user", "pass")]);
        assert_eq!(config.validate(), Err(IceConfigError::MissingStunServer));
    }

    #[test]
    fn turn_without_credentials_is_invalid() {
        let config = IceConfig::new(vec![
            IceServer::stun("stun:stun.example:3478"),
            IceServer::stun("turn:relay.example:3478"),
        ]);
        assert_eq!(
            config.validate(),
            Err(IceConfigError::MissingTurnCredentials(
                "turn:relay.example:3478".to_string()
            ))
        );
    }

    #[test]
    fn stun_with_turn_relay() {
        let config = IceConfig::new(vec![
            IceServer::stun("stun:stun.example:3478"),
            IceServer::turn("turns:relay.example:5349", "user", "pass"),
        ]);
        assert_eq!(config.validate(), Ok(()));
        assert!(config.has_relay());
    }

    #[test]
    fn serialize_skips_empty_credentials() {
        let serialized = serde_json::to_string(&IceServer::stun("stun:a:1")).unwrap();
        assert_eq!(serialized, "{\"urls\":[\"stun:a:1\"]}");

        let deserialized: IceConfig =
            serde_json::from_str("{\"ice_servers\":[{\"urls\":[\"stun:a:1\"]}]}").unwrap();
        assert_eq!(deserialized, IceConfig::new(vec![IceServer::stun("stun:a:1")]));
    }
}
