use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque identifier of a consumer or provider session.
///
/// Unique for the lifetime of one signalling connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random id
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for PeerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Which side of the stream a peer is on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// AR capture device streaming color, depth and pose
    Provider,
    /// Viewer receiving the streams
    Consumer,
}

impl Role {
    pub fn opposite(self) -> Self {
        match self {
            Role::Provider => Role::Consumer,
            Role::Consumer => Role::Provider,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Provider => f.write_str("provider"),
            Role::Consumer => f.write_str("consumer"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "provider" => Ok(Role::Provider),
            "consumer" => Ok(Role::Consumer),
            other => Err(format!("unknown role '{}'", other)),
        }
    }
}

/// Camera and groundplane poses reported by a provider.
///
/// Both are flat 4x4 matrices in row-major order.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Matrices {
    pub camera: [f32; 16],
    pub groundplane: [f32; 16],
}

impl Matrices {
    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_wire_format() {
        assert_eq!(serde_json::to_string(&Role::Provider).unwrap(), "\"provider\"");
        assert_eq!("Consumer".parse::<Role>().unwrap(), Role::Consumer);
        assert_eq!(Role::Consumer.opposite(), Role::Provider);
    }

    #[test]
    fn test_matrices_ignore_extra_fields() {
        let identity: Vec<f32> = (0..16).map(|i| if i % 5 == 0 { 1.0 } else { 0.0 }).collect();
        let json = serde_json::json!({
            "camera": identity,
            "groundplane": identity,
            "projection": [1, 2, 3],
        });
        let matrices = Matrices::from_json(json.to_string().as_bytes()).unwrap();
        assert_eq!(matrices.camera[0], 1.0);
        assert_eq!(matrices.groundplane[5], 1.0);
    }

    #[test]
    fn test_matrices_reject_short_arrays() {
        let json = r#"{"camera": [1, 0, 0], "groundplane": []}"#;
        assert!(Matrices::from_json(json.as_bytes()).is_err());
    }
}
