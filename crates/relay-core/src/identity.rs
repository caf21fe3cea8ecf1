use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{OperatorId, VisitorId};

/// Who is acting: an anonymous visitor, an authenticated operator, or the
/// service itself (system messages).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Visitor,
    Operator,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Visitor => "visitor",
            Self::Operator => "operator",
            Self::System => "system",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "visitor" => Ok(Self::Visitor),
            "operator" => Ok(Self::Operator),
            "system" => Ok(Self::System),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// Visitor identity. The id is client-held (persisted across reconnects via a
/// token on the client side); name and metadata may be amended on re-register,
/// the id never changes.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisitorProfile {
    pub id: VisitorId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl VisitorProfile {
    pub fn new(id: VisitorId, name: Option<String>, metadata: Option<Value>) -> Self {
        Self {
            id,
            name: name.unwrap_or_else(|| "Visitor".to_string()),
            metadata,
        }
    }
}

/// Operator identity as issued by the external auth collaborator.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatorProfile {
    pub id: OperatorId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperatorStatus {
    Available,
    Busy,
    Away,
    Offline,
}

impl OperatorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::Busy => "busy",
            Self::Away => "away",
            Self::Offline => "offline",
        }
    }
}

/// Wire summary of a currently connected operator, included in operator
/// registration snapshots.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnlineOperator {
    pub id: OperatorId,
    pub name: String,
    pub status: OperatorStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Role::Visitor).unwrap(), "\"visitor\"");
        assert_eq!(serde_json::to_string(&Role::Operator).unwrap(), "\"operator\"");
        assert_eq!(serde_json::to_string(&Role::System).unwrap(), "\"system\"");
    }

    #[test]
    fn operator_status_roundtrip() {
        let s: OperatorStatus = serde_json::from_str("\"away\"").unwrap();
        assert_eq!(s, OperatorStatus::Away);
        assert_eq!(serde_json::to_string(&s).unwrap(), "\"away\"");
    }

    #[test]
    fn visitor_profile_defaults_name() {
        let p = VisitorProfile::new(VisitorId::from_raw("vis_1"), None, None);
        assert_eq!(p.name, "Visitor");
    }

    #[test]
    fn visitor_profile_omits_empty_metadata() {
        let p = VisitorProfile::new(VisitorId::from_raw("vis_1"), Some("Ada".into()), None);
        let json = serde_json::to_string(&p).unwrap();
        assert!(!json.contains("metadata"), "got: {json}");
    }
}
