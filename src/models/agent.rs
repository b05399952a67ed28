// Agent kinds, lifecycle states and capability masks

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    Smart,
    Autonomous,
    Build,
    Coordinator,
    Custom,
}

impl AgentType {
    /// Returns all agent types
    pub fn all() -> &'static [AgentType] {
        &[
            AgentType::Smart,
            AgentType::Autonomous,
            AgentType::Build,
            AgentType::Coordinator,
            AgentType::Custom,
        ]
    }

    /// Returns the string representation of this agent type
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentType::Smart => "smart",
            AgentType::Autonomous => "autonomous",
            AgentType::Build => "build",
            AgentType::Coordinator => "coordinator",
            AgentType::Custom => "custom",
        }
    }

    /// Capabilities granted to a freshly created agent of this type
    pub fn default_capabilities(&self) -> Capabilities {
        match self {
            AgentType::Smart => {
                Capabilities::READ_FILES
                    | Capabilities::ANALYZE
                    | Capabilities::REASON
                    | Capabilities::FIX_ERRORS
            }
            AgentType::Autonomous => {
                Capabilities::READ_FILES
                    | Capabilities::WRITE_FILES
                    | Capabilities::EXECUTE
                    | Capabilities::REASON
            }
            AgentType::Build => {
                Capabilities::BUILD
                    | Capabilities::FIX_ERRORS
                    | Capabilities::EXECUTE
                    | Capabilities::INSTALL_DEPS
                    | Capabilities::READ_FILES
            }
            AgentType::Coordinator => Capabilities::all(),
            AgentType::Custom => Capabilities::empty(),
        }
    }
}

impl std::fmt::Display for AgentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for AgentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "smart" => Ok(AgentType::Smart),
            "autonomous" => Ok(AgentType::Autonomous),
            "build" => Ok(AgentType::Build),
            "coordinator" => Ok(AgentType::Coordinator),
            "custom" => Ok(AgentType::Custom),
            _ => Err(format!(
                "Unknown agent type: '{}'. Expected one of: smart, autonomous, build, coordinator, custom",
                s
            )),
        }
    }
}

/// Agent lifecycle state. See `state_machine` for the legal transitions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Created,
    Initializing,
    Idle,
    Running,
    Paused,
    Completing,
    Completed,
    Terminated,
    Error,
}

impl AgentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentState::Created => "created",
            AgentState::Initializing => "initializing",
            AgentState::Idle => "idle",
            AgentState::Running => "running",
            AgentState::Paused => "paused",
            AgentState::Completing => "completing",
            AgentState::Completed => "completed",
            AgentState::Terminated => "terminated",
            AgentState::Error => "error",
        }
    }

    /// True for the absorbing states an agent never leaves
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            AgentState::Completed | AgentState::Terminated | AgentState::Error
        )
    }
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

bitflags! {
    /// Coarse-grained permission set used to match tasks to agents.
    /// `contains(required)` is the matching rule; the empty set is required by nothing.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct Capabilities: u32 {
        const BUILD = 1 << 0;
        const FIX_ERRORS = 1 << 1;
        const READ_FILES = 1 << 2;
        const WRITE_FILES = 1 << 3;
        const EXECUTE = 1 << 4;
        const INSTALL_DEPS = 1 << 5;
        const ANALYZE = 1 << 6;
        const REASON = 1 << 7;
        const SPAWN = 1 << 8;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capabilities_contains() {
        let caps = Capabilities::BUILD | Capabilities::EXECUTE;
        assert!(caps.contains(Capabilities::BUILD));
        assert!(caps.contains(Capabilities::BUILD | Capabilities::EXECUTE));
        assert!(!caps.contains(Capabilities::SPAWN));
        // The empty requirement is satisfied by anything
        assert!(Capabilities::empty().contains(Capabilities::empty()));
        assert!(caps.contains(Capabilities::empty()));
    }

    #[test]
    fn test_capabilities_insert_remove() {
        let mut caps = Capabilities::empty();
        caps.insert(Capabilities::SPAWN);
        assert!(caps.contains(Capabilities::SPAWN));
        caps.remove(Capabilities::SPAWN);
        assert!(caps.is_empty());
    }

    #[test]
    fn test_from_bits_masks_unknown() {
        assert_eq!(Capabilities::from_bits_truncate(u32::MAX), Capabilities::all());
        assert!(Capabilities::from_bits(1 << 9).is_none());
    }

    #[test]
    fn test_capabilities_serialize_as_flag_names() {
        let caps = Capabilities::BUILD | Capabilities::SPAWN;
        let json = serde_json::to_string(&caps).unwrap();
        assert_eq!(json, "\"BUILD | SPAWN\"");
        let back: Capabilities = serde_json::from_str(&json).unwrap();
        assert_eq!(back, caps);
    }

    #[test]
    fn test_agent_type_round_trip_str() {
        for agent_type in AgentType::all() {
            let parsed: AgentType = agent_type.as_str().parse().unwrap();
            assert_eq!(parsed, *agent_type);
        }
        assert!("robot".parse::<AgentType>().is_err());
    }

    #[test]
    fn test_default_capabilities() {
        assert!(AgentType::Build
            .default_capabilities()
            .contains(Capabilities::BUILD));
        assert!(AgentType::Coordinator
            .default_capabilities()
            .contains(Capabilities::SPAWN));
        assert!(AgentType::Custom.default_capabilities().is_empty());
    }

    #[test]
    fn test_is_finished() {
        assert!(AgentState::Completed.is_finished());
        assert!(AgentState::Terminated.is_finished());
        assert!(AgentState::Error.is_finished());
        assert!(!AgentState::Idle.is_finished());
        assert!(!AgentState::Paused.is_finished());
    }
}
