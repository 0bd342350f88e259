//! Value Objects - Immutable domain primitives
//!
//! Value objects are identified by their value rather than identity.
//! They are immutable and can be freely shared.

use serde::{Deserialize, Serialize};

/// Unique identifier for a node in the replication topology.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of captured change.
///
/// The single-letter codes are what the change log stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataEventType {
    Insert,
    Update,
    Delete,
    /// Raw SQL to run at the target
    Sql,
    /// Table definition to create at the target
    Create,
    /// Script evaluated at the target with bound variables
    Bsh,
    /// Marker that requests an initial load of the target node
    Reload,
}

impl DataEventType {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Insert => "I",
            Self::Update => "U",
            Self::Delete => "D",
            Self::Sql => "S",
            Self::Create => "C",
            Self::Bsh => "B",
            Self::Reload => "R",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "I" => Some(Self::Insert),
            "U" => Some(Self::Update),
            "D" => Some(Self::Delete),
            "S" => Some(Self::Sql),
            "C" => Some(Self::Create),
            "B" => Some(Self::Bsh),
            "R" => Some(Self::Reload),
            _ => None,
        }
    }

    /// Whether applying this event needs a resolved target table.
    pub fn requires_table(&self) -> bool {
        matches!(self, Self::Insert | Self::Update | Self::Delete)
    }

    /// Whether the transform engine may rewrite this event.
    pub fn is_transformable(&self) -> bool {
        self.requires_table()
    }
}

impl std::fmt::Display for DataEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::Sql => "SQL",
            Self::Create => "CREATE",
            Self::Bsh => "BSH",
            Self::Reload => "RELOAD",
        };
        write!(f, "{}", name)
    }
}

/// Lifecycle state of a batch.
///
/// `Sending` only ever lives in memory while a push owns the batch;
/// the store persists `New`, `Ok` and `Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BatchStatus {
    New,
    Sending,
    Ok,
    Error,
}

impl BatchStatus {
    pub fn code(&self) -> &'static str {
        match self {
            Self::New => "NE",
            Self::Sending => "SE",
            Self::Ok => "OK",
            Self::Error => "ER",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "NE" => Some(Self::New),
            "SE" => Some(Self::Sending),
            "OK" => Some(Self::Ok),
            "ER" => Some(Self::Error),
            _ => None,
        }
    }

    /// Legal transitions of the batch state machine.
    pub fn can_transition_to(&self, next: BatchStatus) -> bool {
        matches!(
            (self, next),
            (Self::New, Self::Sending)
                | (Self::Error, Self::Sending)
                | (Self::Sending, Self::Ok)
                | (Self::Sending, Self::Error)
                // ignored channels are acknowledged without ever being sent
                | (Self::New, Self::Ok)
                | (Self::Error, Self::Ok)
        )
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::New | Self::Error)
    }
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// What a batch carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BatchType {
    Events,
    InitialLoad,
}

impl BatchType {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Events => "EV",
            Self::InitialLoad => "IL",
        }
    }

    pub fn from_code(code: &str) -> Self {
        match code {
            "IL" => Self::InitialLoad,
            _ => Self::Events,
        }
    }
}

/// How the writer decides whether the target row still matches what the source saw.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DetectConflict {
    /// Primary key only (last write wins)
    UsePkData,
    /// Every column must still hold its old value
    UseOldData,
    /// Only the changed columns must still hold their old value
    UseChangedData,
    /// A version column must still hold its old value
    UseVersion,
    /// A timestamp column must still hold its old value
    UseTimestamp,
}

impl DetectConflict {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_uppercase().as_str() {
            "USE_PK_DATA" => Some(Self::UsePkData),
            "USE_OLD_DATA" => Some(Self::UseOldData),
            "USE_CHANGED_DATA" => Some(Self::UseChangedData),
            "USE_VERSION" => Some(Self::UseVersion),
            "USE_TIMESTAMP" => Some(Self::UseTimestamp),
            _ => None,
        }
    }
}

impl Default for DetectConflict {
    fn default() -> Self {
        Self::UsePkData
    }
}

/// What the writer does once a conflict is detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResolveConflict {
    Fallback,
    Ignore,
    Manual,
}

impl ResolveConflict {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_uppercase().as_str() {
            "FALLBACK" => Some(Self::Fallback),
            "IGNORE" => Some(Self::Ignore),
            "MANUAL" => Some(Self::Manual),
            _ => None,
        }
    }
}

impl Default for ResolveConflict {
    fn default() -> Self {
        Self::Fallback
    }
}

/// Target action for a source DELETE passing through a transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeleteAction {
    /// Drop the delete silently
    None,
    /// Delete the target row
    DelRow,
    /// Update the target row instead (soft delete)
    UpdateCol,
}

impl Default for DeleteAction {
    fn default() -> Self {
        Self::None
    }
}

/// Which source events a transform column participates in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IncludeOn {
    All,
    Insert,
    Update,
    Delete,
}

impl IncludeOn {
    pub fn includes(&self, event: DataEventType) -> bool {
        match self {
            Self::All => true,
            Self::Insert => event == DataEventType::Insert,
            Self::Update => event == DataEventType::Update,
            Self::Delete => event == DataEventType::Delete,
        }
    }
}

impl Default for IncludeOn {
    fn default() -> Self {
        Self::All
    }
}

/// Where in the pipeline a transform runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransformPoint {
    Extract,
    Load,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id() {
        let id = NodeId::new("store-001");
        assert_eq!(id.as_str(), "store-001");
        assert_eq!(format!("{}", id), "store-001");
    }

    #[test]
    fn test_event_type_codes() {
        for event in [
            DataEventType::Insert,
            DataEventType::Update,
            DataEventType::Delete,
            DataEventType::Sql,
            DataEventType::Create,
            DataEventType::Bsh,
            DataEventType::Reload,
        ] {
            assert_eq!(DataEventType::from_code(event.code()), Some(event));
        }
        assert_eq!(DataEventType::from_code("X"), None);
    }

    #[test]
    fn test_requires_table() {
        assert!(DataEventType::Insert.requires_table());
        assert!(DataEventType::Delete.requires_table());
        assert!(!DataEventType::Sql.requires_table());
        assert!(!DataEventType::Bsh.requires_table());
    }

    #[test]
    fn test_batch_status_transitions() {
        assert!(BatchStatus::New.can_transition_to(BatchStatus::Sending));
        assert!(BatchStatus::Sending.can_transition_to(BatchStatus::Ok));
        assert!(BatchStatus::Sending.can_transition_to(BatchStatus::Error));
        assert!(BatchStatus::Error.can_transition_to(BatchStatus::Sending));
        assert!(!BatchStatus::Ok.can_transition_to(BatchStatus::Sending));
        assert!(!BatchStatus::New.can_transition_to(BatchStatus::Error));
    }

    #[test]
    fn test_batch_status_pending() {
        assert!(BatchStatus::New.is_pending());
        assert!(BatchStatus::Error.is_pending());
        assert!(!BatchStatus::Ok.is_pending());
        assert!(!BatchStatus::Sending.is_pending());
    }

    #[test]
    fn test_conflict_names() {
        assert_eq!(DetectConflict::from_name("use_old_data"), Some(DetectConflict::UseOldData));
        assert_eq!(ResolveConflict::from_name("MANUAL"), Some(ResolveConflict::Manual));
        assert_eq!(DetectConflict::default(), DetectConflict::UsePkData);
        assert_eq!(ResolveConflict::default(), ResolveConflict::Fallback);
    }

    #[test]
    fn test_include_on() {
        assert!(IncludeOn::All.includes(DataEventType::Delete));
        assert!(IncludeOn::Insert.includes(DataEventType::Insert));
        assert!(!IncludeOn::Insert.includes(DataEventType::Update));
    }
}
