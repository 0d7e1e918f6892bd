//! Ballot records for the voting coordinator
//!
//! A ballot is one field map in the [`RecordStore`]:
//!
//! | field | content |
//! |-------|---------|
//! | `*` | overall status |
//! | `#` | argument the round was started with |
//! | `@` | routing address of the client to notify |
//! | flow name | participant value |
//!
//! Participant values starting with `-` or `+` are still pending.

use crate::config::VoteNamespace;
use crate::error::StoreError;
use crate::store::{FieldMap, RecordStore};

pub const STATUS_FIELD: &str = "*";
pub const ARGUMENT_FIELD: &str = "#";
pub const CLIENT_FIELD: &str = "@";

/// Participant value after a successful send
pub const SENT_MARK: &str = "-sent";

/// Participant value after a failed send
pub const ERROR_MARK: &str = "error";

pub fn is_reserved_field(name: &str) -> bool {
    matches!(name, STATUS_FIELD | ARGUMENT_FIELD | CLIENT_FIELD)
}

/// Whether a participant value still waits for delivery or a result
pub fn is_pending(value: &str) -> bool {
    value.starts_with('-') || value.starts_with('+')
}

/// Store key of a ballot
pub fn ballot_key(namespace: VoteNamespace, station: &str, token: &str) -> String {
    match namespace {
        VoteNamespace::Station => format!("vote:{}:{}", station, token),
        VoteNamespace::Global => format!("vote:{}", token),
    }
}

/// Overall status of a round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BallotStatus {
    Start,
    Sent,
    Waiting,
    End,
    Closed,
}

impl BallotStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BallotStatus::Start => "start",
            BallotStatus::Sent => "sent",
            BallotStatus::Waiting => "waiting",
            BallotStatus::End => "-end",
            BallotStatus::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "start" => Some(BallotStatus::Start),
            "sent" => Some(BallotStatus::Sent),
            "waiting" => Some(BallotStatus::Waiting),
            "-end" => Some(BallotStatus::End),
            "closed" => Some(BallotStatus::Closed),
            _ => None,
        }
    }

    /// `start -> sent -> waiting -> end`, anything but `closed` may close
    pub fn can_move_to(self, next: BallotStatus) -> bool {
        matches!(
            (self, next),
            (BallotStatus::Start, BallotStatus::Sent)
                | (BallotStatus::Sent, BallotStatus::Waiting)
                | (BallotStatus::Waiting, BallotStatus::End)
                | (
                    BallotStatus::Start
                        | BallotStatus::Sent
                        | BallotStatus::Waiting
                        | BallotStatus::End,
                    BallotStatus::Closed
                )
        )
    }

    /// A round in this status blocks a new `start`
    pub fn is_active(self) -> bool {
        self != BallotStatus::Closed
    }
}

/// Client command, the leading character of the command frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteCommand {
    List,
    Read,
    Start,
    Wait,
    End,
    Close,
}

impl VoteCommand {
    pub fn parse(frame: &[u8]) -> Option<Self> {
        match frame.first()? {
            b'*' => Some(VoteCommand::List),
            b'$' => Some(VoteCommand::Read),
            b'@' => Some(VoteCommand::Start),
            b'%' => Some(VoteCommand::Wait),
            b'v' => Some(VoteCommand::End),
            b'x' => Some(VoteCommand::Close),
            _ => None,
        }
    }

    /// Status this command moves the ballot to
    pub fn target(self) -> Option<BallotStatus> {
        match self {
            VoteCommand::Wait => Some(BallotStatus::Waiting),
            VoteCommand::End => Some(BallotStatus::End),
            VoteCommand::Close => Some(BallotStatus::Closed),
            _ => None,
        }
    }
}

/// Snapshot of one stored ballot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ballot {
    key: String,
    fields: FieldMap,
}

impl Ballot {
    /// Load the ballot at `key`; `None` when absent
    pub fn load(store: &dyn RecordStore, key: &str) -> Result<Option<Self>, StoreError> {
        let fields = store.get_all(key)?;
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(Some(Self {
            key: key.to_string(),
            fields,
        }))
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn fields(&self) -> &FieldMap {
        &self.fields
    }

    pub fn raw_status(&self) -> Option<&str> {
        self.fields.get(STATUS_FIELD).map(String::as_str)
    }

    pub fn status(&self) -> Option<BallotStatus> {
        self.raw_status().and_then(BallotStatus::parse)
    }

    pub fn argument(&self) -> Option<&str> {
        self.fields.get(ARGUMENT_FIELD).map(String::as_str)
    }

    pub fn client(&self) -> Option<&str> {
        self.fields.get(CLIENT_FIELD).map(String::as_str)
    }

    /// Participant fields only
    pub fn participants(&self) -> FieldMap {
        self.fields
            .iter()
            .filter(|(k, _)| !is_reserved_field(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Flow names whose value is still pending
    pub fn pending(&self) -> Vec<String> {
        self.fields
            .iter()
            .filter(|(k, v)| !is_reserved_field(k) && is_pending(v))
            .map(|(k, _)| k.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn test_ballot_key_builder() {
        assert_eq!(ballot_key(VoteNamespace::Station, "vote", "T1"), "vote:vote:T1");
        assert_eq!(ballot_key(VoteNamespace::Global, "vote", "T1"), "vote:T1");
    }

    #[test]
    fn test_transitions() {
        use BallotStatus::*;
        assert!(Start.can_move_to(Sent));
        assert!(Sent.can_move_to(Waiting));
        assert!(Waiting.can_move_to(End));
        for s in [Start, Sent, Waiting, End] {
            assert!(s.can_move_to(Closed));
        }
        assert!(!Start.can_move_to(End));
        assert!(!Start.can_move_to(Waiting));
        assert!(!Closed.can_move_to(Closed));
        assert!(!End.can_move_to(Waiting));
    }

    #[test]
    fn test_status_names() {
        assert_eq!(BallotStatus::End.as_str(), "-end");
        assert_eq!(BallotStatus::parse("-end"), Some(BallotStatus::End));
        assert_eq!(BallotStatus::parse("error"), None);
    }

    #[test]
    fn test_command_parse() {
        assert_eq!(VoteCommand::parse(b"@start"), Some(VoteCommand::Start));
        assert_eq!(VoteCommand::parse(b"x"), Some(VoteCommand::Close));
        assert_eq!(VoteCommand::parse(b"?"), None);
        assert_eq!(VoteCommand::parse(b""), None);
        assert_eq!(VoteCommand::End.target(), Some(BallotStatus::End));
    }

    #[test]
    fn test_pending_participants() {
        let store = MemoryStore::new();
        store
            .set_fields(
                "k",
                &[
                    ("*", "sent"),
                    ("@", "client"),
                    ("w1", "-sent"),
                    ("w2", "+delivered"),
                    ("w3", "yes"),
                    ("w4", "error"),
                ],
            )
            .unwrap();
        let ballot = Ballot::load(&store, "k").unwrap().unwrap();
        assert_eq!(ballot.status(), Some(BallotStatus::Sent));
        assert_eq!(ballot.client(), Some("client"));
        assert_eq!(ballot.pending(), vec!["w1".to_string(), "w2".to_string()]);
        assert_eq!(ballot.participants().len(), 4);
        assert!(Ballot::load(&store, "other").unwrap().is_none());
    }
}
