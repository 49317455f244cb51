use std::fmt::{Display, Formatter};
use std::io;

use crate::errors::{EngineError, EngineResult};

/// A named step of a mutation at which a failure can be injected.
///
/// The insert steps also fire for the insert half of an update or a
/// replace. Arming is only possible in unit tests and with the
/// `failpoints` feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    /// The record is in the heap, no index has seen it
    AfterStorageWrite,
    AfterHashInsert,
    AfterQuadTreeInsert,
    AfterTrieInsert,
    /// Every component is saved, nothing is committed
    BeforeCommit,
    /// Fails the rollback of whatever mutation fails next
    DuringRollback,
}

impl FailPoint {
    pub const ALL: [FailPoint; 6] = [
        FailPoint::AfterStorageWrite,
        FailPoint::AfterHashInsert,
        FailPoint::AfterQuadTreeInsert,
        FailPoint::AfterTrieInsert,
        FailPoint::BeforeCommit,
        FailPoint::DuringRollback,
    ];
}

impl Display for FailPoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FailPoint::AfterStorageWrite => "after storage write",
            FailPoint::AfterHashInsert => "after hash insert",
            FailPoint::AfterQuadTreeInsert => "after quadtree insert",
            FailPoint::AfterTrieInsert => "after trie insert",
            FailPoint::BeforeCommit => "before commit",
            FailPoint::DuringRollback => "during rollback",
        };
        write!(f, "{}", name)
    }
}

/// The armed fail point, if any. Firing disarms it.
#[derive(Debug, Default)]
pub(crate) struct FailPoints {
    armed: Option<FailPoint>,
}

impl FailPoints {
    #[cfg(any(test, feature = "failpoints"))]
    pub fn arm(&mut self, point: FailPoint) {
        self.armed = Some(point);
    }

    #[cfg(any(test, feature = "failpoints"))]
    pub fn disarm(&mut self) {
        self.armed = None;
    }

    pub fn check(&mut self, point: FailPoint) -> EngineResult<()> {
        if self.armed == Some(point) {
            self.armed = None;
            log::debug!("Fail point '{}' fired", point);
            return Err(EngineError::Io(io::Error::new(
                io::ErrorKind::Other,
                format!("injected failure {}", point),
            )));
        }
        Ok(())
    }
}
