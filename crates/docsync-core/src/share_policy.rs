//! Share policies decide which documents are exchanged with which peers.

use crate::document_id::DocumentId;
use crate::repo_id::RepoId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareDecision {
    Share,
    DontShare,
}

impl ShareDecision {
    pub fn is_share(self) -> bool {
        self == ShareDecision::Share
    }
}

impl From<bool> for ShareDecision {
    fn from(share: bool) -> Self {
        if share {
            ShareDecision::Share
        } else {
            ShareDecision::DontShare
        }
    }
}

/// Consulted by the repository before any document data leaves or enters it.
pub trait SharePolicy: Send + Sync {
    /// Whether sync messages for `doc` are exchanged with `peer` at all.
    fn should_sync(&self, doc: &DocumentId, peer: RepoId) -> ShareDecision;

    /// Whether `peer` is asked for `doc` when it is missing locally.
    fn should_request(&self, doc: &DocumentId, peer: RepoId) -> ShareDecision;

    /// Whether `doc` is offered to `peer` unprompted when it connects.
    fn should_announce(&self, doc: &DocumentId, peer: RepoId) -> ShareDecision;
}

/// Shares every document with every peer.
#[derive(Debug, Clone, Copy, Default)]
pub struct Permissive;

impl SharePolicy for Permissive {
    fn should_sync(&self, _: &DocumentId, _: RepoId) -> ShareDecision {
        ShareDecision::Share
    }

    fn should_request(&self, _: &DocumentId, _: RepoId) -> ShareDecision {
        ShareDecision::Share
    }

    fn should_announce(&self, _: &DocumentId, _: RepoId) -> ShareDecision {
        ShareDecision::Share
    }
}

/// One closure answering all three questions.
pub struct FnSharePolicy<F> {
    decide: F,
}

impl<F> FnSharePolicy<F>
where
    F: Fn(&DocumentId, RepoId) -> bool + Send + Sync,
{
    pub fn new(decide: F) -> Self {
        Self { decide }
    }
}

impl<F> SharePolicy for FnSharePolicy<F>
where
    F: Fn(&DocumentId, RepoId) -> bool + Send + Sync,
{
    fn should_sync(&self, doc: &DocumentId, peer: RepoId) -> ShareDecision {
        (self.decide)(doc, peer).into()
    }

    fn should_request(&self, doc: &DocumentId, peer: RepoId) -> ShareDecision {
        (self.decide)(doc, peer).into()
    }

    fn should_announce(&self, doc: &DocumentId, peer: RepoId) -> ShareDecision {
        (self.decide)(doc, peer).into()
    }
}
