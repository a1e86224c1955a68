//! Crawl pipeline: the coordinator enumerates chats and submits one visit
//! task per eligible chat; each visit, running on a worker, pulls a window of
//! history and archives it through the get-or-create protocol.

pub mod coordinator;
pub mod cursor;
pub mod stats;
pub mod visit;

use crate::models::{ChatKind, ChatMeta};

pub use coordinator::Coordinator;
pub use cursor::{Cursor, Direction};
pub use stats::VisitStats;
pub use visit::CrawlHandler;

/// Work items understood by [`CrawlHandler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrawlTask {
    VisitChat { chat: ChatMeta, direction: Direction },
}

/// Groups are always archived, private chats only on request, channels never.
pub fn is_eligible(kind: ChatKind, include_private_chats: bool) -> bool {
    kind.is_group() || (include_private_chats && kind.is_private())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channels_never_eligible() {
        assert!(!is_eligible(ChatKind::Channel, true));
        assert!(!is_eligible(ChatKind::Channel, false));
    }

    #[test]
    fn test_private_chats_need_opt_in() {
        assert!(!is_eligible(ChatKind::Private, false));
        assert!(is_eligible(ChatKind::Secret, true));
        assert!(is_eligible(ChatKind::Supergroup, false));
    }
}
