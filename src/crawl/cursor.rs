//! Where a visit starts reading history.
//!
//! Progress is derived from what the store already holds, so a restarted
//! process resumes where the previous one stopped.

use crate::store::MessageBounds;

/// Which end of the stored range a visit extends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Older messages, below the lowest stored id.
    Backfill,
    /// Newer messages, above the highest stored id.
    CatchUp,
}

impl Direction {
    pub fn flip(self) -> Self {
        match self {
            Direction::Backfill => Direction::CatchUp,
            Direction::CatchUp => Direction::Backfill,
        }
    }
}

/// Arguments of one history request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    pub from_message_id: i64,
    pub offset: i32,
    pub limit: usize,
}

pub fn cursor(direction: Direction, bounds: Option<MessageBounds>, window: usize) -> Cursor {
    let window = window.max(1);

    let Some(bounds) = bounds else {
        return Cursor {
            from_message_id: 0,
            offset: 0,
            limit: window,
        };
    };

    match direction {
        Direction::Backfill => Cursor {
            from_message_id: bounds.min,
            offset: 0,
            limit: window,
        },
        Direction::CatchUp => {
            let newer = i32::try_from(window - 1).unwrap_or(i32::MAX);
            Cursor {
                from_message_id: bounds.max,
                offset: -newer,
                limit: window,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STORED: MessageBounds = MessageBounds { min: 100, max: 900 };

    #[test]
    fn test_empty_chat_starts_from_latest() {
        for direction in [Direction::Backfill, Direction::CatchUp] {
            assert_eq!(
                cursor(direction, None, 100),
                Cursor {
                    from_message_id: 0,
                    offset: 0,
                    limit: 100,
                }
            );
        }
    }

    #[test]
    fn test_backfill_reads_below_lowest() {
        let c = cursor(Direction::Backfill, Some(STORED), 100);
        assert_eq!(c.from_message_id, 100);
        assert_eq!(c.offset, 0);
    }

    #[test]
    fn test_catch_up_reads_above_highest() {
        let c = cursor(Direction::CatchUp, Some(STORED), 100);
        assert_eq!(c.from_message_id, 900);
        assert_eq!(c.offset, -99);
        assert_eq!(c.limit, 100);
    }

    #[test]
    fn test_single_message_window() {
        let c = cursor(Direction::CatchUp, Some(STORED), 1);
        assert_eq!(c.offset, 0);
    }

    #[test]
    fn test_flip_alternates() {
        assert_eq!(Direction::Backfill.flip(), Direction::CatchUp);
        assert_eq!(Direction::Backfill.flip().flip(), Direction::Backfill);
    }
}
