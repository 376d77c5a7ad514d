//! Per-entry merge rules.
//!
//! Watchlist: set membership. A local tombstone always beats remote presence.
//! History: the entry watched most recently wins, then the one with more
//! progress. A history tombstone only loses to a remote entry watched after
//! the removal.
//!
//! Everything here is pure; the synchronizer executes the resulting plans.

use chrono::{DateTime, Utc};
use marquee_common::{HistoryEntry, WatchlistEntry};
use std::cmp::Ordering;

use crate::mirror::{EntryState, Tracked};

/// What to do with one watchlist item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchlistPlan {
    /// Only remote has it: copy into the mirror.
    Pull(WatchlistEntry),
    /// Local addition not yet on the remote: create it there.
    Push(WatchlistEntry),
    /// Both sides agree it is present; adopt the remote record.
    Keep(WatchlistEntry),
    /// Local tombstone, remote still present: delete remotely.
    RemoveRemote,
    /// Local entry has no remote counterpart and nothing to push.
    DropLocal,
    Nothing,
}

pub fn merge_watchlist(
    local: Option<&Tracked<WatchlistEntry>>,
    remote: Option<&WatchlistEntry>,
) -> WatchlistPlan {
    match (local, remote) {
        (None, None) => WatchlistPlan::Nothing,
        (None, Some(r)) => WatchlistPlan::Pull(r.clone()),
        (Some(l), None) => match &l.state {
            EntryState::Present(v) if l.pending_sync => WatchlistPlan::Push(v.clone()),
            // Acknowledged earlier and now gone remotely: removed on another device.
            EntryState::Present(_) => WatchlistPlan::DropLocal,
            EntryState::Removed { .. } => WatchlistPlan::DropLocal,
        },
        (Some(l), Some(r)) => match &l.state {
            EntryState::Removed { .. } => WatchlistPlan::RemoveRemote,
            EntryState::Present(_) => WatchlistPlan::Keep(r.clone()),
        },
    }
}

/// What to do with one history item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryPlan {
    Pull(HistoryEntry),
    /// Local entry wins: write it to the remote.
    Push(HistoryEntry),
    /// Both sides already hold this exact entry.
    Keep(HistoryEntry),
    RemoveRemote,
    DropLocal,
    Nothing,
}

/// Which side of a history comparison won.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Winner {
    Left,
    Right,
    Equal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryResolution {
    pub winner: Winner,
    /// Timestamp and progress tied but the entries still differ; the
    /// remaining fields decided.
    pub conflict: bool,
}

fn rank(e: &HistoryEntry) -> (DateTime<Utc>, u64, Option<u64>) {
    (e.last_watched_at, e.progress, e.duration)
}

/// Order two history entries for the same item.
///
/// Total and symmetric: `resolve_history(a, b)` and `resolve_history(b, a)`
/// always pick the same entry.
pub fn resolve_history(a: &HistoryEntry, b: &HistoryEntry) -> HistoryResolution {
    let conflict =
        a.last_watched_at == b.last_watched_at && a.progress == b.progress && a != b;
    let winner = match rank(a).cmp(&rank(b)) {
        Ordering::Greater => Winner::Left,
        Ordering::Less => Winner::Right,
        Ordering::Equal => Winner::Equal,
    };
    HistoryResolution { winner, conflict }
}

/// The surviving entry of two history records for the same item.
pub fn newest_history<'a>(a: &'a HistoryEntry, b: &'a HistoryEntry) -> &'a HistoryEntry {
    match resolve_history(a, b).winner {
        Winner::Left | Winner::Equal => a,
        Winner::Right => b,
    }
}

pub fn merge_history(
    local: Option<&Tracked<HistoryEntry>>,
    remote: Option<&HistoryEntry>,
) -> (HistoryPlan, Option<HistoryResolution>) {
    let plan = match (local, remote) {
        (None, None) => HistoryPlan::Nothing,
        (None, Some(r)) => HistoryPlan::Pull(r.clone()),
        (Some(l), None) => match &l.state {
            EntryState::Present(v) if l.pending_sync => HistoryPlan::Push(v.clone()),
            EntryState::Present(_) => HistoryPlan::DropLocal,
            EntryState::Removed { .. } => HistoryPlan::DropLocal,
        },
        (Some(l), Some(r)) => match &l.state {
            EntryState::Removed { removed_at } if r.last_watched_at > *removed_at => {
                HistoryPlan::Pull(r.clone())
            }
            EntryState::Removed { .. } => HistoryPlan::RemoveRemote,
            EntryState::Present(v) => {
                let resolution = resolve_history(v, r);
                let plan = match resolution.winner {
                    Winner::Left => HistoryPlan::Push(v.clone()),
                    Winner::Right => HistoryPlan::Pull(r.clone()),
                    Winner::Equal => HistoryPlan::Keep(r.clone()),
                };
                return (plan, Some(resolution));
            }
        },
    };
    (plan, None)
}
