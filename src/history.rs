use std::collections::{HashMap, VecDeque};

use crate::kernel_id::KernelId;
use crate::render::Snapshot;

/// Diff mode compares against the snapshot from two ticks ago, so a tile needs at least this many
/// entries retained.
pub const MIN_DEPTH: usize = 2;

pub const DEFAULT_DEPTH: usize = 3;

/// The most recent snapshots of a single tile, oldest first.
#[derive(Debug, Clone)]
pub struct TileHistory {
    snapshots: VecDeque<Snapshot>,
    depth: usize,
    appended: usize,
}

impl TileHistory {
    fn new(depth: usize) -> TileHistory {
        TileHistory {
            snapshots: VecDeque::with_capacity(depth),
            depth,
            appended: 0,
        }
    }

    fn push(&mut self, snapshot: Snapshot) {
        if self.snapshots.len() == self.depth {
            self.snapshots.pop_front();
        }
        self.snapshots.push_back(snapshot);
        self.appended += 1;
    }

    /// Number of snapshots still held.
    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    /// Number of snapshots ever appended, including the ones that have since been dropped.
    pub fn appended(&self) -> usize {
        self.appended
    }

    pub fn latest(&self) -> Option<&Snapshot> {
        self.snapshots.back()
    }

    // The entry before the latest one. With the current tick not yet appended, this is the
    // snapshot from two ticks ago.
    pub fn previous(&self) -> Option<&Snapshot> {
        let len = self.snapshots.len();
        if len < 2 {
            return None;
        }
        self.snapshots.get(len - 2)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Snapshot> {
        self.snapshots.iter()
    }
}

/// Per-tile snapshot log for the whole session. Each tile keeps a bounded ring of its most recent
/// snapshots; nothing older than `depth` ticks is ever read.
#[derive(Debug, Clone)]
pub struct TileHistoryStore {
    depth: usize,
    tiles: HashMap<KernelId, TileHistory>,
}

impl Default for TileHistoryStore {
    fn default() -> Self {
        TileHistoryStore::new(DEFAULT_DEPTH)
    }
}

impl TileHistoryStore {
    pub fn new(depth: usize) -> TileHistoryStore {
        TileHistoryStore {
            depth: depth.max(MIN_DEPTH),
            tiles: HashMap::new(),
        }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn append(&mut self, id: KernelId, snapshot: Snapshot) {
        let depth = self.depth;
        self.tiles
            .entry(id)
            .or_insert_with(|| TileHistory::new(depth))
            .push(snapshot);
    }

    pub fn get(&self, id: &KernelId) -> Option<&TileHistory> {
        self.tiles.get(id)
    }

    /// Number of tiles that have been rendered at least once.
    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat(value: u8) -> Snapshot {
        Snapshot::from_fn(1, 1, |_, _| [value, value, value, 255])
    }

    #[test]
    fn keeps_only_the_most_recent_snapshots() {
        let mut store = TileHistoryStore::new(3);
        let id = KernelId::new(0, 1, 0);
        for value in 0..5 {
            store.append(id, flat(value));
        }

        let history = store.get(&id).unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history.appended(), 5);
        let reds: Vec<u8> = history.iter().map(|s| s.pixel(0, 0)[0]).collect();
        assert_eq!(reds, vec![2, 3, 4]);
        assert_eq!(history.latest().unwrap().pixel(0, 0)[0], 4);
        assert_eq!(history.previous().unwrap().pixel(0, 0)[0], 3);
    }

    #[test]
    fn depth_never_drops_below_what_diffing_needs() {
        let store = TileHistoryStore::new(0);
        assert_eq!(store.depth(), MIN_DEPTH);
    }

    #[test]
    fn tiles_are_tracked_independently() {
        let mut store = TileHistoryStore::default();
        let a = KernelId::new(0, 0, 0);
        let b = KernelId::new(1, 0, 0);
        store.append(a, flat(1));
        store.append(a, flat(2));
        store.append(b, flat(9));

        assert_eq!(store.len(), 2);
        assert_eq!(store.get(&a).unwrap().appended(), 2);
        assert_eq!(store.get(&b).unwrap().appended(), 1);
        assert!(store.get(&b).unwrap().previous().is_none());
        assert!(store.get(&KernelId::new(2, 0, 0)).is_none());
    }
}
