/// Per-replica queue of requests that arrived ahead of the local Lamport
/// clock. Kept sorted by timestamp; insertion is stable for equal timestamps
/// so duplicates replay in arrival order.
#[derive(Debug)]
pub struct Backlog<M> {
    items: Vec<(u64, M)>,
}

impl<M> Backlog<M> {
    pub fn new() -> Self {
        Backlog { items: Vec::new() }
    }

    /// Insert before the first entry with a strictly greater timestamp.
    pub fn push(&mut self, timestamp: u64, msg: M) {
        let at = self
            .items
            .iter()
            .position(|(ts, _)| *ts > timestamp)
            .unwrap_or(self.items.len());
        self.items.insert(at, (timestamp, msg));
    }

    /// Remove and return the entry with the smallest timestamp.
    pub fn pop(&mut self) -> Option<(u64, M)> {
        if self.items.is_empty() {
            None
        } else {
            Some(self.items.remove(0))
        }
    }

    /// Timestamp the next [`pop`](Self::pop) would return.
    pub fn smallest_timestamp(&self) -> Option<u64> {
        self.items.first().map(|(ts, _)| *ts)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl<M> Default for Backlog<M> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pop_returns_smallest_timestamp_first() {
        let mut backlog = Backlog::new();
        backlog.push(8, "c");
        backlog.push(6, "a");
        backlog.push(7, "b");

        assert_eq!(backlog.smallest_timestamp(), Some(6));
        assert_eq!(backlog.pop(), Some((6, "a")));
        assert_eq!(backlog.pop(), Some((7, "b")));
        assert_eq!(backlog.pop(), Some((8, "c")));
        assert_eq!(backlog.pop(), None);
    }

    #[test]
    fn smallest_timestamp_matches_next_pop() {
        let mut backlog = Backlog::new();
        backlog.push(3, ());
        backlog.push(1, ());
        while let Some(expected) = backlog.smallest_timestamp() {
            let (ts, _) = backlog.pop().unwrap();
            assert_eq!(ts, expected);
        }
    }

    #[test]
    fn equal_timestamps_keep_insertion_order() {
        let mut backlog = Backlog::new();
        backlog.push(5, "first");
        backlog.push(5, "second");
        backlog.push(5, "third");

        assert_eq!(backlog.pop(), Some((5, "first")));
        assert_eq!(backlog.pop(), Some((5, "second")));
        assert_eq!(backlog.pop(), Some((5, "third")));
    }

    #[test]
    fn empty_backlog_has_no_timestamp() {
        let backlog: Backlog<()> = Backlog::new();
        assert_eq!(backlog.smallest_timestamp(), None);
        assert!(backlog.is_empty());
    }
}
