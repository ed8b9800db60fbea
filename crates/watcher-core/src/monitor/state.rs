//! Bookkeeping owned by the monitor worker.

use std::collections::{BTreeMap, HashMap, HashSet};
use watcher_types::{LedgerIndex, TransactionHash};

/// Last ledger whose watched payments are known to be delivered.
///
/// Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerCursor(LedgerIndex);

impl LedgerCursor {
	pub fn new(ledger_index: LedgerIndex) -> Self {
		Self(ledger_index)
	}

	pub fn current(&self) -> LedgerIndex {
		self.0
	}

	/// First ledger a catch-up has to cover.
	pub fn next(&self) -> LedgerIndex {
		self.0.saturating_add(1)
	}

	/// Moves the cursor to `ledger_index`. Returns false, leaving the cursor
	/// untouched, when that would not move it forward.
	pub fn advance(&mut self, ledger_index: LedgerIndex) -> bool {
		if ledger_index <= self.0 {
			return false;
		}
		self.0 = ledger_index;
		true
	}
}

/// Hashes delivered during one resync, suppressing the overlap between the
/// live stream and the catch-up pages.
#[derive(Debug, Default)]
pub struct ProcessedHashCache {
	generation: u64,
	hashes: HashSet<TransactionHash>,
}

impl ProcessedHashCache {
	pub fn new(generation: u64) -> Self {
		Self {
			generation,
			hashes: HashSet::new(),
		}
	}

	/// Resync attempt this cache currently belongs to.
	pub fn generation(&self) -> u64 {
		self.generation
	}

	/// Hands the cache to a retried attempt on the same connection, keeping its hashes.
	pub fn carry_over(&mut self, generation: u64) {
		self.generation = generation;
	}

	#[cfg(test)]
	pub fn contains(&self, hash: &TransactionHash) -> bool {
		self.hashes.contains(hash)
	}

	/// Records `hash`. Returns false if it was already present.
	pub fn insert(&mut self, hash: TransactionHash) -> bool {
		self.hashes.insert(hash)
	}

	pub fn len(&self) -> usize {
		self.hashes.len()
	}

	#[cfg(test)]
	pub fn is_empty(&self) -> bool {
		self.hashes.is_empty()
	}
}

/// Payments delivered while live, keyed by hash with the ledger they were
/// delivered for. Keeps the per-ledger safety-net scan from re-delivering what
/// the stream already delivered.
#[derive(Debug)]
pub struct RecentDeliveries {
	window: u32,
	delivered: HashMap<TransactionHash, LedgerIndex>,
}

impl RecentDeliveries {
	pub fn new(window: u32) -> Self {
		Self {
			window: window.max(1),
			delivered: HashMap::new(),
		}
	}

	pub fn contains(&self, hash: &TransactionHash) -> bool {
		self.delivered.contains_key(hash)
	}

	pub fn record(&mut self, hash: TransactionHash, ledger_index: LedgerIndex) {
		self.delivered.insert(hash, ledger_index);
	}

	/// Forgets deliveries older than the window ending at `reconciled`.
	/// Deliveries above it are always kept.
	pub fn prune(&mut self, reconciled: LedgerIndex) {
		let window = self.window;
		self.delivered
			.retain(|_, ledger| ledger.saturating_add(window) > reconciled);
	}

	pub fn clear(&mut self) {
		self.delivered.clear();
	}

	#[cfg(test)]
	pub fn len(&self) -> usize {
		self.delivered.len()
	}
}

#[derive(Debug)]
struct PendingScans {
	remaining: usize,
	failed: bool,
}

/// Closed ledgers whose safety-net scans have not all succeeded yet.
///
/// A ledger counts as reconciled once every scan issued for it succeeded and
/// no lower ledger is still outstanding. A failed ledger stays outstanding
/// until the scan of a later close covers it again.
#[derive(Debug, Default)]
pub struct PendingLedgers {
	ledgers: BTreeMap<LedgerIndex, PendingScans>,
}

impl PendingLedgers {
	pub fn new() -> Self {
		Self::default()
	}

	/// Registers `scans` safety-net scans for `ledger_index` and returns the
	/// first ledger they have to cover. Failed ledgers are folded into the new
	/// scans.
	pub fn track(&mut self, ledger_index: LedgerIndex, scans: usize) -> LedgerIndex {
		let from = self
			.ledgers
			.iter()
			.find(|(_, pending)| pending.failed)
			.map_or(ledger_index, |(failed, _)| *failed);
		self.ledgers.retain(|_, pending| !pending.failed);
		self.ledgers.insert(
			ledger_index,
			PendingScans {
				remaining: scans,
				failed: false,
			},
		);
		from
	}

	/// Records one finished scan for `ledger_index`. Returns the highest
	/// ledger that became reconciled, if any.
	pub fn finish(&mut self, ledger_index: LedgerIndex, succeeded: bool) -> Option<LedgerIndex> {
		if let Some(pending) = self.ledgers.get_mut(&ledger_index) {
			pending.remaining = pending.remaining.saturating_sub(1);
			pending.failed |= !succeeded;
		}

		let mut reconciled = None;
		while let Some(entry) = self.ledgers.first_entry() {
			if entry.get().remaining > 0 || entry.get().failed {
				break;
			}
			reconciled = Some(entry.remove_entry().0);
		}
		reconciled
	}

	pub fn clear(&mut self) {
		self.ledgers.clear();
	}

	#[cfg(test)]
	pub fn is_empty(&self) -> bool {
		self.ledgers.is_empty()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn hash(value: &str) -> TransactionHash {
		TransactionHash::from(value)
	}

	#[test]
	fn test_cursor_only_moves_forward() {
		let mut cursor = LedgerCursor::new(100);
		assert_eq!(cursor.next(), 101);

		assert!(cursor.advance(105));
		assert!(!cursor.advance(105));
		assert!(!cursor.advance(103));
		assert_eq!(cursor.current(), 105);

		let top = LedgerCursor::new(LedgerIndex::MAX);
		assert_eq!(top.next(), LedgerIndex::MAX);
	}

	#[test]
	fn test_processed_cache() {
		let mut cache = ProcessedHashCache::new(3);
		assert!(cache.is_empty());
		assert!(cache.insert(hash("H1")));
		assert!(!cache.insert(hash("H1")));
		assert!(cache.contains(&hash("H1")));

		cache.carry_over(4);
		assert_eq!(cache.generation(), 4);
		assert_eq!(cache.len(), 1);
	}

	#[test]
	fn test_recent_deliveries_prune() {
		let mut recent = RecentDeliveries::new(3);
		recent.record(hash("H1"), 100);
		recent.record(hash("H2"), 102);

		recent.prune(102);
		assert_eq!(recent.len(), 2);

		recent.prune(103);
		assert!(!recent.contains(&hash("H1")));
		assert!(recent.contains(&hash("H2")));

		recent.prune(110);
		assert_eq!(recent.len(), 0);
	}

	#[test]
	fn test_pending_ledgers_reconcile_in_order() {
		let mut pending = PendingLedgers::new();
		assert_eq!(pending.track(120, 2), 120);
		assert_eq!(pending.track(121, 1), 121);

		assert_eq!(pending.finish(121, true), None);
		assert_eq!(pending.finish(120, true), None);
		assert_eq!(pending.finish(120, true), Some(121));
		assert!(pending.is_empty());
	}

	#[test]
	fn test_failed_ledger_is_covered_by_next_close() {
		let mut pending = PendingLedgers::new();
		pending.track(120, 1);
		assert_eq!(pending.finish(120, false), None);

		assert_eq!(pending.track(121, 1), 120);
		assert_eq!(pending.finish(121, true), Some(121));
		assert!(pending.is_empty());
	}

	#[test]
	fn test_unknown_ledger_finish_is_ignored() {
		let mut pending = PendingLedgers::new();
		pending.track(120, 1);
		assert_eq!(pending.finish(118, true), None);
		assert!(!pending.is_empty());

		pending.clear();
		assert!(pending.is_empty());
	}
}
