use crate::core::{Result, Tsid};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

/// Process-wide count of request cycles holding each cached object.
#[derive(Debug, Default)]
pub(crate) struct LeaseTable {
    counts: Mutex<HashMap<Tsid, usize>>,
}

impl LeaseTable {
    fn acquire(&self, tsid: &Tsid) -> Result<()> {
        let mut counts = self.counts.lock()?;
        *counts.entry(tsid.clone()).or_insert(0) += 1;
        Ok(())
    }

    fn release(&self, tsid: &Tsid) -> Result<()> {
        let mut counts = self.counts.lock()?;
        if let Some(count) = counts.get_mut(tsid) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                counts.remove(tsid);
            }
        }
        Ok(())
    }

    pub(crate) fn holders(&self, tsid: &Tsid) -> Result<usize> {
        Ok(self.counts.lock()?.get(tsid).copied().unwrap_or(0))
    }

    #[cfg(test)]
    pub(crate) fn total(&self) -> Result<usize> {
        Ok(self.counts.lock()?.len())
    }
}

/// Objects one request cycle obtained from the cache.
///
/// Holding a lease keeps other cycles from evicting the object until this
/// cycle has finished.
#[derive(Debug, Default)]
pub struct LeaseSet {
    held: Mutex<HashSet<Tsid>>,
}

impl LeaseSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn holds(&self, tsid: &Tsid) -> Result<bool> {
        Ok(self.held.lock()?.contains(tsid))
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.held.lock()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.held.lock()?.is_empty())
    }

    /// Leases `tsid` once per cycle; repeated lookups do not stack.
    pub(crate) fn lease(&self, table: &LeaseTable, tsid: &Tsid) -> Result<()> {
        let mut held = self.held.lock()?;
        if held.insert(tsid.clone()) {
            table.acquire(tsid)?;
        }
        Ok(())
    }

    pub(crate) fn release_all(&self, table: &LeaseTable) -> Result<usize> {
        let held = std::mem::take(&mut *self.held.lock()?);
        for tsid in &held {
            table.release(tsid)?;
        }
        Ok(held.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leases_count_cycles_not_lookups() {
        let table = LeaseTable::default();
        let tsid = Tsid::parse("loc_9").unwrap();
        let first = LeaseSet::new();
        let second = LeaseSet::new();

        first.lease(&table, &tsid).unwrap();
        first.lease(&table, &tsid).unwrap();
        second.lease(&table, &tsid).unwrap();
        assert_eq!(table.holders(&tsid).unwrap(), 2);

        assert_eq!(first.release_all(&table).unwrap(), 1);
        assert_eq!(table.holders(&tsid).unwrap(), 1);
        second.release_all(&table).unwrap();
        assert_eq!(table.holders(&tsid).unwrap(), 0);
        assert_eq!(table.total().unwrap(), 0);
    }
}
