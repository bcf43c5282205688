//! Sorted page-number lists.
//!
//! The free-page list of an environment is an [`IdList`]: page numbers kept
//! in ascending order without duplicates, so single pages come off the low end
//! and overflow runs can be found by scanning for consecutive numbers.

use crate::meta::PageId;

/// ID List - a sorted, duplicate-free array of page numbers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct IdList {
    ids: Vec<PageId>,
}

impl IdList {
    /// Build a list from arbitrary ids.
    pub(crate) fn from_unsorted(mut ids: Vec<PageId>) -> Self {
        ids.sort_unstable();
        ids.dedup();
        IdList { ids }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.ids.len()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Merge another list into this one.
    pub(crate) fn append_list(&mut self, other: &[PageId]) {
        if other.is_empty() {
            return;
        }
        self.ids.extend_from_slice(other);
        self.ids.sort_unstable();
        self.ids.dedup();
    }

    /// Take `n` consecutive page numbers out of the list, lowest run first.
    pub(crate) fn take_run(&mut self, n: usize) -> Option<PageId> {
        if n == 0 || self.ids.len() < n {
            return None;
        }
        if n == 1 {
            return Some(self.ids.remove(0));
        }

        let mut start = 0;
        for i in 1..self.ids.len() {
            if self.ids[i] != self.ids[i - 1] + 1 {
                start = i;
                continue;
            }
            if i + 1 - start == n {
                let first = self.ids[start];
                self.ids.drain(start..=i);
                return Some(first);
            }
        }
        None
    }

    #[cfg(test)]
    pub(crate) fn as_slice(&self) -> &[PageId] {
        &self.ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_unsorted_sorts_and_dedups() {
        let list = IdList::from_unsorted(vec![9, 3, 5, 5]);
        assert_eq!(list.as_slice(), &[3, 5, 9]);
        assert_eq!(list.len(), 3);
        assert!(IdList::default().is_empty());
    }

    #[test]
    fn test_take_single_takes_lowest() {
        let mut list = IdList::from_unsorted(vec![12, 4, 7]);
        assert_eq!(list.take_run(1), Some(4));
        assert_eq!(list.as_slice(), &[7, 12]);
    }

    #[test]
    fn test_take_run_finds_consecutive_pages() {
        let mut list = IdList::from_unsorted(vec![2, 4, 5, 7, 8, 9, 10]);
        assert_eq!(list.take_run(3), Some(7));
        assert_eq!(list.as_slice(), &[2, 4, 5, 10]);
        assert_eq!(list.take_run(2), Some(4));
        assert_eq!(list.take_run(2), None);
        assert_eq!(list.as_slice(), &[2, 10]);
    }

    #[test]
    fn test_append_list_dedups() {
        let mut list = IdList::from_unsorted(vec![1, 3]);
        list.append_list(&[3, 2, 8]);
        assert_eq!(list.as_slice(), &[1, 2, 3, 8]);
    }
}
