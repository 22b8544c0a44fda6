use std::cmp::Reverse;
use std::collections::BinaryHeap;

use crate::segment::DictEntry;

/// Terms of one field across a snapshot in term order, document counts
/// summed over segments
pub struct FieldDict {
    sources: Vec<std::vec::IntoIter<DictEntry>>,
    heap: BinaryHeap<Reverse<(Vec<u8>, usize, u64)>>,
}

impl FieldDict {
    pub(crate) fn new(sources: Vec<Vec<DictEntry>>) -> Self {
        let mut sources: Vec<_> = sources.into_iter().map(Vec::into_iter).collect();
        let mut heap = BinaryHeap::with_capacity(sources.len());
        for (idx, source) in sources.iter_mut().enumerate() {
            if let Some(entry) = source.next() {
                heap.push(Reverse((entry.term, idx, entry.count)));
            }
        }
        Self { sources, heap }
    }

    fn refill(&mut self, idx: usize) {
        if let Some(entry) = self.sources[idx].next() {
            self.heap.push(Reverse((entry.term, idx, entry.count)));
        }
    }
}

impl Iterator for FieldDict {
    type Item = DictEntry;

    fn next(&mut self) -> Option<DictEntry> {
        let Reverse((term, idx, mut count)) = self.heap.pop()?;
        self.refill(idx);
        while let Some(Reverse((next, _, _))) = self.heap.peek() {
            if *next != term {
                break;
            }
            let Some(Reverse((_, idx, more))) = self.heap.pop() else {
                break;
            };
            count += more;
            self.refill(idx);
        }
        Some(DictEntry { term, count })
    }
}
