use std::collections::BTreeMap;

/// Assumed span of a symbol whose ELF size is zero or absent.
pub const MIN_SYMBOL_SIZE: u64 = 7;
/// How far such a span may grow as more PCs of the same function show up.
pub const MAX_SYMBOL_SIZE: u64 = 80;

/// One cached range `[start, end]` (inclusive end) with the symbol-table
/// indices to emit for any pc inside it: inline frames innermost first,
/// concrete frame last.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolSpan {
    pub end: u64,
    pub symbols: Vec<u32>,
}

/// Ordered map from ELF address ranges to symbols, one per file.
#[derive(Debug, Default)]
pub struct SymbolMap {
    map: BTreeMap<u64, SymbolSpan>,
}

impl SymbolMap {
    /// The entry with the greatest `start ≤ pc`, provided `pc ≤ end`.
    pub fn find_closest(&self, pc: u64) -> Option<(u64, &SymbolSpan)> {
        let (&start, span) = self.map.range(..=pc).next_back()?;
        (pc <= span.end).then_some((start, span))
    }

    /// Conflicting ranges are not merged: a second insertion at the same
    /// start wins only if its end is larger, and the stored symbols are
    /// left intact when they already match.
    pub fn insert_evicting(&mut self, start: u64, end: u64, symbols: Vec<u32>) {
        match self.map.entry(start) {
            std::collections::btree_map::Entry::Occupied(mut entry) => {
                let span = entry.get_mut();
                if end > span.end {
                    span.end = end;
                    if span.symbols != symbols {
                        span.symbols = symbols;
                    }
                }
            }
            std::collections::btree_map::Entry::Vacant(entry) => {
                entry.insert(SymbolSpan { end, symbols });
            }
        }
    }

    /// The span registered exactly at `start`, if any.
    pub fn span_at(&self, start: u64) -> Option<&SymbolSpan> {
        self.map.get(&start)
    }

    /// Extend a provisional span so `pc` hits on the next lookup, bounded
    /// by [`MAX_SYMBOL_SIZE`].
    pub fn grow_end(&mut self, start: u64, pc: u64) {
        if let Some(span) = self.map.get_mut(&start) {
            let capped = pc.min(start + MAX_SYMBOL_SIZE);
            if capped > span.end {
                span.end = capped;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closest_match_respects_span_end() {
        let mut map = SymbolMap::default();
        map.insert_evicting(0x100, 0x100 + MIN_SYMBOL_SIZE, vec![1]);
        map.insert_evicting(0x200, 0x240, vec![2]);

        assert_eq!(map.find_closest(0x100).unwrap().1.symbols, vec![1]);
        assert_eq!(map.find_closest(0x107).unwrap().1.symbols, vec![1]);
        assert!(map.find_closest(0x108).is_none());
        assert!(map.find_closest(0xff).is_none());
        assert_eq!(map.find_closest(0x240).unwrap().1.symbols, vec![2]);
        assert!(map.find_closest(0x241).is_none());
    }

    #[test]
    fn second_insertion_wins_only_with_larger_end() {
        let mut map = SymbolMap::default();
        map.insert_evicting(0x100, 0x140, vec![1]);
        map.insert_evicting(0x100, 0x120, vec![9]);
        assert_eq!(map.find_closest(0x130).unwrap().1.symbols, vec![1]);

        map.insert_evicting(0x100, 0x180, vec![9]);
        let span = map.find_closest(0x100).unwrap().1;
        assert_eq!(span.end, 0x180);
        assert_eq!(span.symbols, vec![9]);
    }

    #[test]
    fn growth_is_bounded() {
        let mut map = SymbolMap::default();
        map.insert_evicting(0x100, 0x100 + MIN_SYMBOL_SIZE, vec![1]);
        map.grow_end(0x100, 0x100 + 0x30);
        assert!(map.find_closest(0x130).is_some());

        map.grow_end(0x100, 0x100 + 2 * MAX_SYMBOL_SIZE);
        assert_eq!(map.find_closest(0x100).unwrap().1.end, 0x100 + MAX_SYMBOL_SIZE);
    }
}
