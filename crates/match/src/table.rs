use checksums::tag_for;
use signature::Signatures;

const TABLE_SIZE: usize = 1 << 16;

/// Candidate lookup structure for the matcher's inner loop.
///
/// A dense 65536-entry table maps each 16-bit tag to the first slot of
/// a `(tag, block_index)` array sorted by tag, giving O(1) lookup
/// without hashing full weak sums or per-block chaining.
pub struct TagTable {
    targets: Vec<(u16, u32)>,
    table: Vec<i32>,
}

impl TagTable {
    /// Builds the table for one file's signatures.
    pub fn build(sigs: &Signatures) -> Self {
        let mut targets: Vec<(u16, u32)> = sigs
            .blocks
            .iter()
            .enumerate()
            .map(|(i, block)| (tag_for(block.sum1), i as u32))
            .collect();
        targets.sort_unstable();

        let mut table = vec![-1i32; TABLE_SIZE];
        // walk backwards so the earliest slot for each tag wins
        for (slot, &(tag, _)) in targets.iter().enumerate().rev() {
            table[usize::from(tag)] = slot as i32;
        }

        Self { targets, table }
    }

    /// First target slot for `tag`, if any block carries it.
    #[inline]
    pub fn lookup(&self, tag: u16) -> Option<usize> {
        let slot = self.table[usize::from(tag)];
        usize::try_from(slot).ok()
    }

    /// Block index at `slot` while it still carries `tag`.
    #[inline]
    pub fn candidate(&self, slot: usize, tag: u16) -> Option<usize> {
        match self.targets.get(slot) {
            Some(&(t, index)) if t == tag => Some(index as usize),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use signature::SumBuf;

    fn sigs_with_sums(sums: &[u32]) -> Signatures {
        let blocks = sums
            .iter()
            .enumerate()
            .map(|(i, &sum1)| SumBuf {
                sum1,
                sum2: [0u8; 16],
                offset: (i * 8) as u64,
                len: 8,
            })
            .collect();
        Signatures {
            block_len: 8,
            remainder: 0,
            blocks,
            file_len: (sums.len() * 8) as u64,
        }
    }

    #[test]
    fn lookup_finds_all_blocks_with_a_tag() {
        // three sums sharing one tag, one distinct
        let shared = 0x0001_0001; // tag 2
        let sigs = sigs_with_sums(&[shared, 0x0005_0009, shared, shared]);
        let table = TagTable::build(&sigs);

        let tag = tag_for(shared);
        let start = table.lookup(tag).expect("tag present");
        let mut found = Vec::new();
        let mut slot = start;
        while let Some(index) = table.candidate(slot, tag) {
            found.push(index);
            slot += 1;
        }
        assert_eq!(found, vec![0, 2, 3]);
    }

    #[test]
    fn absent_tags_miss() {
        let sigs = sigs_with_sums(&[0x0001_0001]);
        let table = TagTable::build(&sigs);
        let missing = tag_for(0x0001_0001).wrapping_add(1);
        assert!(table.lookup(missing).is_none());
    }

    #[test]
    fn empty_signatures_build_an_empty_table() {
        let sigs = Signatures::empty(700);
        let table = TagTable::build(&sigs);
        for tag in 0u16..=u16::MAX {
            assert!(table.lookup(tag).is_none());
        }
    }
}
