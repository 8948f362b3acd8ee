//! Stable identities for calculation blocks across re-parses.
//!
//! An identity combines where a block sits with a hash of its code, so an
//! edited block becomes a new unit of work while untouched blocks keep the
//! results they already have.

use serde::{Deserialize, Serialize};
use smol_str::{SmolStr, format_smolstr};
use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::extract::Segment;

/// Key correlating a calculation block across re-parses and indexing its execution state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockId(SmolStr);

impl BlockId {
    pub fn new(id: impl Into<SmolStr>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for BlockId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// How block identities are derived.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IdentityPolicy {
    /// Ordinal among calculation blocks plus code hash (`calc-{ordinal}-{hash}`).
    ///
    /// Inserting a block shifts every later ordinal, so later blocks re-run.
    #[default]
    Positional,
    /// Code hash plus the occurrence index among blocks with the same code
    /// (`calc-{hash}-{occurrence}`).
    ///
    /// Unrelated insertions and removals leave other identities alone.
    ContentOccurrence,
}

/// A calculation segment together with its identity.
#[derive(Debug, Clone, PartialEq)]
pub struct IdentifiedBlock {
    pub id: BlockId,
    /// Position among calculation blocks, starting at zero.
    pub ordinal: usize,
    /// Index of the segment this block was extracted from.
    pub segment_index: usize,
    pub language: SmolStr,
    /// Code with the marker stripped.
    pub code: String,
    pub code_hash: u64,
}

/// Simple hash function for block code.
///
/// Used to detect if a block's code has changed between extractions.
pub fn hash_source(text: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    text.hash(&mut hasher);
    hasher.finish()
}

pub fn make_block_id(
    policy: IdentityPolicy,
    ordinal: usize,
    occurrence: usize,
    hash: u64,
) -> BlockId {
    match policy {
        IdentityPolicy::Positional => BlockId(format_smolstr!("calc-{}-{:016x}", ordinal, hash)),
        IdentityPolicy::ContentOccurrence => {
            BlockId(format_smolstr!("calc-{:016x}-{}", hash, occurrence))
        }
    }
}

/// Assign identities to every calculation segment, in document order.
pub fn assign_identities(segments: &[Segment], policy: IdentityPolicy) -> Vec<IdentifiedBlock> {
    let mut occurrences: HashMap<u64, usize> = HashMap::new();

    segments
        .iter()
        .enumerate()
        .filter(|(_, segment)| segment.is_calculation())
        .enumerate()
        .map(|(ordinal, (segment_index, segment))| {
            let code_hash = hash_source(&segment.content);
            let occurrence = occurrences.entry(code_hash).or_default();
            let id = make_block_id(policy, ordinal, *occurrence, code_hash);
            *occurrence += 1;

            IdentifiedBlock {
                id,
                ordinal,
                segment_index,
                language: segment.language.clone().unwrap_or_default(),
                code: segment.content.clone(),
                code_hash,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExtractorConfig;
    use crate::extract::extract_segments;

    fn ids(text: &str, policy: IdentityPolicy) -> Vec<BlockId> {
        let segments = extract_segments(text, &ExtractorConfig::default());
        assign_identities(&segments, policy)
            .into_iter()
            .map(|b| b.id)
            .collect()
    }

    fn calc(code: &str) -> String {
        format!("```python\n%%calc\n{code}\n```\n\n")
    }

    #[test]
    fn test_hash_source() {
        let h1 = hash_source("x = 1");
        let h2 = hash_source("x = 1");
        let h3 = hash_source("x = 2");

        assert_eq!(h1, h2);
        assert_ne!(h1, h3);
    }

    #[test]
    fn test_make_block_id() {
        assert_eq!(
            make_block_id(IdentityPolicy::Positional, 3, 0, 0xab),
            BlockId::new("calc-3-00000000000000ab")
        );
        assert_eq!(
            make_block_id(IdentityPolicy::ContentOccurrence, 3, 1, 0xab).as_str(),
            "calc-00000000000000ab-1"
        );
    }

    #[test]
    fn reextraction_is_stable() {
        let text = format!("# Doc\n\n{}prose\n\n{}", calc("x = 1"), calc("y = x"));
        for policy in [IdentityPolicy::Positional, IdentityPolicy::ContentOccurrence] {
            assert_eq!(ids(&text, policy), ids(&text, policy));
        }
    }

    #[test]
    fn prose_edits_keep_identities() {
        let before = format!("Intro\n\n{}{}", calc("a = 1"), calc("b = 2"));
        let after = format!(
            "A much longer intro.\n\nWith two paragraphs.\n\n{}{}",
            calc("a = 1"),
            calc("b = 2")
        );
        assert_eq!(
            ids(&before, IdentityPolicy::Positional),
            ids(&after, IdentityPolicy::Positional)
        );
    }

    #[test]
    fn code_edit_changes_only_that_identity() {
        let before = ids(
            &format!("{}{}", calc("a = 1"), calc("b = 2")),
            IdentityPolicy::Positional,
        );
        let after = ids(
            &format!("{}{}", calc("a = 10"), calc("b = 2")),
            IdentityPolicy::Positional,
        );
        assert_ne!(before[0], after[0]);
        assert_eq!(before[1], after[1]);
    }

    #[test]
    fn identical_blocks_are_distinct() {
        let text = format!("{}{}", calc("x = 1"), calc("x = 1"));
        for policy in [IdentityPolicy::Positional, IdentityPolicy::ContentOccurrence] {
            let found = ids(&text, policy);
            assert_eq!(found.len(), 2);
            assert_ne!(found[0], found[1]);
        }
    }

    #[test]
    fn insertion_shifts_positional_but_not_occurrence() {
        let before = format!("{}{}", calc("a = 1"), calc("b = 2"));
        let after = format!("{}{}{}", calc("new = 0"), calc("a = 1"), calc("b = 2"));

        let pos_before = ids(&before, IdentityPolicy::Positional);
        let pos_after = ids(&after, IdentityPolicy::Positional);
        assert!(pos_before.iter().all(|id| !pos_after.contains(id)));

        let occ_before = ids(&before, IdentityPolicy::ContentOccurrence);
        let occ_after = ids(&after, IdentityPolicy::ContentOccurrence);
        assert_eq!(occ_before[..], occ_after[1..]);
    }

    #[test]
    fn blocks_point_back_at_segments() {
        let text = format!(
            "Intro\n\n{}```rust\nfn x() {{}}\n```\n\n{}",
            calc("a = 1"),
            calc("b = 2")
        );
        let segments = extract_segments(&text, &ExtractorConfig::default());
        let blocks = assign_identities(&segments, IdentityPolicy::Positional);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].segment_index, 1);
        assert_eq!(blocks[1].segment_index, 3);
        assert_eq!(blocks[1].ordinal, 1);
        assert_eq!(blocks[1].code, "b = 2");
        assert_eq!(blocks[1].language, "python");
    }
}
