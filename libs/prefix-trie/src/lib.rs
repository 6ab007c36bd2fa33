//! Byte-prefix trie.
//!
//! Holds a set of candidate byte strings and answers, for a partially read
//! input, whether that input is still consistent with at least one candidate:
//!
//! - [`PrefixMatch::Complete`]: some candidate is a prefix of the input
//! - [`PrefixMatch::Partial`]: the input is a strict prefix of some candidate,
//!   more bytes are needed to decide
//! - [`PrefixMatch::Mismatch`]: no candidate can match, whatever follows
//!
//! [`PrefixTrie::max_len`] reports the longest lookahead any lookup can need.

use std::collections::BTreeMap;

/// Outcome of a trie lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefixMatch {
    /// A full candidate was found at the start of the input.
    Complete,
    /// The input ran out while still inside at least one candidate.
    Partial,
    /// The input diverges from every candidate.
    Mismatch,
}

#[derive(Debug, Default, Clone)]
struct Node {
    children: BTreeMap<u8, usize>,
    terminal: bool,
}

/// A trie over byte strings.
#[derive(Debug, Clone)]
pub struct PrefixTrie {
    nodes: Vec<Node>,
    max_len: usize,
    len: usize,
}

impl Default for PrefixTrie {
    fn default() -> Self {
        Self::new()
    }
}

impl PrefixTrie {
    /// Create an empty trie.
    pub fn new() -> Self {
        Self {
            nodes: vec![Node::default()],
            max_len: 0,
            len: 0,
        }
    }

    /// Insert a candidate. Duplicates are ignored.
    pub fn insert(&mut self, pattern: impl AsRef<[u8]>) {
        let pattern = pattern.as_ref();
        let mut current = 0;

        for &byte in pattern {
            current = match self.nodes[current].children.get(&byte) {
                Some(&next) => next,
                None => {
                    let next = self.nodes.len();
                    self.nodes.push(Node::default());
                    self.nodes[current].children.insert(byte, next);
                    next
                }
            };
        }

        if !self.nodes[current].terminal {
            self.nodes[current].terminal = true;
            self.len += 1;
        }
        self.max_len = self.max_len.max(pattern.len());
    }

    /// Number of distinct candidates.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether no candidate has been inserted.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Length of the longest candidate.
    pub fn max_len(&self) -> usize {
        self.max_len
    }

    /// Classify `input` against the candidate set.
    pub fn lookup(&self, input: &[u8]) -> PrefixMatch {
        if self.is_empty() {
            return PrefixMatch::Mismatch;
        }

        let mut current = 0;
        if self.nodes[current].terminal {
            return PrefixMatch::Complete;
        }

        for &byte in input {
            match self.nodes[current].children.get(&byte) {
                Some(&next) => current = next,
                None => return PrefixMatch::Mismatch,
            }
            if self.nodes[current].terminal {
                return PrefixMatch::Complete;
            }
        }

        PrefixMatch::Partial
    }
}

impl<P: AsRef<[u8]>> FromIterator<P> for PrefixTrie {
    fn from_iter<I: IntoIterator<Item = P>>(iter: I) -> Self {
        let mut trie = Self::new();
        for pattern in iter {
            trie.insert(pattern);
        }
        trie
    }
}
