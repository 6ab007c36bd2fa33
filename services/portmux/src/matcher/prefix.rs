//! Prefix-set matcher backed by [`PrefixTrie`].

use async_trait::async_trait;
use portmux_trie::{PrefixMatch, PrefixTrie};
use tokio::io::AsyncReadExt;

use super::Matcher;
use crate::conn::Conn;

/// Matches when the stream starts with any of a set of byte strings.
#[derive(Debug, Clone)]
pub struct PrefixMatcher {
    trie: PrefixTrie,
}

impl PrefixMatcher {
    pub fn new<I, P>(patterns: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<[u8]>,
    {
        Self {
            trie: patterns.into_iter().collect(),
        }
    }

    /// Longest lookahead this matcher will read.
    pub fn max_len(&self) -> usize {
        self.trie.max_len()
    }
}

#[async_trait]
impl Matcher for PrefixMatcher {
    async fn matches(&self, conn: &mut Conn) -> bool {
        let mut buf = vec![0u8; self.trie.max_len()];
        let mut filled = 0;

        loop {
            match self.trie.lookup(&buf[..filled]) {
                PrefixMatch::Complete => return true,
                PrefixMatch::Mismatch => return false,
                PrefixMatch::Partial => {}
            }
            if filled == buf.len() {
                return false;
            }
            match conn.read(&mut buf[filled..]).await {
                Ok(0) | Err(_) => return false,
                Ok(n) => filled += n,
            }
        }
    }
}

/// Match streams starting with any of `patterns`.
pub fn prefix<I, P>(patterns: I) -> PrefixMatcher
where
    I: IntoIterator<Item = P>,
    P: AsRef<[u8]>,
{
    PrefixMatcher::new(patterns)
}
