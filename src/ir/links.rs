//! Provider/consumer links.
//!
//! A link records that operand `slot` of `consumer` may read the value
//! produced by `provider`. Every link is threaded into two doubly linked
//! lists at once: the provider's consumer list and the consumer's provider
//! list, so it can be unlinked from both in constant time. Freed links go on
//! a free list and are recycled by the next `link` call.

use super::OpIdx;
use crate::core::error::{CompileError, CompileResult};

/// Index of a link node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkIdx(u32);

impl LinkIdx {
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// One provider/consumer edge.
#[derive(Debug, Clone)]
pub struct Link {
    pub provider: OpIdx,
    pub consumer: OpIdx,
    pub slot: u8,
    prev_consumer: Option<LinkIdx>,
    next_consumer: Option<LinkIdx>,
    prev_provider: Option<LinkIdx>,
    next_provider: Option<LinkIdx>,
    live: bool,
}

/// Arena-indexed link storage with per-operator list heads.
#[derive(Debug, Clone, Default)]
pub struct LinkTable {
    links: Vec<Link>,
    free: Vec<LinkIdx>,
    /// Head of the list of links whose provider is the operator.
    consumer_heads: Vec<Option<LinkIdx>>,
    /// Head of the list of links whose consumer is the operator.
    provider_heads: Vec<Option<LinkIdx>>,
    live: usize,
}

/// Bytes charged per link node.
pub const LINK_SIZE: usize = std::mem::size_of::<Link>();

impl LinkTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make room for list heads of `count` operators.
    pub fn ensure_ops(&mut self, count: usize) {
        if self.consumer_heads.len() < count {
            self.consumer_heads.resize(count, None);
            self.provider_heads.resize(count, None);
        }
    }

    /// Number of live links.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Whether the next `link` call needs a fresh node.
    pub fn needs_node(&self) -> bool {
        self.free.is_empty()
    }

    pub fn get(&self, idx: LinkIdx) -> &Link {
        &self.links[idx.index()]
    }

    /// Create a link and thread it into both lists.
    pub fn link(&mut self, provider: OpIdx, consumer: OpIdx, slot: u8) -> LinkIdx {
        self.ensure_ops(provider.index().max(consumer.index()) + 1);
        let next_consumer = self.consumer_heads[provider.index()];
        let next_provider = self.provider_heads[consumer.index()];
        let node = Link {
            provider,
            consumer,
            slot,
            prev_consumer: None,
            next_consumer,
            prev_provider: None,
            next_provider,
            live: true,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.links[idx.index()] = node;
                idx
            }
            None => {
                self.links.push(node);
                LinkIdx((self.links.len() - 1) as u32)
            }
        };
        if let Some(next) = next_consumer {
            self.links[next.index()].prev_consumer = Some(idx);
        }
        if let Some(next) = next_provider {
            self.links[next.index()].prev_provider = Some(idx);
        }
        self.consumer_heads[provider.index()] = Some(idx);
        self.provider_heads[consumer.index()] = Some(idx);
        self.live += 1;
        idx
    }

    /// Unlink from both lists and return the node to the free list.
    pub fn unlink(&mut self, idx: LinkIdx) {
        let node = self.links[idx.index()].clone();
        debug_assert!(node.live, "unlinking a dead link");
        if !node.live {
            return;
        }

        match node.prev_consumer {
            Some(prev) => self.links[prev.index()].next_consumer = node.next_consumer,
            None => self.consumer_heads[node.provider.index()] = node.next_consumer,
        }
        if let Some(next) = node.next_consumer {
            self.links[next.index()].prev_consumer = node.prev_consumer;
        }

        match node.prev_provider {
            Some(prev) => self.links[prev.index()].next_provider = node.next_provider,
            None => self.provider_heads[node.consumer.index()] = node.next_provider,
        }
        if let Some(next) = node.next_provider {
            self.links[next.index()].prev_provider = node.prev_provider;
        }

        let slot = &mut self.links[idx.index()];
        slot.live = false;
        slot.prev_consumer = None;
        slot.next_consumer = None;
        slot.prev_provider = None;
        slot.next_provider = None;
        self.free.push(idx);
        self.live -= 1;
    }

    /// Links whose provider is `op`.
    pub fn consumers(&self, op: OpIdx) -> ConsumerIter<'_> {
        ConsumerIter {
            table: self,
            next: self.consumer_heads.get(op.index()).copied().flatten(),
        }
    }

    /// Links whose consumer is `op`.
    pub fn providers(&self, op: OpIdx) -> ProviderIter<'_> {
        ProviderIter {
            table: self,
            next: self.provider_heads.get(op.index()).copied().flatten(),
        }
    }

    pub fn consumer_links(&self, op: OpIdx) -> Vec<LinkIdx> {
        self.consumers(op).map(|(idx, _)| idx).collect()
    }

    pub fn provider_links(&self, op: OpIdx) -> Vec<LinkIdx> {
        self.providers(op).map(|(idx, _)| idx).collect()
    }

    /// Providers feeding operand `slot` of `op`.
    pub fn providers_for_slot(&self, op: OpIdx, slot: u8) -> Vec<OpIdx> {
        self.providers(op)
            .filter(|(_, link)| link.slot == slot)
            .map(|(_, link)| link.provider)
            .collect()
    }

    pub fn consumer_count(&self, op: OpIdx) -> usize {
        self.consumers(op).count()
    }

    /// Remove every link touching `op`.
    pub fn unlink_all(&mut self, op: OpIdx) {
        for idx in self.consumer_links(op) {
            self.unlink(idx);
        }
        for idx in self.provider_links(op) {
            self.unlink(idx);
        }
    }

    /// Renumber the operand slot of a link in place.
    pub fn set_slot(&mut self, idx: LinkIdx, slot: u8) {
        self.links[idx.index()].slot = slot;
    }

    /// Rebuild the table after operator compaction.
    ///
    /// `map[old]` is the new index of a surviving operator. Links touching a
    /// removed operator must already be gone.
    pub fn remap(&mut self, map: &[Option<OpIdx>], new_count: usize) -> CompileResult<()> {
        let mut triples = Vec::with_capacity(self.live);
        for old in 0..self.consumer_heads.len() {
            for (_, link) in self.consumers(OpIdx(old as u32)) {
                let provider = map.get(link.provider.index()).copied().flatten();
                let consumer = map.get(link.consumer.index()).copied().flatten();
                match (provider, consumer) {
                    (Some(provider), Some(consumer)) => triples.push((provider, consumer, link.slot)),
                    _ => {
                        return Err(CompileError::internal(format!(
                            "link {} -> {} references a removed operator",
                            link.provider, link.consumer
                        )))
                    }
                }
            }
        }

        // Keep list order stable: heads were pushed front, so replay in reverse.
        *self = LinkTable::new();
        self.ensure_ops(new_count);
        for (provider, consumer, slot) in triples.into_iter().rev() {
            self.link(provider, consumer, slot);
        }
        Ok(())
    }

    /// Check that every live link sits in both of its lists exactly once.
    pub fn verify(&self) -> CompileResult<()> {
        let mut seen_as_consumer = vec![0u8; self.links.len()];
        let mut seen_as_provider = vec![0u8; self.links.len()];

        for op in 0..self.consumer_heads.len() {
            let op = OpIdx(op as u32);
            let mut prev = None;
            for (idx, link) in self.consumers(op) {
                if link.provider != op || link.prev_consumer != prev || !link.live {
                    return Err(CompileError::internal(format!(
                        "consumer list of {} is corrupt",
                        op
                    )));
                }
                seen_as_consumer[idx.index()] += 1;
                prev = Some(idx);
            }

            let mut prev = None;
            for (idx, link) in self.providers(op) {
                if link.consumer != op || link.prev_provider != prev || !link.live {
                    return Err(CompileError::internal(format!(
                        "provider list of {} is corrupt",
                        op
                    )));
                }
                seen_as_provider[idx.index()] += 1;
                prev = Some(idx);
            }
        }

        for (i, link) in self.links.iter().enumerate() {
            let expected = u8::from(link.live);
            if seen_as_consumer[i] != expected || seen_as_provider[i] != expected {
                return Err(CompileError::internal(format!(
                    "link {} -> {} is not mutually present",
                    link.provider, link.consumer
                )));
            }
        }
        Ok(())
    }
}

/// Iterator over a provider's consumer list.
pub struct ConsumerIter<'a> {
    table: &'a LinkTable,
    next: Option<LinkIdx>,
}

impl<'a> Iterator for ConsumerIter<'a> {
    type Item = (LinkIdx, &'a Link);

    fn next(&mut self) -> Option<Self::Item> {
        let idx = self.next?;
        let link = &self.table.links[idx.index()];
        self.next = link.next_consumer;
        Some((idx, link))
    }
}

/// Iterator over a consumer's provider list.
pub struct ProviderIter<'a> {
    table: &'a LinkTable,
    next: Option<LinkIdx>,
}

impl<'a> Iterator for ProviderIter<'a> {
    type Item = (LinkIdx, &'a Link);

    fn next(&mut self) -> Option<Self::Item> {
        let idx = self.next?;
        let link = &self.table.links[idx.index()];
        self.next = link.next_provider;
        Some((idx, link))
    }
}
