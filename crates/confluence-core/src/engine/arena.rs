//! Stream arena
//!
//! Slots hold `Shared<Stream>` and are addressed by [`StreamId`]: slot index
//! plus a generation bumped on every removal, so a stale id never reaches a
//! stream that reused its slot. Creation order is kept separately; the mix
//! visits streams in that order and the newest live stream is the master.

use basedrop::Shared;

use super::gc::gc_handle;
use crate::stream::{Stream, StreamId};

struct Slot {
    generation: u32,
    stream: Option<Shared<Stream>>,
}

#[derive(Default)]
pub(crate) struct StreamArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    order: Vec<StreamId>,
}

impl StreamArena {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Build a stream for the next free id and store it
    pub(crate) fn insert<E>(
        &mut self,
        build: impl FnOnce(StreamId) -> Result<Stream, E>,
    ) -> Result<Shared<Stream>, E> {
        let index = match self.free.last() {
            Some(&index) => index,
            None => self.slots.len() as u32,
        };
        let generation = self.slots.get(index as usize).map_or(1, |s| s.generation);
        let id = StreamId { index, generation };

        let stream = Shared::new(&gc_handle(), build(id)?);

        if index as usize == self.slots.len() {
            self.slots.push(Slot {
                generation,
                stream: Some(stream.clone()),
            });
        } else {
            self.free.pop();
            self.slots[index as usize].stream = Some(stream.clone());
        }
        self.order.push(id);
        Ok(stream)
    }

    pub(crate) fn get(&self, id: StreamId) -> Option<Shared<Stream>> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.stream.clone()
    }

    pub(crate) fn remove(&mut self, id: StreamId) -> Option<Shared<Stream>> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let stream = slot.stream.take()?;
        slot.generation = slot.generation.wrapping_add(1).max(1);
        self.free.push(id.index);
        self.order.retain(|o| *o != id);
        Some(stream)
    }

    /// Live streams in creation order
    pub(crate) fn iter(&self) -> impl Iterator<Item = &Shared<Stream>> + '_ {
        self.order.iter().filter_map(move |id| {
            self.slots
                .get(id.index as usize)
                .and_then(|slot| slot.stream.as_ref())
        })
    }

    /// Clone every live stream into `out` (cleared first), in creation order
    pub(crate) fn snapshot(&self, out: &mut Vec<Shared<Stream>>) {
        out.clear();
        out.extend(self.iter().cloned());
    }

    /// Newest stream not yet destroyed
    pub(crate) fn master(&self) -> Option<Shared<Stream>> {
        self.order
            .iter()
            .rev()
            .filter_map(|id| self.get(*id))
            .find(|s| !s.is_destroyed())
    }

    /// Remove destroyed streams with nothing left to play
    ///
    /// Returns the ids removed. The arena's references are dropped here; the
    /// memory goes back through the collector.
    pub(crate) fn reap(&mut self) -> Vec<StreamId> {
        let finished: Vec<StreamId> = self
            .iter()
            .filter(|s| s.is_finished())
            .map(|s| s.id())
            .collect();
        for id in &finished {
            self.remove(*id);
            log::debug!("{}: reaped", id);
        }
        finished
    }

    pub(crate) fn len(&self) -> usize {
        self.order.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::StreamOptions;
    use crate::types::{AudioFormat, ChannelLayout, SampleFormat};

    fn build(id: StreamId) -> Result<Stream, crate::stream::StreamError> {
        Stream::new(
            id,
            AudioFormat::new(SampleFormat::S16LE, 48000, ChannelLayout::stereo()),
            StreamOptions::default(),
        )
    }

    #[test]
    fn test_stale_id_after_slot_reuse() {
        let mut arena = StreamArena::new();
        let first = arena.insert(build).unwrap().id();
        arena.remove(first).unwrap();

        let second = arena.insert(build).unwrap().id();
        assert_eq!(second.index, first.index);
        assert_ne!(second.generation, first.generation);
        assert!(arena.get(first).is_none());
        assert!(arena.get(second).is_some());
        assert!(arena.remove(first).is_none());
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn test_master_is_newest_live_stream() {
        let mut arena = StreamArena::new();
        let a = arena.insert(build).unwrap();
        let b = arena.insert(build).unwrap();
        assert_eq!(arena.master().map(|s| s.id()), Some(b.id()));

        b.destroy();
        assert_eq!(arena.master().map(|s| s.id()), Some(a.id()));

        a.destroy();
        assert!(arena.master().is_none());
    }

    #[test]
    fn test_reap_only_finished_streams() {
        let mut arena = StreamArena::new();
        let a = arena.insert(build).unwrap();
        let b = arena.insert(build).unwrap();
        a.destroy();

        assert_eq!(arena.reap(), vec![a.id()]);
        assert_eq!(arena.len(), 1);
        let mut live = Vec::new();
        arena.snapshot(&mut live);
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].id(), b.id());
    }
}
