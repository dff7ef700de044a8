//! Ring of block-transfer descriptors used by the analog engine
//!
//! The ring is a fixed arena of [`DESCRIPTOR_COUNT`] slots addressed by index. It is rebuilt
//! into its default chain before every arm and patched in place when the trigger moves the
//! completion point.

use crate::config::*;

/// Where the transfer engine goes after a descriptor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Link {
    /// Continue with the descriptor at this index.
    Next(u8),
    /// Stop after this descriptor.
    #[default]
    Terminate,
}

/// One block transfer into the sample buffer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Descriptor {
    /// Destination offset from the buffer base.
    pub offset: usize,
    /// Bytes moved.
    pub len: usize,
    pub link: Link,
    /// Raise the completion interrupt when this descriptor finishes.
    pub notify: bool,
}

impl Descriptor {
    pub fn end(&self) -> usize {
        self.offset + self.len
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DescriptorRing {
    slots: [Descriptor; DESCRIPTOR_COUNT],
    /// Length of every descriptor but the last.
    stride: usize,
}

impl DescriptorRing {
    pub const LAST: usize = DESCRIPTOR_COUNT - 1;

    /// Splits `size` bytes into whole bursts per descriptor.
    ///
    /// The last descriptor takes what remains after the others, rounded down to a burst, so the
    /// trimmed tail is always shorter than one burst. Returns the bytes actually covered, or
    /// `None` when a descriptor would be empty.
    pub fn plan(size: usize, burst: usize) -> Option<(usize, usize)> {
        let stride = size / DESCRIPTOR_COUNT / burst * burst;
        if stride == 0 {
            return None;
        }
        let last = (size - stride * Self::LAST) / burst * burst;
        Some((stride, stride * Self::LAST + last))
    }

    /// Rebuilds the default chain over `size` bytes: every slot links to the next, the last one
    /// loops back to the first and raises the ring-wrap interrupt.
    pub fn rebuild(&mut self, stride: usize, size: usize) {
        self.stride = stride;
        for (index, slot) in self.slots.iter_mut().enumerate() {
            let offset = index * stride;
            *slot = Descriptor {
                offset,
                len: if index == Self::LAST { size - offset } else { stride },
                link: Link::Next(((index + 1) % DESCRIPTOR_COUNT) as u8),
                notify: index == Self::LAST,
            };
        }
    }

    pub fn get(&self, index: usize) -> &Descriptor {
        &self.slots[index % DESCRIPTOR_COUNT]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Descriptor> {
        self.slots.iter()
    }

    /// Descriptor whose span holds `offset`.
    pub fn index_of(&self, offset: usize) -> usize {
        match self.stride {
            0 => 0,
            stride => (offset / stride).min(Self::LAST),
        }
    }

    pub fn set_notify(&mut self, index: usize, notify: bool) -> &Descriptor {
        let slot = &mut self.slots[index % DESCRIPTOR_COUNT];
        slot.notify = notify;
        slot
    }

    /// Makes `index` the final descriptor of the transfer.
    pub fn terminate_at(&mut self, index: usize) -> &Descriptor {
        let slot = &mut self.slots[index % DESCRIPTOR_COUNT];
        slot.link = Link::Terminate;
        slot.notify = true;
        slot
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn plan_keeps_tail_error_under_one_burst() {
        for size in [1024usize, 1000, 4096 + 36, 65_532, 98_304] {
            let (stride, covered) = DescriptorRing::plan(size, FIFO_BURST_BYTES).unwrap();
            assert_eq!(stride % FIFO_BURST_BYTES, 0);
            assert!(size - covered < FIFO_BURST_BYTES, "{size}");
            assert_eq!(covered % FIFO_BURST_BYTES, 0);
        }
    }

    #[test]
    fn plan_rejects_tiny_regions() {
        assert_eq!(DescriptorRing::plan(DESCRIPTOR_COUNT * FIFO_BURST_BYTES - 1, FIFO_BURST_BYTES), None);
    }

    #[test]
    fn default_chain_loops_and_notifies_on_last() {
        let mut ring = DescriptorRing::default();
        let (stride, covered) = DescriptorRing::plan(1000, 8).unwrap();
        ring.rebuild(stride, covered);
        let notifying: Vec<usize> = (0..DESCRIPTOR_COUNT).filter(|&i| ring.get(i).notify).collect();
        assert_eq!(notifying, [DescriptorRing::LAST]);
        assert_eq!(ring.get(DescriptorRing::LAST).link, Link::Next(0));
        assert_eq!(ring.get(3).link, Link::Next(4));
        assert_eq!(ring.get(DescriptorRing::LAST).end(), covered);
        let spans: usize = ring.iter().map(|d| d.len).sum();
        assert_eq!(spans, covered);
    }

    #[test]
    fn index_of_maps_offsets_into_slots() {
        let mut ring = DescriptorRing::default();
        ring.rebuild(64, 64 * DESCRIPTOR_COUNT + 8);
        assert_eq!(ring.index_of(0), 0);
        assert_eq!(ring.index_of(63), 0);
        assert_eq!(ring.index_of(64), 1);
        assert_eq!(ring.index_of(64 * DESCRIPTOR_COUNT + 4), DescriptorRing::LAST);
    }

    #[test]
    fn terminate_moves_completion_point() {
        let mut ring = DescriptorRing::default();
        ring.rebuild(64, 64 * DESCRIPTOR_COUNT);
        let stop = *ring.terminate_at(5);
        assert_eq!(stop.link, Link::Terminate);
        assert!(stop.notify);
        assert!(!ring.set_notify(DescriptorRing::LAST, false).notify);
    }
}
