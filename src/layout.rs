use crate::buffer_set::BufferSet;
use crate::error::SetupError;
use std::mem::{offset_of, size_of};
use std::sync::atomic::{AtomicU32, Ordering};

/// Validity marker the device writes at offset 0 of the region.
pub const MAGIC: [u8; 4] = [0xAB, 0xCD, 0xEF, 0xAB];

/// Number of buffers per buffer set.
pub const SLOTS: usize = 3;

/// Header size of one payload buffer on the UR20 backplane.
pub const DEFAULT_HEADER_SIZE: usize = 16;

/// Payload size of one payload buffer on the UR20 backplane.
pub const DEFAULT_PAYLOAD_SIZE: usize = 1024;

/// Width of the payload-offset field at the start of every buffer header.
pub const OFFSET_FIELD_SIZE: usize = size_of::<u16>();

/// Data direction, seen from the control task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Device to control task.
    Input,
    /// Control task to device.
    Output,
}

impl Direction {
    pub const ALL: [Direction; 2] = [Direction::Input, Direction::Output];

    #[inline(always)]
    pub(crate) fn ordinal(self) -> usize {
        match self {
            Direction::Input => 0,
            Direction::Output => 1,
        }
    }
}

/// The two parties of the exchange.
///
/// Each side publishes exactly one direction and consumes the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    /// The periodic control task.
    Controller,
    /// The backplane driver (or a simulation of it).
    Device,
}

impl Side {
    /// The direction this side writes.
    pub fn publishes(self) -> Direction {
        match self {
            Side::Controller => Direction::Output,
            Side::Device => Direction::Input,
        }
    }

    /// The direction this side reads.
    pub fn consumes(self) -> Direction {
        match self {
            Side::Controller => Direction::Input,
            Side::Device => Direction::Output,
        }
    }
}

/// Index of one of the three buffers of a buffer set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Slot(u8);

impl Slot {
    pub const ALL: [Slot; SLOTS] = [Slot(0), Slot(1), Slot(2)];

    /// Returns the slot for a raw index, or `None` if it is out of range.
    #[inline(always)]
    pub fn new(raw: u8) -> Option<Self> {
        ((raw as usize) < SLOTS).then_some(Self(raw))
    }

    #[inline(always)]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Fixed metadata block at the start of the shared region.
///
/// ```text
///  0..4   magic
///  4..16  input buffer set
/// 16..28  output buffer set
/// ```
#[repr(C)]
pub(crate) struct RegionHeader {
    pub(crate) magic: AtomicU32,
    pub(crate) input: BufferSet,
    pub(crate) output: BufferSet,
}

const _: () = assert!(size_of::<RegionHeader>() == 28);
const _: () = assert!(offset_of!(RegionHeader, input) == 4);
const _: () = assert!(offset_of!(RegionHeader, output) == 16);

impl RegionHeader {
    #[inline(always)]
    pub(crate) fn buffer_set(&self, direction: Direction) -> &BufferSet {
        match direction {
            Direction::Input => &self.input,
            Direction::Output => &self.output,
        }
    }

    pub(crate) fn magic(&self) -> [u8; 4] {
        self.magic.load(Ordering::Acquire).to_ne_bytes()
    }
}

/// Validated description of where everything lives inside the region.
///
/// Computed once when the region is opened. All buffer addresses are derived
/// from it, so call sites never do offset arithmetic themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionLayout {
    header_size: usize,
    payload_size: usize,
    magic: [u8; 4],
}

impl Default for RegionLayout {
    fn default() -> Self {
        Self {
            header_size: DEFAULT_HEADER_SIZE,
            payload_size: DEFAULT_PAYLOAD_SIZE,
            magic: MAGIC,
        }
    }
}

impl RegionLayout {
    /// Size of the metadata block preceding the payload buffers.
    pub const METADATA_LEN: usize = size_of::<RegionHeader>();

    /// Creates a layout with the given buffer geometry and the default marker.
    ///
    /// # Errors
    ///
    /// The header must hold at least the payload-offset field and its size
    /// must itself be expressible as that offset; the payload region must not
    /// be empty.
    pub fn new(header_size: usize, payload_size: usize) -> Result<Self, SetupError> {
        if header_size < OFFSET_FIELD_SIZE {
            return Err(SetupError::InvalidLayout(
                "buffer header must hold the two-byte payload offset",
            ));
        }
        if header_size > u16::MAX as usize {
            return Err(SetupError::InvalidLayout(
                "buffer header does not fit a 16-bit payload offset",
            ));
        }
        if payload_size == 0 {
            return Err(SetupError::InvalidLayout("payload region is empty"));
        }
        header_size
            .checked_add(payload_size)
            .and_then(|b| b.checked_mul(2 * SLOTS))
            .and_then(|b| b.checked_add(Self::METADATA_LEN))
            .ok_or(SetupError::InvalidLayout("region size overflows"))?;
        Ok(Self {
            header_size,
            payload_size,
            magic: MAGIC,
        })
    }

    /// Replaces the expected validity marker.
    pub fn with_magic(mut self, magic: [u8; 4]) -> Self {
        self.magic = magic;
        self
    }

    pub fn header_size(&self) -> usize {
        self.header_size
    }

    pub fn payload_size(&self) -> usize {
        self.payload_size
    }

    pub fn magic(&self) -> [u8; 4] {
        self.magic
    }

    /// Header plus payload.
    pub fn buffer_size(&self) -> usize {
        self.header_size + self.payload_size
    }

    /// Minimum number of bytes the region must provide.
    pub fn required_len(&self) -> usize {
        Self::METADATA_LEN + 2 * SLOTS * self.buffer_size()
    }

    /// Byte offset of a buffer from the start of the region.
    ///
    /// Input buffers 0..3 come first, then output buffers 0..3.
    #[inline(always)]
    pub fn buffer_offset(&self, direction: Direction, slot: Slot) -> usize {
        Self::METADATA_LEN + (direction.ordinal() * SLOTS + slot.index()) * self.buffer_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_layout_matches_ur20_geometry() {
        let layout = RegionLayout::default();
        assert_eq!(layout.buffer_size(), 1040);
        assert_eq!(RegionLayout::METADATA_LEN, 28);
        assert_eq!(layout.required_len(), 28 + 6 * 1040);
        assert_eq!(layout.magic(), [0xAB, 0xCD, 0xEF, 0xAB]);
    }

    #[test]
    fn buffers_follow_metadata_input_first() {
        let layout = RegionLayout::default();
        let offsets: Vec<usize> = Direction::ALL
            .iter()
            .flat_map(|&d| Slot::ALL.map(|s| layout.buffer_offset(d, s)))
            .collect();
        assert_eq!(offsets, vec![28, 1068, 2108, 3148, 4188, 5228]);
        assert_eq!(
            layout.buffer_offset(Direction::Output, Slot::ALL[2]) + layout.buffer_size(),
            layout.required_len()
        );
    }

    #[test]
    fn rejects_header_without_room_for_offset() {
        assert!(matches!(
            RegionLayout::new(1, 64),
            Err(SetupError::InvalidLayout(_))
        ));
        assert!(RegionLayout::new(2, 64).is_ok());
    }

    #[test]
    fn rejects_empty_payload_and_oversized_header() {
        assert!(RegionLayout::new(16, 0).is_err());
        assert!(RegionLayout::new(u16::MAX as usize + 1, 8).is_err());
        assert!(RegionLayout::new(16, usize::MAX).is_err());
    }

    #[test]
    fn slot_range() {
        assert_eq!(Slot::new(2).map(Slot::index), Some(2));
        assert!(Slot::new(3).is_none());
        assert_eq!(Slot::ALL.map(Slot::index), [0, 1, 2]);
    }

    #[test]
    fn sides_own_opposite_directions() {
        assert_eq!(Side::Controller.publishes(), Direction::Output);
        assert_eq!(Side::Controller.consumes(), Direction::Input);
        assert_eq!(Side::Device.publishes(), Direction::Input);
        assert_eq!(Side::Device.consumes(), Direction::Output);
    }
}
