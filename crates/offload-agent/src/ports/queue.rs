//! Queue index layout shared by every port.

use std::ops::Range;

use offload_hal::HairpinDirection;
use offload_types::{QueueId, QueueRole};

/// Partition of a port's queue indices into standard and hairpin queues.
///
/// Standard queues occupy `0..standard`, hairpin queues the indices right
/// after them. The same layout is used for receive and transmit, so every
/// port has `standard + hairpin` queues in each direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueLayout {
    standard: u16,
    hairpin: u16,
}

impl QueueLayout {
    /// Creates a layout, or `None` if the total does not fit a queue index.
    pub fn new(standard: u16, hairpin: u16) -> Option<Self> {
        standard.checked_add(hairpin)?;
        Some(Self { standard, hairpin })
    }

    pub fn standard_count(&self) -> u16 {
        self.standard
    }

    pub fn hairpin_count(&self) -> u16 {
        self.hairpin
    }

    /// Queues per direction.
    pub fn total(&self) -> u16 {
        self.standard + self.hairpin
    }

    pub fn standard_queues(&self) -> Range<QueueId> {
        0..self.standard
    }

    pub fn hairpin_queues(&self) -> Range<QueueId> {
        self.standard..self.total()
    }

    /// Role of a queue index in the given direction, or `None` if the
    /// index is outside the layout.
    pub fn role(&self, queue: QueueId, direction: HairpinDirection) -> Option<QueueRole> {
        if queue < self.standard {
            Some(QueueRole::Standard)
        } else if queue < self.total() {
            Some(match direction {
                HairpinDirection::Rx => QueueRole::HairpinRx,
                HairpinDirection::Tx => QueueRole::HairpinTx,
            })
        } else {
            None
        }
    }
}
