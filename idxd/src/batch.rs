//! Batch descriptors.
//!
//! A batch descriptor points at a contiguous, device-mapped array of
//! ordinary descriptors. The device processes the whole array as one
//! submitted unit and reports the aggregate outcome in the batch's own
//! completion record.

use crate::desc::{DescFlags, HwDesc, Opcode};
use crate::dma::DmaAddr;

/// Smallest descriptor count the device accepts in a batch.
pub const MIN_BATCH_SIZE: u32 = 2;

/// Largest descriptor count a batch may carry (the device's default
/// `max_batch_size`).
pub const MAX_BATCH_SIZE: u32 = 1024;

/// Parameters for a batch descriptor.
#[derive(Debug, Clone, Copy)]
pub struct BatchParams {
    pub pasid: u32,
    /// Device address of the first descriptor in the list.
    pub desc_list: DmaAddr,
    /// Number of descriptors in the list.
    pub count: u32,
    /// Batch completion record.
    pub completion: DmaAddr,
    pub flags: DescFlags,
}

impl HwDesc {
    /// Zero the descriptor and encode it as a BATCH over `p.desc_list`.
    ///
    /// The destination field is unused and stays zero. Element descriptors
    /// must already be populated; the device reads them after submission.
    #[inline]
    pub fn prep_batch(&mut self, p: &BatchParams) {
        self.encode(
            p.pasid,
            Opcode::Batch,
            p.flags,
            p.desc_list.0,
            0,
            p.count,
            p.completion.0,
        );
    }

    pub fn is_batch(&self) -> bool {
        self.opcode() == Some(Opcode::Batch)
    }

    /// Descriptor count of a batch descriptor.
    pub fn desc_count(&self) -> u32 {
        self.xfer_size()
    }

    /// Descriptor list address of a batch descriptor.
    pub fn desc_list_addr(&self) -> DmaAddr {
        self.src_addr()
    }
}
