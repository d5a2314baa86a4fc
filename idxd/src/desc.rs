//! Work descriptor layout and codec.
//!
//! A DSA work descriptor is a 64-byte, 64-byte aligned record. Every field
//! not explicitly written by [`HwDesc::prep`] is zero: the device rejects or
//! misinterprets descriptors carrying stale bits in reserved fields.

use bitflags::bitflags;

use crate::dma::DmaAddr;

/// Descriptor size in bytes.
pub const DESC_SIZE: usize = 64;

/// PASID field width.
pub const PASID_MASK: u32 = (1 << 20) - 1;

const FLAGS_MASK: u32 = (1 << 24) - 1;

/// Descriptor opcodes.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Noop = 0x00,
    Batch = 0x01,
    Drain = 0x02,
    MemMove = 0x03,
    MemFill = 0x04,
    Compare = 0x05,
    CompareValue = 0x06,
    Dualcast = 0x09,
}

impl Opcode {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x00 => Some(Self::Noop),
            0x01 => Some(Self::Batch),
            0x02 => Some(Self::Drain),
            0x03 => Some(Self::MemMove),
            0x04 => Some(Self::MemFill),
            0x05 => Some(Self::Compare),
            0x06 => Some(Self::CompareValue),
            0x09 => Some(Self::Dualcast),
            _ => None,
        }
    }
}

bitflags! {
    /// Operation flags (24-bit field).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DescFlags: u32 {
        /// Wait for all previous descriptors in the batch.
        const FENCE = 0x0001;
        /// Block on fault.
        const BOF = 0x0002;
        /// Completion record address valid.
        const CRAV = 0x0004;
        /// Request completion record.
        const RCR = 0x0008;
        /// Request completion interrupt.
        const RCI = 0x0010;
        /// Completion record steering.
        const CRSTS = 0x0020;
        /// Cache control for the completion record.
        const CR = 0x0080;
        /// Cache control for destination writes.
        const CC = 0x0100;
    }
}

/// Hardware work descriptor.
///
/// Layout:
/// - offset 0: `pasid[19:0] | rsvd[30:20] | priv[31]`
/// - offset 4: `flags[23:0] | opcode[31:24]`
/// - offset 8: completion record address
/// - offset 16: source address (descriptor list address for BATCH)
/// - offset 24: destination address
/// - offset 32: transfer size (descriptor count for BATCH)
/// - offset 36: interrupt handle
/// - offset 38: reserved
/// - offset 40: operation specific
#[repr(C, align(64))]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct HwDesc {
    pasid_priv: u32,
    flags_opcode: u32,
    completion_addr: u64,
    src_addr: u64,
    dst_addr: u64,
    xfer_size: u32,
    int_handle: u16,
    rsvd1: u16,
    op_specific: [u8; 24],
}

const _: () = assert!(std::mem::size_of::<HwDesc>() == DESC_SIZE);
const _: () = assert!(std::mem::align_of::<HwDesc>() == DESC_SIZE);

/// Parameters for an ordinary (non-batch) descriptor.
#[derive(Debug, Clone, Copy)]
pub struct DescParams {
    pub opcode: Opcode,
    /// Process address space ID; only the low 20 bits are encoded.
    pub pasid: u32,
    pub src: DmaAddr,
    pub dst: DmaAddr,
    pub len: u32,
    pub completion: DmaAddr,
    pub flags: DescFlags,
}

impl Default for HwDesc {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl HwDesc {
    /// An all-zero descriptor.
    pub const fn zeroed() -> Self {
        Self {
            pasid_priv: 0,
            flags_opcode: 0,
            completion_addr: 0,
            src_addr: 0,
            dst_addr: 0,
            xfer_size: 0,
            int_handle: 0,
            rsvd1: 0,
            op_specific: [0; 24],
        }
    }

    /// Zero the descriptor, then fill the fields described by `p`.
    ///
    /// No address validation is performed; the caller guarantees every
    /// address is mapped and device-visible.
    #[inline]
    pub fn prep(&mut self, p: &DescParams) {
        self.encode(p.pasid, p.opcode, p.flags, p.src.0, p.dst.0, p.len, p.completion.0);
    }

    #[inline]
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn encode(
        &mut self,
        pasid: u32,
        opcode: Opcode,
        flags: DescFlags,
        addr_f1: u64,
        addr_f2: u64,
        len: u32,
        completion: u64,
    ) {
        *self = Self::zeroed();
        // priv stays 0: user-mode descriptor.
        self.pasid_priv = pasid & PASID_MASK;
        self.flags_opcode = ((opcode as u32) << 24) | (flags.bits() & FLAGS_MASK);
        self.completion_addr = completion;
        self.src_addr = addr_f1;
        self.dst_addr = addr_f2;
        self.xfer_size = len;
    }

    pub fn pasid(&self) -> u32 {
        self.pasid_priv & PASID_MASK
    }

    pub fn is_priv(&self) -> bool {
        self.pasid_priv >> 31 != 0
    }

    /// Raw opcode byte.
    pub fn opcode_raw(&self) -> u8 {
        (self.flags_opcode >> 24) as u8
    }

    pub fn opcode(&self) -> Option<Opcode> {
        Opcode::from_u8(self.opcode_raw())
    }

    pub fn flags(&self) -> DescFlags {
        DescFlags::from_bits_retain(self.flags_opcode & FLAGS_MASK)
    }

    pub fn completion_addr(&self) -> DmaAddr {
        DmaAddr(self.completion_addr)
    }

    /// Source address, or descriptor list address for a batch.
    pub fn src_addr(&self) -> DmaAddr {
        DmaAddr(self.src_addr)
    }

    pub fn dst_addr(&self) -> DmaAddr {
        DmaAddr(self.dst_addr)
    }

    /// Transfer size, or descriptor count for a batch.
    pub fn xfer_size(&self) -> u32 {
        self.xfer_size
    }

    /// View the descriptor as the 64 bytes handed to the portal.
    pub fn as_bytes(&self) -> &[u8; DESC_SIZE] {
        // SAFETY: repr(C), 64 bytes, no padding (checked above by size).
        unsafe { &*(self as *const Self as *const [u8; DESC_SIZE]) }
    }
}

impl std::fmt::Debug for HwDesc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HwDesc")
            .field("opcode", &format_args!("{:#04x}", self.opcode_raw()))
            .field("pasid", &self.pasid())
            .field("flags", &self.flags())
            .field("src", &format_args!("{:#x}", self.src_addr))
            .field("dst", &format_args!("{:#x}", self.dst_addr))
            .field("xfer_size", &self.xfer_size)
            .field("completion", &format_args!("{:#x}", self.completion_addr))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memmove_params() -> DescParams {
        DescParams {
            opcode: Opcode::MemMove,
            pasid: 1,
            src: DmaAddr(0x1000_2000),
            dst: DmaAddr(0x2030_0000_0000),
            len: 512,
            completion: DmaAddr(0x7fff_0040),
            flags: DescFlags::RCR | DescFlags::CRAV,
        }
    }

    #[test]
    fn test_prep_fields_round_trip() {
        let p = memmove_params();
        let mut desc = HwDesc::zeroed();
        desc.prep(&p);

        assert_eq!(desc.opcode(), Some(Opcode::MemMove));
        assert_eq!(desc.pasid(), 1);
        assert!(!desc.is_priv());
        assert_eq!(desc.flags(), DescFlags::RCR | DescFlags::CRAV);
        assert_eq!(desc.src_addr(), p.src);
        assert_eq!(desc.dst_addr(), p.dst);
        assert_eq!(desc.xfer_size(), 512);
        assert_eq!(desc.completion_addr(), p.completion);
    }

    #[test]
    fn test_prep_zeroes_stale_fields() {
        let mut desc = HwDesc::zeroed();
        // Poison every byte, including reserved and op-specific ones.
        unsafe {
            std::ptr::write_bytes(&mut desc as *mut HwDesc as *mut u8, 0xa5, DESC_SIZE);
        }
        desc.prep(&memmove_params());

        let bytes = desc.as_bytes();
        // int_handle, rsvd1 and the operation-specific tail are all zero.
        assert!(bytes[36..].iter().all(|&b| b == 0));
        assert_eq!(&bytes[0..4], &1u32.to_le_bytes());
        let flags_opcode = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        assert_eq!(flags_opcode, (0x03 << 24) | 0x0c);
    }

    #[test]
    fn test_pasid_is_truncated_to_20_bits() {
        let mut p = memmove_params();
        p.pasid = 0xfff0_0001;
        let mut desc = HwDesc::zeroed();
        desc.prep(&p);
        assert_eq!(desc.pasid(), 1);
        assert!(!desc.is_priv());
    }

    #[test]
    fn test_layout() {
        assert_eq!(std::mem::size_of::<HwDesc>(), 64);
        assert_eq!(std::mem::align_of::<HwDesc>(), 64);
        let descs = [HwDesc::zeroed(), HwDesc::zeroed()];
        assert_eq!(descs.as_ptr() as usize % 64, 0);
        assert_eq!(&descs[1] as *const _ as usize - &descs[0] as *const _ as usize, 64);
    }
}
