//! Memory barrier and portal-write macros for DSA work queues.
//!
//! These macros provide the ordering guarantees and the two submission
//! instructions used to hand a descriptor to the device through a portal.

/// Order prior stores before a descriptor submission.
///
/// Descriptors, batch lists and completion-record resets live in ordinary
/// write-back memory; they must be globally visible before the device is
/// told to read them. On x86_64 this is `sfence`, the user-space equivalent
/// of the kernel's `wmb()` in `idxd_submit_desc()`.
macro_rules! wmb {
    () => {
        #[cfg(target_arch = "x86_64")]
        unsafe {
            std::arch::x86_64::_mm_sfence();
        }
        #[cfg(target_arch = "aarch64")]
        unsafe {
            std::arch::asm!("dsb st", options(nostack, preserves_flags));
        }
        #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
        {
            std::sync::atomic::fence(std::sync::atomic::Ordering::Release);
        }
    };
}

/// Load barrier after observing a non-zero completion status.
///
/// Subsequent reads of the completion record (fault address, bytes
/// completed) and of destination buffers must see the device's writes.
/// x86_64 only needs a compiler barrier (TSO orders load-load).
macro_rules! dma_from_device_barrier {
    () => {
        #[cfg(target_arch = "aarch64")]
        unsafe {
            std::arch::asm!("dmb ld", options(nostack, preserves_flags));
        }
        #[cfg(target_arch = "x86_64")]
        {
            std::sync::atomic::compiler_fence(std::sync::atomic::Ordering::Acquire);
        }
        #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
        {
            std::sync::atomic::fence(std::sync::atomic::Ordering::Acquire);
        }
    };
}

/// Write 64 bytes to a dedicated-queue portal as a single posted write.
///
/// Encoded as raw bytes (`movdir64b (%rdx), %rax`) like the kernel's
/// `movdir64b()` helper so older assemblers accept it.
///
/// # Safety
/// - `$portal` must be a 64-byte aligned pointer into a mapped WQ portal
/// - `$desc` must point to 64 readable bytes
#[cfg(target_arch = "x86_64")]
macro_rules! movdir64b {
    ($portal:expr, $desc:expr) => {
        unsafe {
            std::arch::asm!(
                ".byte 0x66, 0x0f, 0x38, 0xf8, 0x02",
                in("rax") $portal,
                in("rdx") $desc,
                options(nostack, preserves_flags),
            );
        }
    };
}

#[cfg(not(target_arch = "x86_64"))]
macro_rules! movdir64b {
    ($portal:expr, $desc:expr) => {
        unsafe {
            let src = $desc as *const u64;
            let dst = $portal as *mut u64;
            for i in 0..8 {
                std::ptr::write_volatile(dst.add(i), *src.add(i));
            }
        }
    };
}

/// Enqueue 64 bytes to a shared-queue portal.
///
/// Evaluates to `true` when the device accepted the descriptor and `false`
/// when it asked for a retry (ZF set: queue momentarily full).
/// Encoded as raw bytes (`enqcmd (%rdx), %rax`).
///
/// # Safety
/// Same requirements as [`movdir64b!`].
#[cfg(target_arch = "x86_64")]
macro_rules! enqcmd {
    ($portal:expr, $desc:expr) => {{
        let retry: u8;
        unsafe {
            std::arch::asm!(
                ".byte 0xf2, 0x0f, 0x38, 0xf8, 0x02",
                "setz {retry}",
                retry = out(reg_byte) retry,
                in("rax") $portal,
                in("rdx") $desc,
                options(nostack),
            );
        }
        retry == 0
    }};
}
