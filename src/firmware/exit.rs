//! Boot services exit, with the single retry the UEFI spec mandates.
//!
//! ExitBootServices may fail with INVALID_PARAMETER when the memory map
//! changed between GetMemoryMap and the exit call. Per UEFI 2.x §7.4 the
//! map must then be re-fetched into the same buffer (no allocation is
//! allowed any more) and the exit retried exactly once. Everything else
//! is fatal.
//!
//! The firmware calls go through [`ExitServices`] so the retry protocol
//! can be driven against a scripted firmware in the unit tests.

use core::ptr::NonNull;

use uefi::Status;

use crate::error::{BootError, Result};

/// Extra descriptor slots of headroom when sizing the map buffer; the
/// firmware may grow the map between the probe and the real fetch.
pub const MMAP_NR_SLACK_SLOTS: usize = 8;

/// Shape of one memory map fetch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryMapMeta {
    /// Bytes used by the map (required bytes when the probe fails with
    /// BUFFER_TOO_SMALL)
    pub map_size: usize,
    /// Stride between descriptors; not necessarily size_of::<MemoryDescriptor>()
    pub desc_size: usize,
    /// Descriptor layout version
    pub desc_version: u32,
    /// Key identifying this snapshot; consumed by ExitBootServices
    pub map_key: usize,
}

/// A captured memory map handed to the map-processing callback.
pub struct MemoryMapSnapshot<'a> {
    pub buffer: &'a [u8],
    pub meta: MemoryMapMeta,
}

impl MemoryMapSnapshot<'_> {
    pub fn descriptor_count(&self) -> usize {
        if self.meta.desc_size == 0 {
            return 0;
        }
        self.meta.map_size / self.meta.desc_size
    }
}

/// The firmware operations the exit sequence depends on.
pub trait ExitServices {
    /// Wraps GetMemoryMap. With `None` the call probes the required size
    /// into `meta.map_size` and must return BUFFER_TOO_SMALL.
    fn get_memory_map(&mut self, buffer: Option<&mut [u8]>, meta: &mut MemoryMapMeta) -> Status;

    /// Wraps ExitBootServices for the stub's own image handle.
    fn exit_boot_services(&mut self, map_key: usize) -> Status;

    /// Pool allocation for the map buffer.
    fn allocate(&mut self, size: usize) -> Result<NonNull<u8>>;

    /// Release a buffer from [`ExitServices::allocate`].
    ///
    /// # Safety
    ///
    /// `ptr` must come from `allocate` on the same instance and must not
    /// be used afterwards. Must not be called once the first exit attempt
    /// has been issued.
    unsafe fn free(&mut self, ptr: NonNull<u8>);
}

/// Snapshot the memory map, run `process` over it and leave boot services.
///
/// State machine: MapCaptured -> Processed -> Exited, with one permitted
/// retry edge on a stale map key. After the first exit attempt the map
/// buffer is never freed; the firmware heap may already be torn down.
pub fn exit_boot_services<S, F>(services: &mut S, mut process: F) -> Result<()>
where
    S: ExitServices,
    F: FnMut(&MemoryMapSnapshot<'_>) -> Result<()>,
{
    let mut meta = MemoryMapMeta::default();

    // Size the buffer with slack for descriptors the firmware may add
    // between this probe and the fetch below.
    let status = services.get_memory_map(None, &mut meta);
    if status != Status::BUFFER_TOO_SMALL {
        log::error!("memory map size probe returned {:?}", status);
        return Err(BootError::Firmware(status));
    }
    let capacity = meta.map_size + MMAP_NR_SLACK_SLOTS * meta.desc_size;
    let buffer = services.allocate(capacity)?;
    // One slice per use; the buffer outlives boot services on purpose.
    let buffer_bytes =
        |ptr: NonNull<u8>| unsafe { core::slice::from_raw_parts_mut(ptr.as_ptr(), capacity) };

    // MapCaptured
    let status = services.get_memory_map(Some(buffer_bytes(buffer)), &mut meta);
    if status.is_error() {
        log::error!("failed to capture memory map: {:?}", status);
        unsafe { services.free(buffer) };
        return Err(BootError::Firmware(status));
    }

    // Processed
    if let Err(err) = process(&MemoryMapSnapshot {
        buffer: buffer_bytes(buffer),
        meta,
    }) {
        unsafe { services.free(buffer) };
        return Err(err);
    }

    // Exited. The buffer is no longer freeable past this point regardless
    // of the outcome.
    let status = services.exit_boot_services(meta.map_key);
    if !status.is_error() {
        return Ok(());
    }
    if status != Status::INVALID_PARAMETER {
        return Err(BootError::Firmware(status));
    }

    // The map key went stale. Re-fetch into the same buffer, re-process,
    // and try exactly once more; a second stale report is fatal.
    let status = services.get_memory_map(Some(buffer_bytes(buffer)), &mut meta);
    if status.is_error() {
        return Err(BootError::Firmware(status));
    }
    process(&MemoryMapSnapshot {
        buffer: buffer_bytes(buffer),
        meta,
    })?;
    let status = services.exit_boot_services(meta.map_key);
    if status.is_error() {
        return Err(BootError::Firmware(status));
    }
    Ok(())
}

/// [`ExitServices`] backed by the raw boot services table.
///
/// The safe uefi wrappers hide the map key, which this sequence must own,
/// so the two calls go through the raw function pointers.
pub struct UefiExitServices {
    image_handle: uefi_raw::Handle,
}

impl UefiExitServices {
    pub fn new() -> Self {
        Self {
            image_handle: uefi::boot::image_handle().as_ptr(),
        }
    }

    fn raw(&self) -> Result<NonNull<uefi_raw::table::boot::BootServices>> {
        let st = uefi::table::system_table_raw()
            .ok_or(BootError::ProtocolUnavailable("system table unavailable"))?;
        NonNull::new(unsafe { st.as_ref() }.boot_services)
            .ok_or(BootError::ProtocolUnavailable("boot services unavailable"))
    }
}

impl ExitServices for UefiExitServices {
    fn get_memory_map(&mut self, buffer: Option<&mut [u8]>, meta: &mut MemoryMapMeta) -> Status {
        let bs = match self.raw() {
            Ok(bs) => bs,
            Err(_) => return Status::NOT_READY,
        };
        let (map_ptr, mut map_size) = match buffer {
            Some(buf) => (
                buf.as_mut_ptr() as *mut uefi_raw::table::boot::MemoryDescriptor,
                buf.len(),
            ),
            None => (core::ptr::null_mut(), 0),
        };

        let mut map_key = 0usize;
        let mut desc_size = 0usize;
        let mut desc_version = 0u32;
        let status = unsafe {
            (bs.as_ref().get_memory_map)(
                &mut map_size,
                map_ptr,
                &mut map_key,
                &mut desc_size,
                &mut desc_version,
            )
        };

        meta.map_size = map_size;
        meta.desc_size = desc_size;
        meta.desc_version = desc_version;
        meta.map_key = map_key;
        status
    }

    fn exit_boot_services(&mut self, map_key: usize) -> Status {
        match self.raw() {
            Ok(bs) => unsafe { (bs.as_ref().exit_boot_services)(self.image_handle, map_key) },
            Err(_) => Status::NOT_READY,
        }
    }

    fn allocate(&mut self, size: usize) -> Result<NonNull<u8>> {
        uefi::boot::allocate_pool(uefi::boot::MemoryType::LOADER_DATA, size).map_err(|err| {
            log::error!("failed to allocate {} bytes for the memory map: {}", size, err);
            BootError::OutOfResources
        })
    }

    unsafe fn free(&mut self, ptr: NonNull<u8>) {
        if let Err(err) = uefi::boot::free_pool(ptr) {
            log::warn!("failed to free memory map buffer: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;
    use alloc::vec::Vec;

    const DESC_SIZE: usize = 48;

    /// Scripted firmware: a fixed required map size and a queue of
    /// ExitBootServices results.
    struct ScriptedFirmware {
        required_size: usize,
        exit_script: Vec<Status>,
        exit_calls: usize,
        fetches: usize,
        allocations: usize,
        frees: usize,
        freed_after_exit: bool,
        alloc_sizes: Vec<usize>,
        fetch_ptrs: Vec<*mut u8>,
        next_map_key: usize,
    }

    impl ScriptedFirmware {
        fn new(exit_script: Vec<Status>) -> Self {
            Self {
                required_size: 4 * DESC_SIZE,
                exit_script,
                exit_calls: 0,
                fetches: 0,
                allocations: 0,
                frees: 0,
                freed_after_exit: false,
                alloc_sizes: Vec::new(),
                fetch_ptrs: Vec::new(),
                next_map_key: 100,
            }
        }
    }

    impl ExitServices for ScriptedFirmware {
        fn get_memory_map(
            &mut self,
            buffer: Option<&mut [u8]>,
            meta: &mut MemoryMapMeta,
        ) -> Status {
            meta.desc_size = DESC_SIZE;
            meta.desc_version = 1;
            match buffer {
                None => {
                    meta.map_size = self.required_size;
                    Status::BUFFER_TOO_SMALL
                }
                Some(buf) => {
                    assert!(buf.len() >= self.required_size);
                    self.fetches += 1;
                    self.fetch_ptrs.push(buf.as_mut_ptr());
                    meta.map_size = self.required_size;
                    meta.map_key = self.next_map_key;
                    self.next_map_key += 1;
                    Status::SUCCESS
                }
            }
        }

        fn exit_boot_services(&mut self, _map_key: usize) -> Status {
            let status = self.exit_script[self.exit_calls];
            self.exit_calls += 1;
            status
        }

        fn allocate(&mut self, size: usize) -> Result<NonNull<u8>> {
            self.allocations += 1;
            self.alloc_sizes.push(size);
            let mut backing = vec![0u8; size].into_boxed_slice();
            let ptr = backing.as_mut_ptr();
            core::mem::forget(backing);
            Ok(NonNull::new(ptr).unwrap())
        }

        unsafe fn free(&mut self, _ptr: NonNull<u8>) {
            self.frees += 1;
            if self.exit_calls > 0 {
                self.freed_after_exit = true;
            }
        }
    }

    #[test]
    fn test_clean_exit_on_first_attempt() {
        let mut fw = ScriptedFirmware::new(vec![Status::SUCCESS]);
        let mut processed = 0;
        let result = exit_boot_services(&mut fw, |snapshot| {
            assert_eq!(snapshot.descriptor_count(), 4);
            processed += 1;
            Ok(())
        });
        assert!(result.is_ok());
        assert_eq!(fw.exit_calls, 1);
        assert_eq!(fw.fetches, 1);
        assert_eq!(processed, 1);
        assert_eq!(fw.frees, 0);
    }

    #[test]
    fn test_buffer_has_slack_headroom() {
        let mut fw = ScriptedFirmware::new(vec![Status::SUCCESS]);
        exit_boot_services(&mut fw, |_| Ok(())).unwrap();
        // The allocation must be sized for the probe result plus the slack
        // slots, not just the probe result.
        assert_eq!(fw.allocations, 1);
        assert_eq!(
            fw.alloc_sizes[0],
            fw.required_size + MMAP_NR_SLACK_SLOTS * DESC_SIZE
        );
    }

    #[test]
    fn test_stale_map_retries_once_with_same_buffer() {
        let mut fw =
            ScriptedFirmware::new(vec![Status::INVALID_PARAMETER, Status::SUCCESS]);
        let mut processed = 0;
        let result = exit_boot_services(&mut fw, |_| {
            processed += 1;
            Ok(())
        });
        assert!(result.is_ok());
        assert_eq!(fw.exit_calls, 2);
        assert_eq!(fw.fetches, 2);
        assert_eq!(processed, 2);
        // No second allocation and the re-fetch reused the same buffer.
        assert_eq!(fw.allocations, 1);
        assert_eq!(fw.fetch_ptrs[0], fw.fetch_ptrs[1]);
        assert_eq!(fw.frees, 0);
    }

    #[test]
    fn test_second_stale_map_is_fatal() {
        let mut fw = ScriptedFirmware::new(vec![
            Status::INVALID_PARAMETER,
            Status::INVALID_PARAMETER,
        ]);
        let result = exit_boot_services(&mut fw, |_| Ok(()));
        assert_eq!(
            result,
            Err(BootError::Firmware(Status::INVALID_PARAMETER))
        );
        // The retry budget is one: exactly two exit calls, never three.
        assert_eq!(fw.exit_calls, 2);
        assert_eq!(fw.frees, 0);
    }

    #[test]
    fn test_other_exit_failure_is_not_retried() {
        let mut fw = ScriptedFirmware::new(vec![Status::UNSUPPORTED]);
        let result = exit_boot_services(&mut fw, |_| Ok(()));
        assert_eq!(result, Err(BootError::Firmware(Status::UNSUPPORTED)));
        assert_eq!(fw.exit_calls, 1);
        assert_eq!(fw.fetches, 1);
        assert_eq!(fw.frees, 0);
    }

    #[test]
    fn test_process_failure_before_exit_frees_buffer() {
        let mut fw = ScriptedFirmware::new(vec![]);
        let result = exit_boot_services(&mut fw, |_| Err(BootError::OutOfResources));
        assert_eq!(result, Err(BootError::OutOfResources));
        assert_eq!(fw.exit_calls, 0);
        assert_eq!(fw.frees, 1);
        assert!(!fw.freed_after_exit);
    }

    #[test]
    fn test_process_failure_on_retry_does_not_free() {
        let mut fw = ScriptedFirmware::new(vec![Status::INVALID_PARAMETER]);
        let mut calls = 0;
        let result = exit_boot_services(&mut fw, |_| {
            calls += 1;
            if calls == 2 {
                Err(BootError::OutOfResources)
            } else {
                Ok(())
            }
        });
        assert_eq!(result, Err(BootError::OutOfResources));
        assert_eq!(fw.exit_calls, 1);
        // Ownership of the buffer ended at the first exit attempt.
        assert_eq!(fw.frees, 0);
    }

    #[test]
    fn test_failed_probe_is_fatal() {
        struct BrokenProbe;
        impl ExitServices for BrokenProbe {
            fn get_memory_map(
                &mut self,
                _buffer: Option<&mut [u8]>,
                _meta: &mut MemoryMapMeta,
            ) -> Status {
                Status::DEVICE_ERROR
            }
            fn exit_boot_services(&mut self, _map_key: usize) -> Status {
                unreachable!()
            }
            fn allocate(&mut self, _size: usize) -> Result<NonNull<u8>> {
                unreachable!()
            }
            unsafe fn free(&mut self, _ptr: NonNull<u8>) {
                unreachable!()
            }
        }
        let result = exit_boot_services(&mut BrokenProbe, |_| Ok(()));
        assert_eq!(result, Err(BootError::Firmware(Status::DEVICE_ERROR)));
    }
}
