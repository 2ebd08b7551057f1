//! Boot orchestration.
//!
//! Every stage that can fail runs while boot services (and the console)
//! are still available. After [`firmware::exit::exit_boot_services`]
//! succeeds nothing may log, allocate or call firmware; the only
//! remaining step is the register setup and jump in [`handoff`].

use log::LevelFilter;
use uefi::boot;
use uefi::proto::loaded_image::LoadedImage;

use crate::config::{self, BootConfig};
use crate::elf::loader;
use crate::error::{BootError, Result};
use crate::firmware::{exit, memattr};
use crate::{handoff, payload};

/// Read the kernel command line out of the stub's own LOADED_IMAGE
/// protocol. A missing or empty command line is not an error.
fn read_cmdline() -> BootConfig {
    let loaded_image = match boot::open_protocol_exclusive::<LoadedImage>(boot::image_handle()) {
        Ok(loaded_image) => loaded_image,
        Err(err) => {
            log::warn!("failed to open LOADED_IMAGE protocol: {}", err);
            return BootConfig::default();
        }
    };

    match loaded_image.load_options_as_bytes() {
        Some(raw) => {
            let cmdline = config::cmdline_from_load_options(raw);
            log::info!("cmdline: {}", cmdline);
            BootConfig::parse(&cmdline)
        }
        None => BootConfig::default(),
    }
}

fn apply_log_level(config: &BootConfig) {
    let level = if config.debug {
        LevelFilter::Debug
    } else if config.quiet {
        LevelFilter::Warn
    } else {
        LevelFilter::Info
    };
    log::set_max_level(level);
}

/// Make the stub's own image RWX as well; self-relocation and the
/// trampoline into the kernel both execute from it.
fn remap_own_image() {
    let loaded_image = match boot::open_protocol_exclusive::<LoadedImage>(boot::image_handle()) {
        Ok(loaded_image) => loaded_image,
        Err(err) => {
            log::warn!("failed to open LOADED_IMAGE protocol: {}", err);
            return;
        }
    };
    let (base, size) = loaded_image.info();
    memattr::remap_region_rwx(base as u64, size);
}

/// Run the whole boot pipeline. Diverges into the kernel on success.
pub fn boot() -> Result<()> {
    let config = read_cmdline();
    apply_log_level(&config);

    let mut info = payload::find_payload()?;
    loader::load_payload(&mut info)?;
    remap_own_image();

    payload::install_payload_table(&info)?;

    let fdt_addr = handoff::device_tree_addr()?;
    log::info!("device tree at {:#x}", fdt_addr);
    let hart_id = handoff::boot_hart_id(fdt_addr)?;

    let entry = info.kernel_entry;
    log::info!(
        "exiting boot services and jumping to kernel at {:#x} (hart {})",
        entry,
        hart_id
    );

    let mut services = exit::UefiExitServices::new();
    exit::exit_boot_services(&mut services, |snapshot| {
        if snapshot.descriptor_count() == 0 {
            return Err(BootError::Firmware(uefi::Status::INVALID_PARAMETER));
        }
        log::debug!(
            "final memory map: {} descriptors, version {}",
            snapshot.descriptor_count(),
            snapshot.meta.desc_version
        );
        Ok(())
    })?;

    // Boot services are gone. No logging, no allocation from here on.
    #[cfg(target_arch = "riscv64")]
    unsafe {
        handoff::enter_kernel(entry, hart_id, fdt_addr)
    }
    #[cfg(not(target_arch = "riscv64"))]
    {
        let _ = (entry, hart_id, fdt_addr);
        Err(BootError::ProtocolUnavailable("kernel handoff"))
    }
}
