//! UEFI application entry point.
//!
//! The stub only has meaning as a UEFI binary; the host build compiles to
//! an empty program so the library tests can link the crate.

#![cfg_attr(target_os = "uefi", no_std)]
#![cfg_attr(target_os = "uefi", no_main)]

#[cfg(target_os = "uefi")]
mod app {
    use uefi::prelude::*;

    #[entry]
    fn main() -> Status {
        if let Err(err) = uefi::helpers::init() {
            return err.status();
        }
        log::info!("booting kernel from embedded payload");

        match efistub::stub::boot() {
            Ok(()) => Status::SUCCESS,
            Err(err) => {
                log::error!("boot failed: {}", err);
                // Leave the message on the console before giving the
                // firmware back control.
                boot::stall(10_000_000);
                err.as_status()
            }
        }
    }
}

#[cfg(not(target_os = "uefi"))]
fn main() {}
