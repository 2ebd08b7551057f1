//! Boot configuration from the kernel command line.
//!
//! The firmware hands us the command line through the LOADED_IMAGE
//! protocol as a UTF-16 string. It is converted once, parsed once, and the
//! resulting [`BootConfig`] is passed by reference into the stages that
//! care. There is no ambient flag state.

use alloc::string::String;

/// Options recognized on the command line.
///
/// `efi=` takes a comma-separated option list, e.g. `efi=debug,novamap`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BootConfig {
    /// Raise the log level to debug (`efi=debug`)
    pub debug: bool,
    /// Suppress informational output (`quiet`)
    pub quiet: bool,
    /// Skip virtual address map preparation for runtime services (`efi=novamap`)
    pub novamap: bool,
    /// Read memory map and command line in one firmware call (`efi=nochunk`)
    pub nochunk: bool,
    /// Do not look for an initrd (`noinitrd`)
    pub noinitrd: bool,
}

impl BootConfig {
    /// Parse the whitespace-separated command line.
    ///
    /// Unknown parameters are skipped; the stub must boot on command lines
    /// written for the kernel it loads.
    pub fn parse(cmdline: &str) -> Self {
        let mut config = Self::default();

        for param in cmdline.split_whitespace() {
            if param == "--" {
                break;
            }
            match param.split_once('=') {
                None => match param {
                    "quiet" => config.quiet = true,
                    "noinitrd" => config.noinitrd = true,
                    _ => {}
                },
                Some(("efi", val)) => {
                    config.debug |= option_present(val, "debug");
                    config.novamap |= option_present(val, "novamap");
                    config.nochunk |= option_present(val, "nochunk");
                }
                Some(_) => {}
            }
        }

        config
    }
}

/// Check whether `option` appears in a comma-separated option list.
pub fn option_present(list: &str, option: &str) -> bool {
    list.split(',').any(|item| item == option)
}

/// Convert LOADED_IMAGE LoadOptions (UTF-16, NUL-terminated) to a string.
///
/// Stops at the first NUL or newline; unpaired surrogates are replaced.
pub fn cmdline_from_load_options(options: &[u8]) -> String {
    let units = options
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .take_while(|&unit| unit != 0 && unit != b'\n' as u16);

    char::decode_utf16(units)
        .map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect()
}
