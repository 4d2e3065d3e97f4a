//! Stable hardware identifier used to key per-device secrets.

use std::fs;
use std::path::Path;

// interface flag bits from <net/if.h>
const IFF_UP: u32 = 0x1;
const IFF_LOOPBACK: u32 = 0x8;
const IFF_POINTOPOINT: u32 = 0x10;

/// Return a stable identifier for this device.
///
/// Resolution order: the compile-time override `HANGAR_HARDWARE_ID`, then the
/// contents of the file named by the compile-time `HANGAR_HARDWARE_ID_FILE`,
/// then the MAC address of the first up, non-loopback, non-point-to-point
/// network interface (colons replaced by dashes). Returns `None` if no source
/// yields an identifier.
#[must_use]
pub fn hardware_id() -> Option<String> {
    if let Some(id) = option_env!("HANGAR_HARDWARE_ID") {
        return Some(id.to_owned());
    }
    if let Some(path) = option_env!("HANGAR_HARDWARE_ID_FILE") {
        if let Ok(contents) = fs::read_to_string(path) {
            let trimmed = contents.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_owned());
            }
        }
    }
    first_interface_address(Path::new("/sys/class/net"))
}

fn first_interface_address(netdir: &Path) -> Option<String> {
    let mut entries: Vec<_> = fs::read_dir(netdir)
        .ok()?
        .filter_map(std::result::Result::ok)
        .map(|e| e.path())
        .collect();
    entries.sort();

    for iface in entries {
        let Some(flags) = read_hex(&iface.join("flags")) else {
            continue;
        };
        if flags & IFF_UP == 0 || flags & (IFF_LOOPBACK | IFF_POINTOPOINT) != 0 {
            continue;
        }
        if let Ok(addr) = fs::read_to_string(iface.join("address")) {
            let addr = addr.trim();
            if !addr.is_empty() && addr.chars().any(|c| c != '0' && c != ':') {
                return Some(addr.replace(':', "-"));
            }
        }
    }
    None
}

fn read_hex(path: &Path) -> Option<u32> {
    let raw = fs::read_to_string(path).ok()?;
    let raw = raw.trim();
    u32::from_str_radix(raw.strip_prefix("0x").unwrap_or(raw), 16).ok()
}
