//! Environment toggles and packaged-install path selection
use std::{env, path::PathBuf};

/// Set to `1` to force the raw-socket slow path even when a BPF object is
/// available
pub const XDP_DISABLED_VAR: &str = "MAAS_DHCP_XDP_DISABLED";

/// Snap install root, when packaged
pub const SNAP_VAR: &str = "SNAP";
/// Snap writable data root, when packaged
pub const SNAP_DATA_VAR: &str = "SNAP_DATA";

/// Whether the XDP fast path has been disabled by the operator
pub fn xdp_disabled() -> bool {
    matches!(env::var(XDP_DISABLED_VAR), Ok(v) if v == "1")
}

/// Data directory: `$SNAP_DATA` inside a snap, `/var/lib/rackdhcpd`
/// otherwise
pub fn default_data_dir() -> PathBuf {
    match env::var(SNAP_DATA_VAR) {
        Ok(dir) => PathBuf::from(dir),
        Err(_) => PathBuf::from("/var/lib/rackdhcpd"),
    }
}

/// Where the compiled XDP classifier ships: under `$SNAP` inside a snap,
/// the system path otherwise
pub fn default_bpf_object() -> PathBuf {
    match env::var(SNAP_VAR) {
        Ok(root) => PathBuf::from(root).join("usr/share/rackdhcpd/dhcp_xdp.o"),
        Err(_) => PathBuf::from("/usr/share/rackdhcpd/dhcp_xdp.o"),
    }
}
