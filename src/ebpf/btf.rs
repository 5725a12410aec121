//! `struct rq` layout lookup in kernel BTF.
//!
//! The probe reads `nr_running` at a byte offset set at load time. That offset
//! moves with kernel config (a debug `raw_spinlock_t` is larger than the
//! stock one), so it is taken from the running kernel's type info whenever
//! that is available.

use std::path::Path;

use btf_rs::{Btf, Type};
use rqtap_common::DEFAULT_NR_RUNNING_OFFSET;
use tracing::{info, warn};

pub const VMLINUX_BTF: &str = "/sys/kernel/btf/vmlinux";

/// Offset the probe should read `rq->nr_running` at.
///
/// A configured offset always wins. Otherwise it is read from the BTF at
/// `btf_path`, and the built-in default is used only when that lookup fails.
pub fn nr_running_offset(configured: Option<u32>, btf_path: &Path) -> u32 {
    if let Some(offset) = configured {
        info!("Using configured nr_running offset {}", offset);
        return offset;
    }

    match member_offset(btf_path, "rq", "nr_running") {
        Ok(offset) => {
            info!(
                "struct rq.nr_running at offset {} (from {})",
                offset,
                btf_path.display()
            );
            offset
        }
        Err(e) => {
            warn!(
                "Could not resolve struct rq.nr_running from {}: {}",
                btf_path.display(),
                e
            );
            warn!(
                "Falling back to offset {}; set RQTAP_NR_RUNNING_OFFSET if samples look wrong",
                DEFAULT_NR_RUNNING_OFFSET
            );
            DEFAULT_NR_RUNNING_OFFSET
        }
    }
}

/// Byte offset of `member` inside `struct name`, read from a raw BTF file
pub fn member_offset(btf_path: &Path, name: &str, member: &str) -> Result<u32, String> {
    if !btf_path.exists() {
        return Err("BTF not available".to_string());
    }
    let btf = Btf::from_file(btf_path).map_err(|e| e.to_string())?;
    let types = btf.resolve_types_by_name(name).map_err(|e| e.to_string())?;

    let Some(layout) = types.into_iter().find_map(|ty| match ty {
        Type::Struct(layout) => Some(layout),
        _ => None,
    }) else {
        return Err(format!("struct {} not found", name));
    };

    for field in layout.members.iter() {
        if btf.resolve_name(field).map_err(|e| e.to_string())? != member {
            continue;
        }
        let bits = field.bit_offset();
        if bits % 8 != 0 {
            return Err(format!("{}.{} is not byte aligned", name, member));
        }
        return Ok(bits / 8);
    }

    Err(format!("struct {} has no member {}", name, member))
}
