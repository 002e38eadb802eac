use std::fs;

use crate::{Error, Result};

const OS_RELEASE: &str = "/proc/sys/kernel/osrelease";

/// The datapath side of the policy map needs the large eBPF instruction
/// limit, available from kernel 5.2.
const MIN_KERNEL: (u32, u32) = (5, 2);

pub(crate) fn ensure_large_instruction_limit() -> Result<()> {
    let release = fs::read_to_string(OS_RELEASE)?;
    if supports_large_instruction_limit(&release) {
        Ok(())
    } else {
        Err(Error::KernelSupport(format!(
            "egress gateway needs kernel {}.{} or newer, found {}",
            MIN_KERNEL.0,
            MIN_KERNEL.1,
            release.trim()
        )))
    }
}

fn supports_large_instruction_limit(release: &str) -> bool {
    let mut parts = release.trim().split(['.', '-']);
    let major = parts.next().and_then(|p| p.parse::<u32>().ok());
    let minor = parts.next().and_then(|p| p.parse::<u32>().ok());
    match (major, minor) {
        (Some(major), Some(minor)) => (major, minor) >= MIN_KERNEL,
        _ => false,
    }
}
