//! Raw hidraw access: report-descriptor retrieval via ioctl, FIDO
//! classification by descriptor inspection, and CTAPHID report decoding.
//!
//! Classification must reject every non-authenticator HID device that
//! lives under the same `/dev/hidraw*` namespace (keyboards, mice, vendor
//! interfaces), so it requires both the FIDO usage page and the CTAPHID
//! usage to be declared by the descriptor.

use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;
use std::path::Path;

use thiserror::Error;
use tracing::debug;

/// Fixed size of a CTAPHID report on USB full speed.
pub const REPORT_LEN: usize = 64;

/// FIDO Alliance usage page (`0xF1D0`).
pub const FIDO_USAGE_PAGE: u16 = 0xF1D0;

/// CTAPHID usage within the FIDO page.
pub const FIDO_USAGE_CTAPHID: u16 = 0x01;

// CTAPHID frame markers, TYPE_INIT bit included.
const CTAPHID_MSG: u8 = 0x83;
const CTAPHID_KEEPALIVE: u8 = 0xbb;

// ISO 7816 "conditions not satisfied" status word — the U2F-era touch
// required signal.
const SW_CONDITIONS_NOT_SATISFIED: [u8; 2] = [0x69, 0x85];

// CTAP2 keep-alive status: waiting for user presence.
const KEEPALIVE_UP_NEEDED: u8 = 0x02;

// From linux/hid.h.
const HID_MAX_DESCRIPTOR_SIZE: usize = 4096;

#[derive(Debug, Error)]
pub enum HidError {
    #[error("cannot open device: {0}")]
    Open(#[from] io::Error),
    #[error("descriptor ioctl failed: {0}")]
    Ioctl(#[from] nix::errno::Errno),
    #[error("kernel reported descriptor size {0}")]
    DescriptorSize(i32),
}

/// Mirrors `struct hidraw_report_descriptor` from `linux/hidraw.h`.
#[repr(C)]
pub struct HidrawReportDescriptor {
    size: u32,
    value: [u8; HID_MAX_DESCRIPTOR_SIZE],
}

nix::ioctl_read!(hidraw_desc_size, b'H', 0x01, libc::c_int);
nix::ioctl_read!(hidraw_descriptor, b'H', 0x02, HidrawReportDescriptor);

/// Fetch the raw HID report descriptor for a hidraw node.
pub fn read_report_descriptor(path: &Path) -> Result<Vec<u8>, HidError> {
    let file = File::open(path)?;
    let fd = file.as_raw_fd();

    let mut size: libc::c_int = 0;
    // SAFETY: fd is a live hidraw descriptor and the pointer outlives the call.
    unsafe { hidraw_desc_size(fd, &mut size) }?;
    if size <= 0 || size as usize > HID_MAX_DESCRIPTOR_SIZE {
        return Err(HidError::DescriptorSize(size));
    }

    let mut descriptor = HidrawReportDescriptor {
        size: size as u32,
        value: [0; HID_MAX_DESCRIPTOR_SIZE],
    };
    // SAFETY: the struct layout matches the kernel's and size is validated.
    unsafe { hidraw_descriptor(fd, &mut descriptor) }?;

    Ok(descriptor.value[..size as usize].to_vec())
}

/// `true` when the hidraw node at `path` is a FIDO authenticator.
///
/// Any failure reading or fetching the descriptor classifies as "not a
/// match" — an unreadable device is never worth a task.
pub fn is_fido_device(path: &Path) -> bool {
    match read_report_descriptor(path) {
        Ok(descriptor) => descriptor_declares_fido(&descriptor),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "descriptor read failed, not a FIDO device");
            false
        }
    }
}

/// Scan a report descriptor for the FIDO usage page (global item) and the
/// CTAPHID usage (local item).  Both must appear for the device to qualify.
pub fn descriptor_declares_fido(descriptor: &[u8]) -> bool {
    let mut fido_page = false;
    let mut ctap_usage = false;

    let mut i = 0;
    while i < descriptor.len() {
        let prefix = descriptor[i];

        // Long item: one size byte, one tag byte, then the payload.
        if prefix == 0xfe {
            let Some(&len) = descriptor.get(i + 1) else {
                break;
            };
            i += 3 + len as usize;
            continue;
        }

        let size = match prefix & 0x03 {
            3 => 4,
            n => n as usize,
        };
        let item_type = (prefix >> 2) & 0x03;
        let tag = prefix >> 4;

        let Some(data) = descriptor.get(i + 1..i + 1 + size) else {
            break;
        };
        let value = data
            .iter()
            .rev()
            .fold(0u32, |acc, &b| (acc << 8) | u32::from(b));

        match (item_type, tag) {
            // Global: Usage Page.
            (1, 0) => {
                if value == u32::from(FIDO_USAGE_PAGE) {
                    fido_page = true;
                }
            }
            // Local: Usage.  A four-byte usage carries the page in its
            // upper half; shorter ones inherit the current page.
            (2, 0) => {
                let matches = if size == 4 {
                    value == (u32::from(FIDO_USAGE_PAGE) << 16) | u32::from(FIDO_USAGE_CTAPHID)
                } else {
                    value == u32::from(FIDO_USAGE_CTAPHID)
                };
                if matches {
                    ctap_usage = true;
                }
            }
            _ => {}
        }

        i += 1 + size;
    }

    fido_page && ctap_usage
}

/// `true` when a CTAPHID report indicates the key is waiting for a touch.
///
/// Byte 4 of an initialization packet is the command; the payload starts
/// at byte 7 (after the two-byte length).  Two frames qualify:
/// a `MSG` response carrying SW `6985`, or a keep-alive with status
/// "user presence needed".
pub fn report_signals_touch(report: &[u8]) -> bool {
    if report.len() < 9 {
        return false;
    }
    match report[4] {
        CTAPHID_MSG => report[7..9] == SW_CONDITIONS_NOT_SATISFIED,
        CTAPHID_KEEPALIVE => report[7] == KEEPALIVE_UP_NEEDED,
        _ => false,
    }
}
