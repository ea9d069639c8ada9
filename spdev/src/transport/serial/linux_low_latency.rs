//! FTDI and CH34x adapters buffer received bytes for up to 16 ms unless the
//! port is switched to low latency mode. With short SCPI replies that delay
//! dominates every query.

use std::mem;
use std::os::raw::c_schar;
use std::os::unix::io::AsRawFd;

use anyhow::anyhow;
use libc::{c_char, c_int, c_short, c_uint, c_ulong};

/// `ASYNC_LOW_LATENCY` bit of `serial_struct::flags`.
const ASYNC_LOW_LATENCY: c_int = 1 << 13;

/// Mirror of the kernel's `struct serial_struct`.
#[repr(C)]
struct SerialStruct {
    typ: c_int,
    line: c_int,
    port: c_uint,
    irq: c_int,
    flags: c_int,
    xmit_fifo_size: c_int,
    custom_divisor: c_int,
    baud_base: c_int,
    close_delay: c_short,
    io_type: c_schar,
    reserved_char: c_schar,
    hub6: c_int,
    closing_wait: c_short,
    closing_wait2: c_short,
    iomem_base: *mut c_char,
    iomem_reg_shift: c_short,
    port_high: c_uint,
    iomap_base: c_ulong,
}

pub(crate) fn apply_low_latency<T: AsRawFd>(port: &T) -> crate::Result<()> {
    let fd = port.as_raw_fd();

    // SAFETY: `SerialStruct` is plain old data matching the kernel layout and
    // the pointer is valid for the duration of both calls.
    unsafe {
        let mut info: SerialStruct = mem::zeroed();
        let info_ptr = &mut info as *mut SerialStruct;
        if libc::ioctl(fd, libc::TIOCGSERIAL, info_ptr) != 0 {
            return Err(crate::Error::transport(anyhow!("Cannot get serial info struct")));
        }
        if info.flags & ASYNC_LOW_LATENCY != 0 {
            return Ok(());
        }
        info.flags |= ASYNC_LOW_LATENCY;
        if libc::ioctl(fd, libc::TIOCSSERIAL, info_ptr) != 0 {
            return Err(crate::Error::transport(anyhow!("Cannot set low latency")));
        }
    }

    Ok(())
}
