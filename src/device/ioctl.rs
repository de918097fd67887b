use super::event_codes::{EV_KEY, KEY_MAX};
use std::io;
use std::os::fd::RawFd;

const IOC_NRBITS: libc::c_ulong = 8;
const IOC_TYPEBITS: libc::c_ulong = 8;
const IOC_SIZEBITS: libc::c_ulong = 14;
const IOC_NRSHIFT: libc::c_ulong = 0;
const IOC_TYPESHIFT: libc::c_ulong = IOC_NRSHIFT + IOC_NRBITS;
const IOC_SIZESHIFT: libc::c_ulong = IOC_TYPESHIFT + IOC_TYPEBITS;
const IOC_DIRSHIFT: libc::c_ulong = IOC_SIZESHIFT + IOC_SIZEBITS;
const IOC_READ: libc::c_ulong = 2;

const EVIOCGNAME: libc::c_ulong = 0x06;
const EVIOCGKEY: libc::c_ulong = 0x18;
const EVIOCGBIT: libc::c_ulong = 0x20;

const KEY_BITS_LEN: usize = KEY_MAX as usize / 8 + 1;

/// A bitmap indexed by key code, as filled in by `EVIOCGBIT(EV_KEY)` and `EVIOCGKEY`.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyBits([u8; KEY_BITS_LEN]);

impl KeyBits {
    pub fn empty() -> Self {
        Self([0; KEY_BITS_LEN])
    }

    pub fn contains(&self, code: u16) -> bool {
        let code = code as usize;

        self.0
            .get(code / 8)
            .map_or(false, |byte| byte & (1 << (code % 8)) != 0)
    }

    #[cfg(test)]
    pub fn insert(&mut self, code: u16) {
        let code = code as usize;

        if let Some(byte) = self.0.get_mut(code / 8) {
            *byte |= 1 << (code % 8);
        }
    }

    /// The codes of all the bits that are set, in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u16> + '_ {
        (0..=KEY_MAX).filter(|code| self.contains(*code))
    }
}

impl std::fmt::Debug for KeyBits {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

fn ioc_read(nr: libc::c_ulong, size: usize) -> libc::c_ulong {
    (IOC_READ << IOC_DIRSHIFT)
        | (('E' as libc::c_ulong) << IOC_TYPESHIFT)
        | (nr << IOC_NRSHIFT)
        | ((size as libc::c_ulong) << IOC_SIZESHIFT)
}

/// Set the `O_NONBLOCK` flag for the specified file descriptor.
pub(crate) fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };

    if flags < 0 {
        return Err(io::Error::last_os_error());
    }

    let res = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };

    if res < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

/// Read the name of the specified device using the `EVIOCGNAME` ioctl.
pub(crate) fn read_name(fd: RawFd) -> io::Result<String> {
    const DEVICE_NAME_MAX_LEN: usize = 256;

    let mut device_name = [0u8; DEVICE_NAME_MAX_LEN];

    ioctl(
        fd,
        ioc_read(EVIOCGNAME, device_name.len()),
        device_name.as_mut_ptr(),
    )?;

    let len = device_name
        .iter()
        .position(|b| *b == 0)
        .unwrap_or(device_name.len());

    Ok(String::from_utf8_lossy(&device_name[..len]).into())
}

/// Read the keys the device can report using the `EVIOCGBIT(EV_KEY)` ioctl.
pub(crate) fn read_key_capabilities(fd: RawFd) -> io::Result<KeyBits> {
    let mut bits = KeyBits::empty();

    ioctl(
        fd,
        ioc_read(EVIOCGBIT + EV_KEY as libc::c_ulong, KEY_BITS_LEN),
        bits.0.as_mut_ptr(),
    )?;

    Ok(bits)
}

/// Read the keys that are currently held down using the `EVIOCGKEY` ioctl.
pub(crate) fn read_key_state(fd: RawFd) -> io::Result<KeyBits> {
    let mut bits = KeyBits::empty();

    ioctl(fd, ioc_read(EVIOCGKEY, KEY_BITS_LEN), bits.0.as_mut_ptr())?;

    Ok(bits)
}

fn ioctl(fd: RawFd, request: libc::c_ulong, buf: *mut u8) -> io::Result<()> {
    let res = unsafe { libc::ioctl(fd, request as _, buf) };

    if res < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}
