use crate::IFACE_NAME;
use anyhow::{Context as _, Result, bail};
use ip_packet::{IpPacket, IpPacketBuf};
use std::fs::OpenOptions;
use std::io;
use std::os::fd::{AsRawFd as _, OwnedFd};
use std::os::unix::fs::OpenOptionsExt as _;

const TUNSETIFF: libc::c_ulong = 0x4004_54ca;

/// The slice of `struct ifreq` we actually use: the name and the flags member
/// of the request union, padded out to the kernel's expected size.
#[repr(C)]
struct SetIffRequest {
    ifr_name: [libc::c_uchar; libc::IFNAMSIZ],
    ifr_flags: libc::c_short,
    _union_padding: [u8; 22],
}

impl SetIffRequest {
    fn for_name(name: &str) -> Result<Self> {
        let bytes = name.as_bytes();

        if bytes.len() >= libc::IFNAMSIZ {
            bail!("interface name '{name}' is too long");
        }

        let mut ifr_name = [0; libc::IFNAMSIZ];
        ifr_name[..bytes.len()].copy_from_slice(bytes);

        Ok(Self {
            ifr_name,
            ifr_flags: (libc::IFF_TUN | libc::IFF_NO_PI) as libc::c_short,
            _union_padding: [0; 22],
        })
    }
}

/// Opens `/dev/net/tun` non-blocking and attaches it to our interface name.
pub(crate) fn open() -> Result<(OwnedFd, String)> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open("/dev/net/tun")
        .context("Failed to open /dev/net/tun; is the tun module loaded?")?;

    let mut request = SetIffRequest::for_name(IFACE_NAME)?;

    // Safety: the fd is open and `request` outlives the call.
    if unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF as _, &mut request) } < 0 {
        return Err(io::Error::last_os_error())
            .with_context(|| format!("Failed to attach TUN device '{IFACE_NAME}'"));
    }

    Ok((OwnedFd::from(file), IFACE_NAME.to_owned()))
}

/// Reads one packet into the pooled buffer.
pub(crate) fn read(fd: &OwnedFd, dst: &mut IpPacketBuf) -> io::Result<usize> {
    let dst = dst.buf();

    // Safety: the device task keeps the fd open for as long as it reads.
    match unsafe { libc::read(fd.as_raw_fd(), dst.as_mut_ptr() as _, dst.len()) } {
        -1 => Err(io::Error::last_os_error()),
        n => Ok(n as usize),
    }
}

/// Writes one packet; Linux TUN devices take the raw IP bytes as-is.
pub(crate) fn write(fd: &OwnedFd, packet: &IpPacket) -> io::Result<usize> {
    let buf = packet.packet();

    // Safety: the device task keeps the fd open for as long as it writes.
    match unsafe { libc::write(fd.as_raw_fd(), buf.as_ptr() as _, buf.len() as _) } {
        -1 => Err(io::Error::last_os_error()),
        n => Ok(n as usize),
    }
}
