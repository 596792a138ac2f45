use anyhow::{Context as _, Result, bail};
use ip_packet::{IpPacket, IpPacketBuf};
use libc::{
    AF_INET, AF_INET6, AF_SYS_CONTROL, AF_SYSTEM, F_GETFL, F_SETFL, O_NONBLOCK, PF_SYSTEM,
    SOCK_DGRAM, SYSPROTO_CONTROL, c_uchar, connect, fcntl, iovec, readv, sockaddr_ctl, socket,
    writev,
};
use std::io;
use std::os::fd::{AsRawFd as _, FromRawFd as _, OwnedFd, RawFd};

const CTRL_NAME: &[u8] = b"com.apple.net.utun_control";
const CTLIOCGINFO: libc::c_ulong = 0x0000_0000_c064_4e03;

/// macOS prepends every packet on a utun device with the address family.
const PREFIX_LEN: usize = 4;

#[repr(C)]
struct CtlInfo {
    ctl_id: u32,
    ctl_name: [c_uchar; 96],
}

/// Opens the next free utun device via the kernel control socket.
pub(crate) fn open() -> Result<(OwnedFd, String)> {
    let fd = match unsafe { socket(PF_SYSTEM, SOCK_DGRAM, SYSPROTO_CONTROL) } {
        -1 => {
            return Err(anyhow::Error::new(io::Error::last_os_error()))
                .context("Failed to create utun control socket");
        }
        fd => fd,
    };

    let mut info = CtlInfo {
        ctl_id: 0,
        ctl_name: [0; 96],
    };
    info.ctl_name[..CTRL_NAME.len()].copy_from_slice(CTRL_NAME);

    if unsafe { libc::ioctl(fd, CTLIOCGINFO, &mut info) } < 0 {
        unsafe { libc::close(fd) };
        bail!(
            "Failed to query utun control id: {}",
            io::Error::last_os_error()
        );
    }

    // sc_unit 0 lets the kernel pick the next free utun index.
    let addr = sockaddr_ctl {
        sc_len: std::mem::size_of::<sockaddr_ctl>() as _,
        sc_family: AF_SYSTEM as _,
        ss_sysaddr: AF_SYS_CONTROL as _,
        sc_id: info.ctl_id,
        sc_unit: 0,
        sc_reserved: [0; 5],
    };

    if unsafe {
        connect(
            fd,
            &addr as *const sockaddr_ctl as _,
            std::mem::size_of::<sockaddr_ctl>() as _,
        )
    } < 0
    {
        unsafe { libc::close(fd) };
        bail!(
            "Failed to connect utun socket: {}",
            io::Error::last_os_error()
        );
    }

    set_non_blocking(fd).context("Failed to make utun device non-blocking")?;

    let name = utun_name(fd)?;

    // Safety: nothing else owns the fd at this point.
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };

    Ok((fd, name))
}

fn utun_name(fd: RawFd) -> Result<String> {
    const UTUN_OPT_IFNAME: libc::c_int = 2;

    let mut name = [0u8; libc::IFNAMSIZ];
    let mut len = name.len() as libc::socklen_t;

    if unsafe {
        libc::getsockopt(
            fd,
            SYSPROTO_CONTROL,
            UTUN_OPT_IFNAME,
            name.as_mut_ptr() as _,
            &mut len,
        )
    } < 0
    {
        bail!("Failed to read utun name: {}", io::Error::last_os_error());
    }

    let name = std::str::from_utf8(&name[..len as usize - 1])
        .context("utun name is not valid UTF-8")?
        .to_owned();

    Ok(name)
}

fn set_non_blocking(fd: RawFd) -> io::Result<()> {
    match unsafe { fcntl(fd, F_GETFL) } {
        -1 => Err(io::Error::last_os_error()),
        flags => match unsafe { fcntl(fd, F_SETFL, flags | O_NONBLOCK) } {
            -1 => Err(io::Error::last_os_error()),
            _ => Ok(()),
        },
    }
}

/// Reads one packet, stripping the 4-byte protocol prefix.
pub(crate) fn read(fd: &OwnedFd, dst: &mut IpPacketBuf) -> io::Result<usize> {
    let mut prefix = [0u8; PREFIX_LEN];
    let dst = dst.buf();

    let mut iov = [
        iovec {
            iov_base: prefix.as_mut_ptr() as _,
            iov_len: prefix.len(),
        },
        iovec {
            iov_base: dst.as_mut_ptr() as _,
            iov_len: dst.len(),
        },
    ];

    // Safety: the device task keeps the fd open for as long as it reads.
    match unsafe { readv(fd.as_raw_fd(), iov.as_mut_ptr(), iov.len() as _) } {
        -1 => Err(io::Error::last_os_error()),
        0..=3 => Ok(0),
        n => Ok(n as usize - PREFIX_LEN),
    }
}

/// Writes one packet, prepending the 4-byte protocol prefix.
pub(crate) fn write(fd: &OwnedFd, packet: &IpPacket) -> io::Result<usize> {
    let af = match packet {
        IpPacket::Ipv4(_) => AF_INET,
        IpPacket::Ipv6(_) => AF_INET6,
    };
    let prefix = [0u8, 0, 0, af as u8];
    let buf = packet.packet();

    let iov = [
        iovec {
            iov_base: prefix.as_ptr() as _,
            iov_len: prefix.len(),
        },
        iovec {
            iov_base: buf.as_ptr() as _,
            iov_len: buf.len(),
        },
    ];

    // Safety: the device task keeps the fd open for as long as it writes.
    match unsafe { writev(fd.as_raw_fd(), iov.as_ptr(), iov.len() as _) } {
        -1 => Err(io::Error::last_os_error()),
        n => Ok(n as usize),
    }
}
