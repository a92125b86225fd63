use crate::ctx::Udev;
use crate::device::Device;
use crate::ebpf::BpfFilter;
use crate::hash::{bloom64, hash32};
use crate::wire::{self, NetlinkHeader};
use crate::Cow;
use crate::{SubsystemFilter, TagFilter};

use log::debug;
use neli::consts::socket::NlFamily;
use neli::socket::NlSocket;
use neli::utils::Groups;

use std::ffi::OsStr;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, RawFd};

const KERNEL_GROUP: u32 = 1;
const UDEV_GROUP: u32 = 2;

/// Matches the largest uevent the kernel will emit.
const RECV_BUF_SIZE: usize = 8192;

/// Multicast source of device events. `None` in the APIs taking an
/// `Option<EventSource>` selects a sink that never receives multicast
/// traffic and can only be addressed by unicast.
///
/// Applications should usually not subscribe to `Kernel` events: those
/// are emitted before udev has run its rules and created device nodes,
/// so the devices may not be usable yet. `Udev` events are sent after
/// processing has finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSource {
    Kernel,
    Udev,
}

impl EventSource {
    pub fn from_name(name: &str) -> io::Result<Self> {
        match name {
            "kernel" => Ok(Self::Kernel),
            "udev" => Ok(Self::Udev),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "unknown event source",
            )),
        }
    }
}

fn nl_groups(source: Option<EventSource>) -> u32 {
    match source {
        None => 0,
        Some(EventSource::Kernel) => KERNEL_GROUP,
        Some(EventSource::Udev) => UDEV_GROUP,
    }
}

/// Connects to a device event source.
///
/// One netlink socket per monitor; not safe for concurrent use, and
/// exactly one thread may receive. The socket is non-blocking: poll the
/// descriptor from [`AsRawFd`] for readability before calling
/// [`receive_device`](Monitor::receive_device).
pub struct Monitor<'a, 'c> {
    sock: NlSocket,
    group: Option<EventSource>,
    local_addr: u32,
    trusted_sender: Option<u32>,
    tags: TagFilter<'a>,
    subsystems: SubsystemFilter<'a>,
    bpf: BpfFilter,
    bound: bool,
    ctx: Option<&'c Udev>,
}

impl<'a, 'c> Monitor<'a, 'c> {
    /// Creates a monitor subscribed to `source` once
    /// [`enable_receiving`](Monitor::enable_receiving) is called. A
    /// context supplies the probe paths below and its log priority,
    /// which is applied to the `log` facade.
    ///
    /// Subscribing to udev events is not supported when no udev
    /// instance appears to be running on the host: uevents would
    /// otherwise broadcast the processing data of the host into
    /// containers. In that case the monitor is silently downgraded to a
    /// unicast-only sink.
    pub fn from_group(ctx: Option<&'c Udev>, source: Option<EventSource>) -> io::Result<Self> {
        if let Some(ctx) = ctx {
            log::set_max_level(ctx.get_log_priority().to_level_filter());
        }

        let source = match source {
            Some(EventSource::Udev) if !udev_seems_active(ctx) => {
                debug!("udev service seems not to be active, disabling the monitor");
                None
            }
            other => other,
        };

        let sock = NlSocket::new(NlFamily::KobjectUevent)?;
        sock.nonblock()?;
        set_cloexec(sock.as_raw_fd())?;

        Ok(Self {
            sock,
            group: source,
            local_addr: 0,
            trusted_sender: None,
            tags: Default::default(),
            subsystems: Default::default(),
            bpf: Default::default(),
            bound: false,
            ctx,
        })
    }

    /// Adopts an already-bound uevent socket, taking ownership of the
    /// descriptor.
    pub fn from_fd(
        ctx: Option<&'c Udev>,
        source: Option<EventSource>,
        fd: RawFd,
    ) -> io::Result<Self> {
        if let Some(ctx) = ctx {
            log::set_max_level(ctx.get_log_priority().to_level_filter());
        }

        let sock = unsafe { NlSocket::from_raw_fd(fd) };

        let mut monitor = Self {
            sock,
            group: source,
            local_addr: 0,
            trusted_sender: None,
            tags: Default::default(),
            subsystems: Default::default(),
            bpf: Default::default(),
            bound: true,
            ctx,
        };
        monitor.read_local_address()?;
        Ok(monitor)
    }

    pub fn context(&self) -> Option<&'c Udev> {
        self.ctx
    }

    pub fn group(&self) -> Option<EventSource> {
        self.group
    }

    /// Reads back the address the kernel assigned. It is usually, but
    /// not necessarily, the pid.
    fn read_local_address(&mut self) -> io::Result<()> {
        let mut addr = unsafe { mem::zeroed::<libc::sockaddr_nl>() };
        let mut addrlen = mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t;

        let res = unsafe {
            libc::getsockname(
                self.sock.as_raw_fd(),
                &mut addr as *mut _ as *mut libc::sockaddr,
                &mut addrlen,
            )
        };
        if res < 0 {
            return Err(io::Error::last_os_error());
        }

        self.local_addr = addr.nl_pid;
        Ok(())
    }

    /// Installs the filter, binds the socket to its group, and enables
    /// receipt of sender credentials. Re-enabling an already-bound
    /// monitor only reinstalls the filter and refreshes the address.
    pub fn enable_receiving(&mut self) -> io::Result<()> {
        self.filter_update()?;

        if !self.bound {
            self.sock
                .bind(None, Groups::new_bitmask(nl_groups(self.group)))?;
            self.bound = true;
        }

        self.read_local_address()?;

        // allow credentials to be received in ancillary messages
        let passcred: libc::c_int = 1;
        let res = unsafe {
            libc::setsockopt(
                self.sock.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_PASSCRED,
                &passcred as *const _ as *const libc::c_void,
                mem::size_of::<libc::c_int>() as _,
            )
        };
        if res < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Sets the size of the kernel receive buffer. Needs the
    /// appropriate privileges to succeed.
    pub fn set_receive_buffer_size(&self, size: usize) -> io::Result<()> {
        let size = size as libc::c_int;
        let res = unsafe {
            libc::setsockopt(
                self.sock.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_RCVBUFFORCE,
                &size as *const _ as *const libc::c_void,
                mem::size_of::<libc::c_int>() as _,
            )
        };
        if res < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Accepts unicast messages from `sender`'s address; all other
    /// unicast traffic keeps being dropped.
    pub fn allow_unicast_sender(&mut self, sender: &Monitor<'_, '_>) {
        self.trusted_sender = Some(sender.local_addr);
    }

    pub fn filter_add_match_subsystem_devtype<S, D>(
        &mut self,
        subsystem: S,
        devtype: Option<D>,
    ) -> io::Result<()>
    where
        S: Into<Cow<'a, OsStr>>,
        D: Into<Cow<'a, OsStr>>,
    {
        self.subsystems.insert(subsystem, devtype).map(|_| ())
    }

    pub fn filter_add_match_tag<T: Into<Cow<'a, OsStr>>>(&mut self, tag: T) -> io::Result<()> {
        self.tags.insert(tag)
    }

    /// Compiles and installs the kernel filter. A no-op when no match
    /// has been added, leaving any previously installed filter alone;
    /// use [`filter_remove`](Monitor::filter_remove) to drop one.
    pub fn filter_update(&mut self) -> io::Result<()> {
        if self.tags.is_empty() && self.subsystems.is_empty() {
            return Ok(());
        }

        self.bpf.compile(&self.tags, &self.subsystems)?;
        self.bpf.install(self.sock.as_raw_fd())
    }

    /// Removes all matches and the kernel filter; the monitor then
    /// accepts everything its group delivers.
    pub fn filter_remove(&mut self) -> io::Result<()> {
        self.tags.clear();
        self.subsystems.clear();
        BpfFilter::detach(self.sock.as_raw_fd())
    }

    /// Receives the next device event, or `None` once the socket is
    /// drained. Datagrams rejected by policy (untrusted or non-root
    /// sender, corrupt or truncated message) also yield `None`.
    pub fn receive_device(&self) -> io::Result<Option<Device>> {
        let mut pfd = libc::pollfd {
            fd: self.sock.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };

        loop {
            match self.receive_device_one()? {
                Some(Received::Device(device)) => return Ok(Some(device)),
                None => return Ok(None),
                // the device did not pass the filter, look for the next
                // message without blocking
                Some(Received::Filtered) => (),
            }

            loop {
                let res = unsafe { libc::poll(&mut pfd, 1, 0) };
                if res < 0 {
                    let err = io::Error::last_os_error();
                    if matches!(err.raw_os_error(), Some(libc::EINTR) | Some(libc::EAGAIN)) {
                        continue;
                    }
                    return Err(err);
                } else if res == 0 {
                    return Ok(None);
                }
                break;
            }
        }
    }

    fn receive_device_one(&self) -> io::Result<Option<Received>> {
        let mut buf = [0u8; RECV_BUF_SIZE];

        let mut iov = unsafe { mem::zeroed::<libc::iovec>() };
        iov.iov_base = buf.as_mut_ptr() as *mut libc::c_void;
        iov.iov_len = buf.len();

        // room for a cmsghdr plus a ucred, with cmsghdr alignment
        let mut control = unsafe { mem::zeroed::<[libc::cmsghdr; 2]>() };
        let mut sender = unsafe { mem::zeroed::<libc::sockaddr_nl>() };

        let mut msghdr = unsafe { mem::zeroed::<libc::msghdr>() };
        msghdr.msg_iov = &mut iov;
        msghdr.msg_iovlen = 1;
        msghdr.msg_control = control.as_mut_ptr() as *mut libc::c_void;
        msghdr.msg_controllen = mem::size_of_val(&control) as _;
        msghdr.msg_name = &mut sender as *mut _ as *mut libc::c_void;
        msghdr.msg_namelen = mem::size_of::<libc::sockaddr_nl>() as _;

        let len = unsafe { libc::recvmsg(self.sock.as_raw_fd(), &mut msghdr, 0) };
        if len < 0 {
            let err = io::Error::last_os_error();
            if matches!(err.kind(), io::ErrorKind::WouldBlock) {
                return Ok(None);
            }
            return Err(err);
        }
        let buflen = len as usize;

        if buflen < 32 || (msghdr.msg_flags & libc::MSG_TRUNC) != 0 {
            debug!("invalid message length, ignoring");
            return Ok(None);
        }

        if sender.nl_groups == 0 {
            // unicast message, check if we trust the sender
            if !self
                .trusted_sender
                .is_some_and(|trusted| trusted != 0 && trusted == sender.nl_pid)
            {
                debug!("unicast netlink message ignored");
                return Ok(None);
            }
        } else if sender.nl_groups == KERNEL_GROUP && sender.nl_pid > 0 {
            debug!(
                "multicast kernel netlink message from pid {} ignored",
                sender.nl_pid
            );
            return Ok(None);
        }

        let Some(cred) = sender_credentials(&msghdr) else {
            debug!("no sender credentials received, message ignored");
            return Ok(None);
        };
        if cred.uid != 0 {
            debug!("sender uid {} is not root, message ignored", cred.uid);
            return Ok(None);
        }

        let bytes = &buf[..buflen];
        let (properties, is_initialized) = if bytes[..wire::PREFIX.len()] == wire::PREFIX {
            // udev message needs the proper version magic
            let Some(header) = NetlinkHeader::from_bytes(bytes) else {
                debug!("invalid message header, ignoring");
                return Ok(None);
            };
            let magic = header.magic;
            if magic != wire::MONITOR_MAGIC.to_be() {
                debug!("invalid message signature, ignoring");
                return Ok(None);
            }

            let offset = header.properties_off as usize;
            if offset + 32 > buflen {
                debug!("invalid message property offset, ignoring");
                return Ok(None);
            }

            // devices received from udev are always initialized
            (&bytes[offset..], true)
        } else {
            // kernel message with an "<action>@<devpath>" header line
            let Some(offset) = wire::kernel_prefix_len(bytes) else {
                debug!("invalid kernel message header, ignoring");
                return Ok(None);
            };
            (&bytes[offset..], false)
        };

        let mut device = match Device::from_nulstr(properties) {
            Ok(device) => device,
            Err(err) => {
                debug!("failed to create device from message: {err}");
                return Ok(None);
            }
        };
        if is_initialized {
            device.set_initialized();
        }

        // skip the device if it does not pass the current filter
        if !self.passes_filter(&device) {
            return Ok(Some(Received::Filtered));
        }

        Ok(Some(Received::Device(device)))
    }

    /// Re-checks the kernel filter's verdict against the device's
    /// actual strings; the in-kernel program works on hashes and may
    /// let collisions through.
    fn passes_filter(&self, device: &Device) -> bool {
        if !self.subsystems.is_empty() {
            let Some(subsystem) = device.subsystem() else {
                return false;
            };
            let devtype = device.devtype();

            let matched = self.subsystems.iter().any(|(want_subsystem, want_devtype)| {
                if want_subsystem.as_ref() as &OsStr != subsystem {
                    return false;
                }
                match (want_devtype, devtype) {
                    (None, _) => true,
                    (Some(want), Some(have)) => want.as_ref() as &OsStr == have,
                    (Some(_), None) => false,
                }
            });
            if !matched {
                return false;
            }
        }

        if self.tags.is_empty() {
            return true;
        }
        device.tags().any(|tag| self.tags.contains(tag))
    }

    /// Sends a device to `destination`, or to the udev multicast group
    /// when no destination is given. A refused multicast send means
    /// nobody is listening and counts as success.
    pub fn send_device(
        &self,
        destination: Option<&Monitor<'_, '_>>,
        device: &Device,
    ) -> io::Result<()> {
        let properties = device.properties_nulstr();
        if properties.len() < 32 {
            debug!("device buffer is too small to contain a valid device");
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }

        let subsystem = device.subsystem().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "device has no subsystem")
        })?;

        let mut header = NetlinkHeader::for_send();
        header.filter_subsystem_hash = hash32(subsystem).to_be();
        if let Some(devtype) = device.devtype() {
            header.filter_devtype_hash = hash32(devtype).to_be();
        }

        let tag_bloom_bits = device.tags().fold(0u64, |bits, tag| bits | bloom64(tag));
        if tag_bloom_bits > 0 {
            header.filter_tag_bloom_hi = ((tag_bloom_bits >> 32) as u32).to_be();
            header.filter_tag_bloom_lo = (tag_bloom_bits as u32).to_be();
        }

        header.properties_len = properties.len() as u32;
        let header_bytes = header.to_bytes();

        let mut iov = unsafe { mem::zeroed::<[libc::iovec; 2]>() };
        iov[0].iov_base = header_bytes.as_ptr() as *mut libc::c_void;
        iov[0].iov_len = header_bytes.len();
        iov[1].iov_base = properties.as_ptr() as *mut libc::c_void;
        iov[1].iov_len = properties.len();

        let mut addr = unsafe { mem::zeroed::<libc::sockaddr_nl>() };
        addr.nl_family = libc::AF_NETLINK as _;
        match destination {
            Some(monitor) => {
                addr.nl_pid = monitor.local_addr;
                addr.nl_groups = nl_groups(monitor.group);
            }
            None => addr.nl_groups = UDEV_GROUP,
        }

        let mut msghdr = unsafe { mem::zeroed::<libc::msghdr>() };
        msghdr.msg_iov = iov.as_mut_ptr();
        msghdr.msg_iovlen = 2;
        msghdr.msg_name = &mut addr as *mut _ as *mut libc::c_void;
        msghdr.msg_namelen = mem::size_of::<libc::sockaddr_nl>() as _;

        let count = unsafe { libc::sendmsg(self.sock.as_raw_fd(), &msghdr, 0) };
        if count < 0 {
            let err = io::Error::last_os_error();
            // nobody subscribed to the multicast group, which is expected
            if destination.is_none() && err.raw_os_error() == Some(libc::ECONNREFUSED) {
                debug!("no multicast listener, discarding device");
                return Ok(());
            }
            return Err(err);
        }

        debug!("passed {count} byte device to netlink monitor");
        Ok(())
    }

    /// Closes the socket. Dropping the monitor does the same; this just
    /// makes teardown explicit at the call site.
    pub fn disconnect(self) {}
}

impl AsRawFd for Monitor<'_, '_> {
    fn as_raw_fd(&self) -> RawFd {
        self.sock.as_raw_fd()
    }
}

enum Received {
    Device(Device),
    Filtered,
}

fn sender_credentials(msghdr: &libc::msghdr) -> Option<libc::ucred> {
    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(msghdr);
        if cmsg.is_null()
            || (*cmsg).cmsg_level != libc::SOL_SOCKET
            || (*cmsg).cmsg_type != libc::SCM_CREDENTIALS
        {
            return None;
        }
        Some(core::ptr::read_unaligned(
            libc::CMSG_DATA(cmsg) as *const libc::ucred
        ))
    }
}

fn set_cloexec(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Best-effort liveness probe for the udev daemon: its control socket
/// exists, or the device filesystem is devtmpfs-mounted. The paths come
/// from the context, so tests can redirect them via the configuration.
fn udev_seems_active(ctx: Option<&Udev>) -> bool {
    let control_path = match ctx {
        Some(ctx) => format!("{}/control", ctx.run_path()),
        None => "/run/udev/control".to_owned(),
    };
    if std::path::Path::new(&control_path).exists() {
        return true;
    }

    dev_is_devtmpfs(ctx.map_or("/dev", |ctx| ctx.dev_path()))
}

fn dev_is_devtmpfs(dev_path: &str) -> bool {
    let Ok(mountinfo) = std::fs::read_to_string("/proc/self/mountinfo") else {
        return false;
    };

    for line in mountinfo.lines() {
        // "id parent major:minor root mountpoint opts ... - fstype source opts"
        let Some((mount_fields, fs_fields)) = line.split_once(" - ") else {
            continue;
        };
        let Some(mount_point) = mount_fields.split_whitespace().nth(4) else {
            continue;
        };
        if mount_point == dev_path && fs_fields.split_whitespace().next() == Some("devtmpfs") {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_bitmasks() {
        assert_eq!(nl_groups(None), 0);
        assert_eq!(nl_groups(Some(EventSource::Kernel)), 1);
        assert_eq!(nl_groups(Some(EventSource::Udev)), 2);
    }

    #[test]
    fn event_source_names() {
        assert_eq!(EventSource::from_name("kernel").unwrap(), EventSource::Kernel);
        assert_eq!(EventSource::from_name("udev").unwrap(), EventSource::Udev);
        let err = EventSource::from_name("monitor").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn userspace_filter_matches_on_strings() {
        let mut monitor = Monitor::from_group(None, None).unwrap();
        monitor
            .filter_add_match_subsystem_devtype(OsStr::new("usb"), Some(OsStr::new("usb_device")))
            .unwrap();

        let matching = Device::from_nulstr(
            b"DEVPATH=/devices/usb1\0SUBSYSTEM=usb\0DEVTYPE=usb_device\0\0",
        )
        .unwrap();
        let wrong_devtype = Device::from_nulstr(
            b"DEVPATH=/devices/usb1/1-1\0SUBSYSTEM=usb\0DEVTYPE=usb_interface\0\0",
        )
        .unwrap();
        let no_devtype =
            Device::from_nulstr(b"DEVPATH=/devices/usb1\0SUBSYSTEM=usb\0\0").unwrap();

        assert!(monitor.passes_filter(&matching));
        assert!(!monitor.passes_filter(&wrong_devtype));
        assert!(!monitor.passes_filter(&no_devtype));
    }

    #[test]
    fn userspace_filter_requires_a_tag_when_tags_are_set() {
        let mut monitor = Monitor::from_group(None, None).unwrap();
        monitor.filter_add_match_tag(OsStr::new("systemd")).unwrap();

        let tagged =
            Device::from_nulstr(b"SUBSYSTEM=input\0TAGS=:systemd:seat:\0\0").unwrap();
        let untagged = Device::from_nulstr(b"SUBSYSTEM=input\0TAGS=:seat:\0\0").unwrap();

        assert!(monitor.passes_filter(&tagged));
        assert!(!monitor.passes_filter(&untagged));
    }

    #[test]
    fn context_is_carried_and_sets_the_log_level() {
        let udev = Udev::new().unwrap();
        let monitor = Monitor::from_group(Some(&udev), None).unwrap();

        assert!(monitor.context().is_some());
        assert_eq!(log::max_level(), udev.get_log_priority().to_level_filter());
    }

    #[test]
    fn empty_filter_passes_everything() {
        let monitor = Monitor::from_group(None, None).unwrap();
        let device = Device::from_nulstr(b"SUBSYSTEM=net\0INTERFACE=lo\0\0").unwrap();
        assert!(monitor.passes_filter(&device));
    }
}
