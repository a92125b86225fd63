use log::debug;
use std::collections::{BTreeMap, BTreeSet};
use std::ffi::{OsStr, OsString};
use std::io;
use std::os::unix::ffi::OsStrExt;

macro_rules! parse_int {
    ($t:ty, $buf:expr, $base:expr) => {{
        if $base == 10 {
            ::atoi_simd::parse::<$t>($buf).ok()
        } else {
            std::str::from_utf8($buf)
                .ok()
                .and_then(|s| <$t>::from_str_radix(s, $base).ok())
        }
    }};
    ($t:ty, $buf:expr) => {
        parse_int!($t, $buf, 10)
    };
}

/// What happened to a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Add,
    Remove,
    Change,
    Move,
    Online,
    Offline,
    Bind,
    Unbind,
    Other(OsString),
}

impl Action {
    fn from_bytes(buf: &[u8]) -> Self {
        match buf {
            b"add" => Self::Add,
            b"remove" => Self::Remove,
            b"change" => Self::Change,
            b"move" => Self::Move,
            b"online" => Self::Online,
            b"offline" => Self::Offline,
            b"bind" => Self::Bind,
            b"unbind" => Self::Unbind,
            _ => Self::Other(OsStr::from_bytes(buf).to_os_string()),
        }
    }
}

/// A device record assembled from a uevent property buffer.
///
/// All properties are retained verbatim for re-serialization; the ones
/// the monitor link cares about are additionally parsed into typed
/// fields as they are added.
#[derive(Debug, Default, Clone)]
pub struct Device {
    properties: BTreeMap<OsString, OsString>,
    tags: BTreeSet<OsString>,
    devlinks: BTreeSet<OsString>,
    subsystem: Option<OsString>,
    devtype: Option<OsString>,
    devname: Option<OsString>,
    devpath: Option<OsString>,
    driver: Option<OsString>,
    action: Option<Action>,
    seqnum: Option<u64>,
    major: Option<u64>,
    minor: Option<u64>,
    if_index: Option<u64>,
    devmode: Option<u32>,
    usec_initialized: Option<u64>,
    is_initialized: bool,
}

impl Device {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a device from a `KEY=VALUE\0` run terminated by an empty
    /// string. Malformed entries are skipped, mirroring how peers treat
    /// buffers from senders they do not fully trust.
    pub fn from_nulstr(buf: &[u8]) -> io::Result<Self> {
        let mut device = Self::new();
        let mut seen = false;

        for kv_pair in buf.split(|&ch| ch == b'\0') {
            if kv_pair.is_empty() {
                continue;
            }

            let Some(pos) = kv_pair.iter().position(|&ch| ch == b'=') else {
                debug!("ignoring invalid property entry");
                continue;
            };
            let (key, value) = (&kv_pair[..pos], &kv_pair[pos + 1..]);
            if key.is_empty() {
                debug!("ignoring property entry with empty key");
                continue;
            }

            device.add_property(OsStr::from_bytes(key), OsStr::from_bytes(value))?;
            seen = true;
        }

        if !seen {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "property buffer contains no properties",
            ));
        }

        Ok(device)
    }

    /// Serializes all properties back to the wire form: `KEY=VALUE\0`
    /// runs terminated by an empty string.
    pub fn properties_nulstr(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        for (key, value) in &self.properties {
            buf.extend_from_slice(key.as_encoded_bytes());
            buf.push(b'=');
            buf.extend_from_slice(value.as_encoded_bytes());
            buf.push(b'\0');
        }
        buf.push(b'\0');
        buf
    }

    pub fn add_property(
        &mut self,
        key: impl Into<OsString>,
        value: impl Into<OsString>,
    ) -> io::Result<()> {
        let key = key.into();
        let value = value.into();

        if key.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty property key"));
        }

        {
            let val = value.as_encoded_bytes();
            match key.as_encoded_bytes() {
                b"SUBSYSTEM" => self.subsystem = Some(value.clone()),
                b"DEVTYPE" => self.devtype = Some(value.clone()),
                b"DEVNAME" => self.devname = Some(value.clone()),
                b"DEVPATH" => self.devpath = Some(value.clone()),
                b"DRIVER" => self.driver = Some(value.clone()),
                b"ACTION" => self.action = Some(Action::from_bytes(val)),
                b"TAGS" | b"CURRENT_TAGS" => self.tags.extend(
                    val.split(|&ch| ch == b':')
                        .filter(|tag| !tag.is_empty())
                        .map(|tag| OsStr::from_bytes(tag).to_os_string()),
                ),
                b"DEVLINKS" => self.devlinks.extend(
                    val.split(|&ch| ch == b' ')
                        .filter(|link| !link.is_empty())
                        .map(|link| OsStr::from_bytes(link).to_os_string()),
                ),
                b"SEQNUM" => self.seqnum = parse_int!(u64, val),
                b"MAJOR" => self.major = parse_int!(u64, val),
                b"MINOR" => self.minor = parse_int!(u64, val),
                b"IFINDEX" => self.if_index = parse_int!(u64, val),
                b"DEVMODE" => self.devmode = parse_int!(u32, val, 8),
                b"USEC_INITIALIZED" => self.usec_initialized = parse_int!(u64, val),
                _ => (),
            }
        }

        self.properties.insert(key, value);
        Ok(())
    }

    pub fn property(&self, key: &OsStr) -> Option<&OsStr> {
        self.properties.get(key).map(|v| v.as_ref())
    }

    pub fn properties(&self) -> &BTreeMap<OsString, OsString> {
        &self.properties
    }

    pub fn subsystem(&self) -> Option<&OsStr> {
        self.subsystem.as_deref()
    }

    pub fn devtype(&self) -> Option<&OsStr> {
        self.devtype.as_deref()
    }

    pub fn devname(&self) -> Option<&OsStr> {
        self.devname.as_deref()
    }

    pub fn devpath(&self) -> Option<&OsStr> {
        self.devpath.as_deref()
    }

    pub fn driver(&self) -> Option<&OsStr> {
        self.driver.as_deref()
    }

    pub fn action(&self) -> Option<&Action> {
        self.action.as_ref()
    }

    pub fn seqnum(&self) -> Option<u64> {
        self.seqnum
    }

    pub fn major(&self) -> Option<u64> {
        self.major
    }

    pub fn minor(&self) -> Option<u64> {
        self.minor
    }

    pub fn if_index(&self) -> Option<u64> {
        self.if_index
    }

    pub fn devmode(&self) -> Option<u32> {
        self.devmode
    }

    pub fn usec_initialized(&self) -> Option<u64> {
        self.usec_initialized
    }

    pub fn tags(&self) -> impl Iterator<Item = &OsStr> {
        self.tags.iter().map(|tag| tag.as_ref())
    }

    pub fn has_tag(&self, tag: &OsStr) -> bool {
        self.tags.contains(tag)
    }

    pub fn devlinks(&self) -> impl Iterator<Item = &OsStr> {
        self.devlinks.iter().map(|link| link.as_ref())
    }

    /// Whether the device came from udev rather than straight from the
    /// kernel.
    pub fn is_initialized(&self) -> bool {
        self.is_initialized
    }

    pub fn set_initialized(&mut self) {
        self.is_initialized = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_kernel_uevent_properties() {
        let device = Device::from_nulstr(b"INTERFACE=lo\0SUBSYSTEM=net\0\0").unwrap();

        assert_eq!(device.subsystem(), Some(OsStr::new("net")));
        assert_eq!(device.devtype(), None);
        assert_eq!(device.property(OsStr::new("INTERFACE")), Some(OsStr::new("lo")));
        assert!(!device.is_initialized());
    }

    #[test]
    fn typed_fields_are_extracted() {
        let device = Device::from_nulstr(
            b"ACTION=add\0DEVPATH=/devices/pci0000:00/sda\0SUBSYSTEM=block\0\
              DEVTYPE=disk\0DEVNAME=/dev/sda\0MAJOR=8\0MINOR=0\0SEQNUM=4711\0\
              DEVMODE=0660\0TAGS=:systemd:seat:\0DEVLINKS=/dev/disk/by-id/x /dev/disk/by-path/y\0\0",
        )
        .unwrap();

        assert_eq!(device.action(), Some(&Action::Add));
        assert_eq!(device.devtype(), Some(OsStr::new("disk")));
        assert_eq!(device.devname(), Some(OsStr::new("/dev/sda")));
        assert_eq!(device.major(), Some(8));
        assert_eq!(device.minor(), Some(0));
        assert_eq!(device.seqnum(), Some(4711));
        assert_eq!(device.devmode(), Some(0o660));
        assert!(device.has_tag(OsStr::new("systemd")));
        assert!(device.has_tag(OsStr::new("seat")));
        assert!(!device.has_tag(OsStr::new("uaccess")));
        assert_eq!(device.devlinks().count(), 2);
    }

    #[test]
    fn nulstr_round_trips() {
        let mut device = Device::new();
        device.add_property(OsStr::new("SUBSYSTEM"), OsStr::new("block")).unwrap();
        device.add_property(OsStr::new("DEVTYPE"), OsStr::new("disk")).unwrap();
        device.add_property(OsStr::new("DEVPATH"), OsStr::new("/devices/virtual/sda")).unwrap();
        device.add_property(OsStr::new("TAGS"), OsStr::new(":systemd:")).unwrap();

        let reparsed = Device::from_nulstr(&device.properties_nulstr()).unwrap();

        assert_eq!(reparsed.properties(), device.properties());
        assert_eq!(reparsed.subsystem(), device.subsystem());
        assert_eq!(reparsed.devtype(), device.devtype());
        assert!(reparsed.has_tag(OsStr::new("systemd")));
    }

    #[test]
    fn malformed_entries_are_skipped() {
        let device =
            Device::from_nulstr(b"garbage-without-equals\0SUBSYSTEM=net\0=novalue\0\0").unwrap();

        assert_eq!(device.subsystem(), Some(OsStr::new("net")));
        assert_eq!(device.properties().len(), 1);
    }

    #[test]
    fn empty_buffer_is_an_error() {
        let err = Device::from_nulstr(b"\0\0").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn unparsable_numbers_leave_typed_fields_unset() {
        let device = Device::from_nulstr(b"SUBSYSTEM=net\0SEQNUM=abc\0\0").unwrap();
        assert_eq!(device.seqnum(), None);
        assert_eq!(device.property(OsStr::new("SEQNUM")), Some(OsStr::new("abc")));
    }
}
