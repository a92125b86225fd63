use crate::Cow;
use std::collections::{btree_map, btree_set, BTreeMap, BTreeSet};
use std::ffi::OsStr;
use std::io;

/// Tag names to match. Inserting a duplicate is a no-op.
#[derive(Default)]
pub(crate) struct TagFilter<'a> {
    items: BTreeSet<Cow<'a, OsStr>>,
}

impl<'a> TagFilter<'a> {
    pub(crate) fn insert<T: Into<Cow<'a, OsStr>>>(&mut self, tag: T) -> io::Result<()> {
        let tag = tag.into();

        if tag.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty tag"));
        }
        self.items.insert(tag);
        Ok(())
    }

    pub(crate) fn contains(&self, tag: &OsStr) -> bool {
        self.items.contains(tag)
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub(crate) fn iter(&self) -> btree_set::Iter<'_, Cow<'a, OsStr>> {
        self.items.iter()
    }

    pub(crate) fn clear(&mut self) {
        self.items.clear();
    }
}

/// Subsystem names to match, each with an optional devtype. Keys are
/// unique; inserting an existing subsystem replaces its devtype. A
/// `None` devtype matches devices of any devtype.
#[derive(Default)]
pub(crate) struct SubsystemFilter<'a> {
    items: BTreeMap<Cow<'a, OsStr>, Option<Cow<'a, OsStr>>>,
}

impl<'a> SubsystemFilter<'a> {
    pub(crate) fn insert<K: Into<Cow<'a, OsStr>>>(
        &mut self,
        subsystem: K,
        devtype: Option<impl Into<Cow<'a, OsStr>>>,
    ) -> io::Result<Option<Option<Cow<'a, OsStr>>>> {
        let subsystem = subsystem.into();

        if subsystem.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty subsystem"));
        }

        let devtype = devtype.map(Into::into);
        if devtype.as_ref().is_some_and(|d| d.is_empty()) {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty devtype"));
        }

        Ok(self.items.insert(subsystem, devtype))
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub(crate) fn iter(&self) -> btree_map::Iter<'_, Cow<'a, OsStr>, Option<Cow<'a, OsStr>>> {
        self.items.iter()
    }

    pub(crate) fn clear(&mut self) {
        self.items.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::{OsStr, OsString};

    #[test]
    fn duplicate_tag_is_noop() {
        let mut tags = TagFilter::default();
        tags.insert(OsStr::new("systemd")).unwrap();
        tags.insert(OsStr::new("systemd")).unwrap();
        assert_eq!(tags.len(), 1);
    }

    #[test]
    fn empty_tag_is_rejected() {
        let mut tags = TagFilter::default();
        let err = tags.insert(OsStr::new("")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert!(tags.is_empty());
    }

    #[test]
    fn duplicate_subsystem_replaces_devtype() {
        let mut subsystems = SubsystemFilter::default();
        subsystems
            .insert(OsStr::new("usb"), Some(OsStr::new("usb_device")))
            .unwrap();
        let previous = subsystems
            .insert(OsStr::new("usb"), None::<OsString>)
            .unwrap();

        assert_eq!(previous, Some(Some(Cow::from(OsStr::new("usb_device")))));
        assert_eq!(subsystems.iter().count(), 1);
        let (_, devtype) = subsystems.iter().next().unwrap();
        assert!(devtype.is_none());
    }

    #[test]
    fn empty_subsystem_or_devtype_is_rejected() {
        let mut subsystems = SubsystemFilter::default();
        assert!(subsystems.insert(OsStr::new(""), None::<OsString>).is_err());
        assert!(subsystems
            .insert(OsStr::new("block"), Some(OsStr::new("")))
            .is_err());
        assert!(subsystems.is_empty());
    }
}
