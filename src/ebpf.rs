use crate::hash::{bloom64, hash32};
use crate::wire::{NetlinkHeader, MONITOR_MAGIC};
use crate::{SubsystemFilter, TagFilter};
use std::io;
use std::os::fd::RawFd;

/// Hard limit of the kernel's classic socket-filter facility.
const MAX_INSTRUCTIONS: usize = 512;

/// Instructions each tag match occupies; the match jump has to skip the
/// remaining tag matches and the trailing drop.
const TAG_MATCH_LEN: usize = 6;

#[derive(Default)]
pub(crate) struct BpfFilter {
    instructions: Vec<libc::sock_filter>,
}

impl BpfFilter {
    fn stmt(&mut self, code: u16, data: u32) {
        let mut ins = unsafe { core::mem::zeroed::<libc::sock_filter>() };
        ins.code = code;
        ins.k = data;
        self.instructions.push(ins);
    }

    fn jmp(&mut self, code: u16, data: u32, jt: u8, jf: u8) {
        let mut ins = unsafe { core::mem::zeroed::<libc::sock_filter>() };
        ins.code = code;
        ins.jt = jt;
        ins.jf = jf;
        ins.k = data;
        self.instructions.push(ins);
    }

    fn pass_packet(&mut self) {
        self.stmt((libc::BPF_RET | libc::BPF_K) as _, 0xffffffff);
    }

    fn drop_packet(&mut self) {
        self.stmt((libc::BPF_RET | libc::BPF_K) as _, 0);
    }

    fn room_for_return(&self) -> io::Result<()> {
        if self.instructions.len() + 1 >= MAX_INSTRUCTIONS {
            return Err(io::Error::from_raw_os_error(libc::E2BIG));
        }
        Ok(())
    }

    fn emit_tag_matches(&mut self, tags: &TagFilter) -> io::Result<()> {
        // The jump past the tag block must fit the 8-bit jump offset.
        let mut tag_matches = tags.len();
        if 1 + (tag_matches.saturating_sub(1)) * TAG_MATCH_LEN > u8::MAX as usize {
            return Err(io::Error::from_raw_os_error(libc::E2BIG));
        }

        for tag in tags.iter() {
            let tag_bloom_bits = bloom64(tag);
            let tag_bloom_hi = (tag_bloom_bits >> 32) as u32;
            let tag_bloom_lo = tag_bloom_bits as u32;

            // load device bloom bits in A
            self.stmt(
                (libc::BPF_LD | libc::BPF_W | libc::BPF_ABS) as _,
                core::mem::offset_of!(NetlinkHeader, filter_tag_bloom_hi) as _,
            );
            // clear bits (tag bits & bloom bits)
            self.stmt((libc::BPF_ALU | libc::BPF_AND | libc::BPF_K) as _, tag_bloom_hi);
            // jump to next tag if it does not match
            self.jmp(
                (libc::BPF_JMP | libc::BPF_JEQ | libc::BPF_K) as _,
                tag_bloom_hi,
                0,
                3,
            );

            // load device bloom bits in A
            self.stmt(
                (libc::BPF_LD | libc::BPF_W | libc::BPF_ABS) as _,
                core::mem::offset_of!(NetlinkHeader, filter_tag_bloom_lo) as _,
            );
            // clear bits (tag bits & bloom bits)
            self.stmt((libc::BPF_ALU | libc::BPF_AND | libc::BPF_K) as _, tag_bloom_lo);
            // jump behind the end of the tag match block if the tag matches
            tag_matches -= 1;
            self.jmp(
                (libc::BPF_JMP | libc::BPF_JEQ | libc::BPF_K) as _,
                tag_bloom_lo,
                (1 + tag_matches * TAG_MATCH_LEN) as _,
                0,
            );

            self.room_for_return()?;
        }

        // nothing matched, drop packet
        self.drop_packet();
        Ok(())
    }

    fn emit_subsystem_matches(&mut self, subsystems: &SubsystemFilter) -> io::Result<()> {
        for (subsystem, devtype) in subsystems.iter() {
            // load the subsystem hash in A
            self.stmt(
                (libc::BPF_LD | libc::BPF_W | libc::BPF_ABS) as _,
                core::mem::offset_of!(NetlinkHeader, filter_subsystem_hash) as _,
            );

            match devtype {
                None => {
                    // jump to the next entry if the subsystem does not match
                    self.jmp(
                        (libc::BPF_JMP | libc::BPF_JEQ | libc::BPF_K) as _,
                        hash32(subsystem),
                        0,
                        1,
                    );
                }
                Some(devtype) => {
                    // jump to the next entry if the subsystem does not match
                    self.jmp(
                        (libc::BPF_JMP | libc::BPF_JEQ | libc::BPF_K) as _,
                        hash32(subsystem),
                        0,
                        3,
                    );
                    // load the devtype hash in A
                    self.stmt(
                        (libc::BPF_LD | libc::BPF_W | libc::BPF_ABS) as _,
                        core::mem::offset_of!(NetlinkHeader, filter_devtype_hash) as _,
                    );
                    // jump to the next entry if the devtype does not match
                    self.jmp(
                        (libc::BPF_JMP | libc::BPF_JEQ | libc::BPF_K) as _,
                        hash32(devtype),
                        0,
                        1,
                    );
                }
            }

            // matched, pass packet
            self.pass_packet();

            self.room_for_return()?;
        }

        // nothing matched, drop packet
        self.drop_packet();
        Ok(())
    }

    /// Rebuilds the program for the given filter state. Kernel uevents
    /// carry no monitor header, so a magic mismatch passes the packet
    /// instead of dropping it; the receive path dispatches those
    /// separately.
    pub(crate) fn compile(
        &mut self,
        tags: &TagFilter,
        subsystems: &SubsystemFilter,
    ) -> io::Result<()> {
        self.instructions.clear();

        // load magic in A
        self.stmt(
            (libc::BPF_LD | libc::BPF_W | libc::BPF_ABS) as _,
            core::mem::offset_of!(NetlinkHeader, magic) as _,
        );
        // jump if magic matches
        self.jmp(
            (libc::BPF_JMP | libc::BPF_JEQ | libc::BPF_K) as _,
            MONITOR_MAGIC,
            1,
            0,
        );
        // wrong magic, pass packet
        self.pass_packet();

        if !tags.is_empty() {
            self.emit_tag_matches(tags)?;
        }

        if !subsystems.is_empty() {
            self.emit_subsystem_matches(subsystems)?;
        }

        // matched, pass packet
        self.pass_packet();
        Ok(())
    }

    /// Installs the compiled program, atomically replacing any prior
    /// filter on the socket.
    pub(crate) fn install(&mut self, fd: RawFd) -> io::Result<()> {
        let mut fprog = unsafe { core::mem::zeroed::<libc::sock_fprog>() };
        fprog.len = self.instructions.len() as _;
        fprog.filter = self.instructions.as_mut_ptr();

        attach(fd, &fprog)
    }

    /// Drops any installed filter; the socket then accepts everything
    /// its group delivers.
    pub(crate) fn detach(fd: RawFd) -> io::Result<()> {
        let res = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_DETACH_FILTER,
                core::ptr::null(),
                0,
            )
        };
        if res < 0 {
            let err = io::Error::last_os_error();
            // nothing was installed
            if err.raw_os_error() != Some(libc::ENOENT) {
                return Err(err);
            }
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn instructions(&self) -> &[libc::sock_filter] {
        &self.instructions
    }
}

fn attach(fd: RawFd, fprog: &libc::sock_fprog) -> io::Result<()> {
    let res = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ATTACH_FILTER,
            fprog as *const _ as _,
            core::mem::size_of::<libc::sock_fprog>() as _,
        )
    };

    if res < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
