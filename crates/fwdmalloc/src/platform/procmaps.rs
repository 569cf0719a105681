//! Allocation-free /proc/self/maps reader.
//!
//! The sweeper walks the memory map while the mutator may be suspended
//! inside an arbitrary call, so this parser works off a fixed stack
//! buffer fed by raw read(2) and never allocates.

#[derive(Clone, Copy, Default)]
pub struct MapRegion {
    pub start: usize,
    pub end: usize,
    pub readable: bool,
    pub writable: bool,
    pub executable: bool,
    /// 'p' in the permission column: copy-on-write private mapping.
    pub private: bool,
}

pub struct MapsFile {
    fd: libc::c_int,
    buf: [u8; 4096],
    len: usize,
    pos: usize,
}

impl MapsFile {
    /// Open /proc/self/maps. Returns None if the file cannot be opened
    /// (the sweeper skips the cycle).
    pub fn open() -> Option<MapsFile> {
        let fd = unsafe {
            libc::open(b"/proc/self/maps\0".as_ptr() as *const libc::c_char, libc::O_RDONLY)
        };
        if fd < 0 {
            return None;
        }
        Some(MapsFile {
            fd,
            buf: [0; 4096],
            len: 0,
            pos: 0,
        })
    }

    fn next_byte(&mut self) -> Option<u8> {
        if self.pos >= self.len {
            let got = unsafe {
                libc::read(
                    self.fd,
                    self.buf.as_mut_ptr() as *mut libc::c_void,
                    self.buf.len(),
                )
            };
            if got <= 0 {
                return None;
            }
            self.len = got as usize;
            self.pos = 0;
        }
        let byte = self.buf[self.pos];
        self.pos += 1;
        Some(byte)
    }

    /// Parse the next `start-end perms ...` line. Returns None at EOF or
    /// on a malformed line (which also ends the walk: a half-parsed map
    /// is not worth scanning from).
    pub fn next_region(&mut self) -> Option<MapRegion> {
        let mut region = MapRegion::default();

        // start address, hex, terminated by '-'
        let mut addr: usize = 0;
        let mut any = false;
        loop {
            let byte = self.next_byte()?;
            match hex_val(byte) {
                Some(v) => {
                    addr = (addr << 4) | v;
                    any = true;
                }
                None if byte == b'-' && any => break,
                None => return None,
            }
        }
        region.start = addr;

        // end address, hex, terminated by ' '
        addr = 0;
        any = false;
        loop {
            let byte = self.next_byte()?;
            match hex_val(byte) {
                Some(v) => {
                    addr = (addr << 4) | v;
                    any = true;
                }
                None if byte == b' ' && any => break,
                None => return None,
            }
        }
        region.end = addr;

        // permission column: rwxp
        region.readable = self.next_byte()? == b'r';
        region.writable = self.next_byte()? == b'w';
        region.executable = self.next_byte()? == b'x';
        region.private = self.next_byte()? == b'p';

        // Discard the remainder of the line (offset, device, inode, path).
        loop {
            match self.next_byte() {
                Some(b'\n') => break,
                Some(_) => {}
                None => break,
            }
        }

        Some(region)
    }
}

impl Drop for MapsFile {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

#[inline]
fn hex_val(byte: u8) -> Option<usize> {
    match byte {
        b'0'..=b'9' => Some((byte - b'0') as usize),
        b'a'..=b'f' => Some((byte - b'a' + 10) as usize),
        b'A'..=b'F' => Some((byte - b'A' + 10) as usize),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_own_maps() {
        let mut maps = MapsFile::open().expect("maps must be readable");
        let mut count = 0;
        let mut saw_writable = false;
        while let Some(region) = maps.next_region() {
            assert!(region.end > region.start, "{:x}-{:x}", region.start, region.end);
            saw_writable |= region.writable;
            count += 1;
        }
        // Every process has at least its own text, stack, and some data.
        assert!(count > 3);
        assert!(saw_writable);
    }

    #[test]
    fn finds_a_known_mapping() {
        unsafe {
            let size = crate::util::PAGE_SIZE * 8;
            let mem = super::super::linux::map_anonymous(size);
            assert!(!mem.is_null());
            mem.write(1);

            let mut maps = MapsFile::open().unwrap();
            let mut found = false;
            while let Some(region) = maps.next_region() {
                if region.start <= mem as usize && (mem as usize) < region.end {
                    assert!(region.readable && region.writable && !region.executable);
                    assert!(region.private);
                    found = true;
                }
            }
            assert!(found, "anonymous mapping must appear in maps");

            super::super::linux::unmap(mem, size);
        }
    }
}
