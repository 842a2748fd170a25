//! Hazardous address generators.

use std::fmt;
use std::ptr;

use super::SandboxError;

/// A class of bad pointer handed to a system call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressHazard {
    /// One byte past an aligned static.
    Unaligned,
    /// A mapped but read-only page.
    ReadOnly,
    Null,
    /// Inside the executable text segment.
    Text,
    /// Last byte of a writable page whose successor is unmapped.
    PageEnd,
    /// All bits set.
    Max,
    /// First byte of a page that was unmapped.
    Unmapped,
}

impl AddressHazard {
    pub const ALL: [AddressHazard; 7] = [
        Self::Unaligned,
        Self::ReadOnly,
        Self::Null,
        Self::Text,
        Self::PageEnd,
        Self::Max,
        Self::Unmapped,
    ];

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Unaligned => "unaligned",
            Self::ReadOnly => "readonly",
            Self::Null => "null",
            Self::Text => "text",
            Self::PageEnd => "page_end",
            Self::Max => "max",
            Self::Unmapped => "unmapped",
        }
    }

    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|h| h.name().eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for AddressHazard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

static ALIGNED_DATA: [u64; 2] = [0; 2];

/// Pages backing the page-relative hazards.
///
/// `ro_page` is one `PROT_READ` page. `rw_page` is a writable page whose successor
/// has been unmapped, so `rw_page + page_size` faults.
#[derive(Debug)]
pub struct HazardPages {
    ro_page: *mut libc::c_void,
    rw_page: *mut libc::c_void,
    page_size: usize,
}

// SAFETY: the pages are only handed to syscalls in forked children; the parent
// never dereferences them.
unsafe impl Send for HazardPages {}
unsafe impl Sync for HazardPages {}

fn map_anon(len: usize, prot: libc::c_int) -> Result<*mut libc::c_void, SandboxError> {
    // SAFETY: anonymous private mapping without address hint; result checked.
    let p = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len,
            prot,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if p == libc::MAP_FAILED {
        return Err(SandboxError::Map(super::last_errno()));
    }
    Ok(p)
}

impl HazardPages {
    pub fn new(page_size: usize) -> Result<Self, SandboxError> {
        let ro_page = map_anon(page_size, libc::PROT_READ)?;
        let rw_page = match map_anon(page_size * 2, libc::PROT_READ | libc::PROT_WRITE) {
            Ok(p) => p,
            Err(err) => {
                // SAFETY: ro_page was mapped above with this length.
                unsafe { libc::munmap(ro_page, page_size) };
                return Err(err);
            }
        };
        // SAFETY: the second page belongs to the mapping made above.
        unsafe {
            libc::munmap(rw_page.cast::<u8>().add(page_size).cast(), page_size);
        }
        Ok(Self {
            ro_page,
            rw_page,
            page_size,
        })
    }

    #[must_use]
    pub fn ro_page(&self) -> *mut libc::c_void {
        self.ro_page
    }

    #[must_use]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// The bad address for `hazard`.
    #[must_use]
    pub fn address(&self, hazard: AddressHazard) -> *mut libc::c_void {
        let rw = self.rw_page as usize;
        let addr = match hazard {
            AddressHazard::Unaligned => ALIGNED_DATA.as_ptr() as usize + 1,
            AddressHazard::ReadOnly => self.ro_page as usize,
            AddressHazard::Null => 0,
            AddressHazard::Text => libc::write as *const () as usize,
            AddressHazard::PageEnd => rw + self.page_size - 1,
            AddressHazard::Max => usize::MAX,
            AddressHazard::Unmapped => rw + self.page_size,
        };
        addr as *mut libc::c_void
    }
}

impl Drop for HazardPages {
    fn drop(&mut self) {
        // SAFETY: both mappings were created in `new`; the second rw page is
        // already gone.
        unsafe {
            libc::munmap(self.ro_page, self.page_size);
            libc::munmap(self.rw_page, self.page_size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip_and_are_unique() {
        for hazard in AddressHazard::ALL {
            assert_eq!(AddressHazard::from_name(hazard.name()), Some(hazard));
        }
        assert_eq!(AddressHazard::from_name("NULL"), Some(AddressHazard::Null));
        assert_eq!(AddressHazard::from_name("bogus"), None);
    }

    #[test]
    fn addresses_have_expected_shape() {
        let page = sysprobe_shm::page_size();
        let pages = HazardPages::new(page).expect("map hazard pages");
        assert!(pages.address(AddressHazard::Null).is_null());
        assert_eq!(pages.address(AddressHazard::Max) as usize, usize::MAX);
        assert_eq!(pages.address(AddressHazard::Unaligned) as usize % 8, 1);
        assert_eq!(pages.address(AddressHazard::ReadOnly), pages.ro_page());
        let end = pages.address(AddressHazard::PageEnd) as usize;
        let unmapped = pages.address(AddressHazard::Unmapped) as usize;
        assert_eq!(end + 1, unmapped);
        assert_eq!(unmapped % page, 0);
    }

    #[test]
    fn page_end_is_writable() {
        let page = sysprobe_shm::page_size();
        let pages = HazardPages::new(page).expect("map hazard pages");
        let end = pages.address(AddressHazard::PageEnd).cast::<u8>();
        // SAFETY: the last byte of the writable page is mapped read-write.
        unsafe {
            end.write(0x5a);
            assert_eq!(end.read(), 0x5a);
        }
    }
}
