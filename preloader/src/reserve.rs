//! Fixed address-space reservation.
//!
//! The loader claims a static set of address ranges with no-access mappings
//! before the dynamic linker or the target image get a chance to allocate
//! there. One extra range can be supplied through `WINEPRELOADRESERVE`.
//!
//! The table itself is part of the hand-off ABI: the downstream program
//! receives a pointer to it through its `wine_main_preload_info` object and
//! walks it as a zero-terminated `{ addr, size }` array, so the layout must
//! stay exactly that.

use core::cell::UnsafeCell;

use log::warn;

use crate::context::LoaderContext;
use crate::syscall::{self, MapFlags, Prot};

/// One reserved span of address space. `size == 0` terminates the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct PreloadRange {
    pub addr: usize,
    pub size: usize,
}

impl PreloadRange {
    pub const fn new(addr: usize, size: usize) -> Self {
        Self { addr, size }
    }

    pub const fn empty() -> Self {
        Self { addr: 0, size: 0 }
    }

    pub fn end(&self) -> usize {
        self.addr + self.size
    }
}

/// Ranges below this boundary are the low-memory set a user range must not
/// intrude on.
const LOW_RANGE_LIMIT: usize = 0x0011_0000;

/// Reservation failures below this address are expected on hardened kernels
/// (mmap_min_addr) and not worth a warning.
const WARN_THRESHOLD: usize = 0x0001_0000;

#[cfg(target_pointer_width = "32")]
const DEFAULT_RANGES: [PreloadRange; 5] = [
    PreloadRange::new(0x0000_0000, 0x0000_1000), // first page
    PreloadRange::new(0x0000_1000, 0x0000_f000), // rest of the low 64k
    PreloadRange::new(0x0001_0000, 0x0010_0000), // DOS area
    PreloadRange::new(0x0011_0000, 0x67ef_0000), // low memory area
    PreloadRange::new(0x7f00_0000, 0x0300_0000), // top-down allocations + shared heap
];

#[cfg(target_pointer_width = "64")]
const DEFAULT_RANGES: [PreloadRange; 4] = [
    PreloadRange::new(0x0000_0001_0000, 0x0010_0000), // DOS area
    PreloadRange::new(0x0000_0011_0000, 0x67ef_0000), // low memory area
    PreloadRange::new(0x0000_7ffe_0000, 0x0001_0000), // shared user data
    PreloadRange::new(0x7fff_fe00_0000, 0x01ff_0000), // top-down allocations + virtual heap
];

/// Default ranges, one slot for the user range, one terminator.
pub const TABLE_CAPACITY: usize = DEFAULT_RANGES.len() + 2;

/// The process-wide reservation table.
///
/// This is deliberately a bare `#[repr(C)]` array in static storage rather
/// than anything richer: its address outlives the loader and is read by the
/// downstream program long after hand-off.
pub struct RangeTable(UnsafeCell<[PreloadRange; TABLE_CAPACITY]>);

// SAFETY: there is exactly one thread for the whole life of the loader, and
// after hand-off the loader never runs again.
unsafe impl Sync for RangeTable {}

pub static PRELOAD_TABLE: RangeTable = RangeTable::with_defaults();

impl RangeTable {
    const fn with_defaults() -> Self {
        let mut ranges = [PreloadRange::empty(); TABLE_CAPACITY];
        let mut i = 0;
        while i < DEFAULT_RANGES.len() {
            ranges[i] = DEFAULT_RANGES[i];
            i += 1;
        }
        Self(UnsafeCell::new(ranges))
    }

    /// Address of the live table, for the hand-off symbol.
    pub fn base(&self) -> *mut PreloadRange {
        self.0.get() as *mut PreloadRange
    }

    /// # Safety
    /// The caller must be the only code touching the table; true by the
    /// single-thread rule as long as the reference is not kept across
    /// hand-off.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn ranges_mut(&self) -> &mut [PreloadRange; TABLE_CAPACITY] {
        // SAFETY: exclusivity guaranteed by the caller.
        unsafe { &mut *self.0.get() }
    }
}

/// Parse a `HEXSTART-HEXEND` reservation spec. Start is rounded down to a
/// page, end up. Returns `Ok(None)` for `0` (or an empty/backwards range),
/// `Err(())` for anything malformed.
pub fn parse_reserve_spec(spec: &[u8], page_mask: usize) -> Result<Option<PreloadRange>, ()> {
    let mut value: usize = 0;
    let mut start = None;

    for &b in spec {
        let digit = match b {
            b'0'..=b'9' => (b - b'0') as usize,
            b'a'..=b'f' => (b - b'a') as usize + 10,
            b'A'..=b'F' => (b - b'A') as usize + 10,
            b'-' if start.is_none() => {
                start = Some(value & !page_mask);
                value = 0;
                continue;
            }
            _ => return Err(()),
        };
        value = value.wrapping_shl(4).wrapping_add(digit);
    }

    match start {
        Some(s) => {
            let end = value.wrapping_add(page_mask) & !page_mask;
            if end <= s {
                Ok(None)
            } else {
                Ok(Some(PreloadRange::new(s, end - s)))
            }
        }
        // A single `0` (or nothing at all) means no reservation.
        None if value == 0 => Ok(None),
        None => Err(()),
    }
}

/// Sanitize the user range against the loader image and the low static
/// ranges, then append it to the table.
pub fn apply_user_range(
    ranges: &mut [PreloadRange],
    ctx: &LoaderContext,
    range: PreloadRange,
) {
    let mut start = range.addr;
    let end = range.end();

    if ctx.overlaps_loader(start, end) {
        warn!(
            "reserve range {:#x}-{:#x} overlaps the loader {:#x}-{:#x}, ignored",
            start, end, ctx.loader_start, ctx.loader_end
        );
        return;
    }

    // Push the start above any low range it intrudes on; a range that ends
    // inside the low set is swallowed whole.
    for r in ranges.iter() {
        if r.size == 0 || r.addr > LOW_RANGE_LIMIT {
            break;
        }
        if end <= r.end() {
            return;
        }
        if start < r.end() {
            start = r.end();
        }
    }

    let slot = ranges
        .iter()
        .position(|r| r.size == 0)
        .expect("reservation table is always terminated");
    // The slot before the final terminator is reserved for exactly this.
    assert!(slot + 1 < ranges.len(), "reservation table overflow");
    ranges[slot] = PreloadRange::new(start, end - start);
}

/// Drop entry `i`, shifting the tail (terminator included) down.
fn remove_range(ranges: &mut [PreloadRange], mut i: usize) {
    while ranges[i].size != 0 {
        ranges[i] = ranges[i + 1];
        i += 1;
    }
}

/// Is `addr` inside one of the listed ranges?
pub fn is_addr_reserved(ranges: &[PreloadRange], addr: usize) -> bool {
    for r in ranges.iter() {
        if r.size == 0 {
            break;
        }
        if addr >= r.addr && addr < r.end() {
            return true;
        }
    }
    false
}

/// Claim every listed range with a no-access mapping.
///
/// A range that covers the live part of the incoming stack
/// (`[stack_low, stack_high]`, i.e. argc up to the auxv) is dropped without
/// touching it; a range the kernel refuses is dropped with a warning unless
/// it sits in the low 64k, where refusal is the expected mmap_min_addr
/// behavior.
///
/// # Safety
/// The listed ranges must not cover anything the process still needs; a
/// fixed mapping replaces whatever was there.
pub unsafe fn reserve_ranges(
    ranges: &mut [PreloadRange],
    stack_low: usize,
    stack_high: usize,
) {
    let mut i = 0;
    while ranges[i].size != 0 {
        let r = ranges[i];
        if stack_high >= r.addr && stack_low <= r.end() {
            remove_range(ranges, i);
            continue;
        }

        // SAFETY: the range holds nothing of ours (the stack was just
        // checked, the loader image is disjoint by construction).
        let mapped = unsafe {
            syscall::mmap(
                r.addr,
                r.size,
                Prot::empty(),
                MapFlags::PRIVATE | MapFlags::FIXED | MapFlags::ANONYMOUS | MapFlags::NORESERVE,
                -1,
                0,
            )
        };
        match mapped {
            Ok(_) => i += 1,
            Err(_) => {
                if r.addr >= WARN_THRESHOLD {
                    warn!("failed to reserve range {:#x}-{:#x}", r.addr, r.end());
                }
                remove_range(ranges, i);
            }
        }
    }
}

/// Re-protect the page just under 2 GiB as readable+executable when it was
/// reserved, to neutralise no-exec schemes that manipulate the code-segment
/// limit.
#[cfg(target_arch = "x86")]
pub fn protect_exec_top_page(ranges: &[PreloadRange], ctx: &LoaderContext) {
    let top = 0x8000_0000usize - ctx.page_size;
    if is_addr_reserved(ranges, top) {
        // SAFETY: the page belongs to a reservation this process just made.
        let _ = unsafe { syscall::mprotect(top, ctx.page_size, Prot::READ | Prot::EXEC) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE_MASK: usize = 0xfff;

    fn test_ctx() -> LoaderContext {
        LoaderContext::new(0x1000, 0x7c40_0000, 0x7c50_0000)
    }

    fn test_table() -> [PreloadRange; TABLE_CAPACITY] {
        // SAFETY: single-threaded test, and the table value is copied out.
        let table = *unsafe { PRELOAD_TABLE.ranges_mut() };
        table
    }

    #[test]
    fn parses_a_simple_range() {
        let r = parse_reserve_spec(b"10000-20000", PAGE_MASK)
            .unwrap()
            .unwrap();
        assert_eq!(r.addr, 0x10000);
        assert_eq!(r.size, 0x10000);
    }

    #[test]
    fn rounds_to_page_granularity() {
        let r = parse_reserve_spec(b"10123-1ffff", PAGE_MASK).unwrap().unwrap();
        assert_eq!(r.addr, 0x10000);
        assert_eq!(r.end(), 0x20000);
    }

    #[test]
    fn accepts_mixed_case_digits() {
        let r = parse_reserve_spec(b"A000-F000", PAGE_MASK).unwrap().unwrap();
        assert_eq!(r.addr, 0xa000);
        assert_eq!(r.end(), 0xf000);
    }

    #[test]
    fn zero_means_no_range() {
        assert_eq!(parse_reserve_spec(b"0", PAGE_MASK), Ok(None));
        assert_eq!(parse_reserve_spec(b"", PAGE_MASK), Ok(None));
    }

    #[test]
    fn backwards_range_collapses_to_none() {
        assert_eq!(parse_reserve_spec(b"20000-10000", PAGE_MASK), Ok(None));
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(parse_reserve_spec(b"zzz", PAGE_MASK), Err(()));
        assert_eq!(parse_reserve_spec(b"10000-20000-30000", PAGE_MASK), Err(()));
        assert_eq!(parse_reserve_spec(b"1", PAGE_MASK), Err(()));
    }

    #[test]
    fn user_range_lands_before_the_terminator() {
        let mut table = test_table();
        let user = PreloadRange::new(0x7800_0000, 0x10000);
        apply_user_range(&mut table, &test_ctx(), user);
        let slot = DEFAULT_RANGES.len();
        assert_eq!(table[slot], user);
        assert_eq!(table[slot + 1], PreloadRange::empty());
    }

    #[test]
    fn user_range_overlapping_loader_is_ignored() {
        let mut table = test_table();
        apply_user_range(
            &mut table,
            &test_ctx(),
            PreloadRange::new(0x7c40_0000, 0x10000),
        );
        assert_eq!(table[DEFAULT_RANGES.len()], PreloadRange::empty());
    }

    #[test]
    fn user_range_inside_low_memory_is_swallowed() {
        let mut table = test_table();
        // Entirely below the end of the low-memory set.
        apply_user_range(&mut table, &test_ctx(), PreloadRange::new(0x20000, 0x1000));
        assert_eq!(table[DEFAULT_RANGES.len()], PreloadRange::empty());
    }

    #[test]
    fn user_range_is_truncated_above_low_memory() {
        let mut table = test_table();
        let low_end = table
            .iter()
            .take_while(|r| r.size != 0)
            .filter(|r| r.addr <= LOW_RANGE_LIMIT)
            .map(|r| r.end())
            .max()
            .unwrap();
        // Straddles the low set and reaches past it.
        let end = low_end + 0x0100_0000;
        apply_user_range(
            &mut table,
            &test_ctx(),
            PreloadRange::new(0x10_0000, end - 0x10_0000),
        );
        let stored = table[DEFAULT_RANGES.len()];
        assert_eq!(stored.addr, low_end);
        assert_eq!(stored.end(), end);
    }

    #[test]
    fn removal_shifts_the_tail() {
        let mut table = [
            PreloadRange::new(0x1000, 0x1000),
            PreloadRange::new(0x3000, 0x1000),
            PreloadRange::new(0x5000, 0x1000),
            PreloadRange::empty(),
        ];
        remove_range(&mut table, 1);
        assert_eq!(table[0], PreloadRange::new(0x1000, 0x1000));
        assert_eq!(table[1], PreloadRange::new(0x5000, 0x1000));
        assert_eq!(table[2].size, 0);
    }

    #[test]
    fn stack_collision_drops_the_range_without_mapping() {
        let marker = 0usize;
        let sp = &marker as *const usize as usize;
        let mut table = [
            PreloadRange::new(sp & !PAGE_MASK, 0x1000),
            PreloadRange::empty(),
        ];
        unsafe { reserve_ranges(&mut table, sp, sp + 8) };
        assert_eq!(table[0].size, 0);
    }

    #[test]
    fn reservation_is_visible_in_maps() {
        // Grab an address from the kernel, then let the engine pave the
        // still-held mapping over with the no-access reservation (FIXED
        // replaces it atomically, so nothing can race in between).
        let len = 0x10000;
        let probe = unsafe {
            syscall::mmap(
                0,
                len,
                Prot::READ,
                MapFlags::PRIVATE | MapFlags::ANONYMOUS,
                -1,
                0,
            )
        }
        .expect("probe mmap failed");

        let mut table = [PreloadRange::new(probe, len), PreloadRange::empty()];
        unsafe { reserve_ranges(&mut table, 0, 0) };
        assert_eq!(table[0], PreloadRange::new(probe, len));

        let maps = std::fs::read_to_string("/proc/self/maps").unwrap();
        let line = maps
            .lines()
            .find(|l| l.starts_with(&std::format!("{:x}-{:x} ", probe, probe + len)))
            .expect("reservation not present in /proc/self/maps");
        assert!(line.contains("---p"), "not a no-access mapping: {line}");

        unsafe { syscall::munmap(probe, len) }.unwrap();
    }

    #[test]
    fn is_addr_reserved_respects_bounds() {
        let table = [PreloadRange::new(0x10000, 0x10000), PreloadRange::empty()];
        assert!(is_addr_reserved(&table, 0x10000));
        assert!(is_addr_reserved(&table, 0x1ffff));
        assert!(!is_addr_reserved(&table, 0x20000));
        assert!(!is_addr_reserved(&table, 0xffff));
    }
}
