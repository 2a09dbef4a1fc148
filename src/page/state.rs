/// Lifecycle state of a page, in the only order transitions may follow
///
/// The single way back is LOADING -> NOT_READY_YET, taken when a load fails.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PageState {
    /// Slot allocated, content not loaded
    NotReadyYet = 0,
    /// Content being loaded by the one thread that won the transition
    Loading = 1,
    /// Content present, may be acquired
    Usable = 2,
    /// Chosen for reclaim: no new acquisitions, current users may finish
    AboutToUnmap = 3,
    /// No users left, buffer about to be flushed and detached
    PreTombstone = 4,
    /// Terminal: slot kept only for probing until the directory is rehashed
    Tombstone = 5,
}

const STATES: [PageState; 6] = [
    PageState::NotReadyYet,
    PageState::Loading,
    PageState::Usable,
    PageState::AboutToUnmap,
    PageState::PreTombstone,
    PageState::Tombstone,
];

const STATE_SHIFT: u32 = 24;

/// Low bits of the packed word hold the usage count
pub(crate) const USAGE_COUNT_MASK: u32 = 0x00FF_FFFF;

/// Largest number of concurrent acquisitions of one page
pub const MAX_USAGE_COUNT: u32 = USAGE_COUNT_MASK;

impl PageState {
    /// True for states in which the page holds a buffer that may be accessed
    pub fn allows_access(self) -> bool {
        matches!(self, PageState::Usable | PageState::AboutToUnmap)
    }
}

/// Pack `(state, usage_count)` into one word
#[inline]
pub(crate) fn pack(state: PageState, usage_count: u32) -> u32 {
    debug_assert!(usage_count <= USAGE_COUNT_MASK);
    ((state as u32) << STATE_SHIFT) | (usage_count & USAGE_COUNT_MASK)
}

#[inline]
pub(crate) fn unpack_state(word: u32) -> PageState {
    let bits = (word >> STATE_SHIFT) as usize;
    match STATES.get(bits) {
        Some(&state) => state,
        None => panic!("Bug: packed page word {word:#010x} carries unknown state {bits}"),
    }
}

#[inline]
pub(crate) fn unpack_usage(word: u32) -> u32 {
    word & USAGE_COUNT_MASK
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_unpack_every_state() {
        for state in STATES {
            for usage in [0, 1, 1000, MAX_USAGE_COUNT] {
                let word = pack(state, usage);
                assert_eq!(unpack_state(word), state);
                assert_eq!(unpack_usage(word), usage);
            }
        }
    }

    #[test]
    fn test_states_are_ordered() {
        assert!(PageState::NotReadyYet < PageState::Loading);
        assert!(PageState::Loading < PageState::Usable);
        assert!(PageState::Usable < PageState::AboutToUnmap);
        assert!(PageState::AboutToUnmap < PageState::PreTombstone);
        assert!(PageState::PreTombstone < PageState::Tombstone);

        assert!(PageState::Usable.allows_access());
        assert!(PageState::AboutToUnmap.allows_access());
        assert!(!PageState::PreTombstone.allows_access());
    }

    #[test]
    #[should_panic(expected = "unknown state")]
    fn test_garbage_word_panics() {
        unpack_state(0xFF00_0000);
    }
}
