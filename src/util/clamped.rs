/// Integer counter that never leaves `[min, max]`
///
/// Used by the housekeeper to steer how large a share of pages it prepares
/// for reclaim: pressure nudges the value up, idle turns nudge it down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClampedCounter {
    value: u32,
    min: u32,
    max: u32,
}

impl ClampedCounter {
    /// Create a counter starting at `initial`, clamped into `[min, max]`
    pub fn new(initial: u32, min: u32, max: u32) -> Self {
        assert!(min <= max, "min(={min}) must be <= max(={max})");
        Self {
            value: initial.clamp(min, max),
            min,
            max,
        }
    }

    pub fn get(&self) -> u32 {
        self.value
    }

    pub fn min(&self) -> u32 {
        self.min
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    /// Increment by one; returns false if already at `max`
    pub fn increment(&mut self) -> bool {
        if self.value < self.max {
            self.value += 1;
            true
        } else {
            false
        }
    }

    /// Decrement by one; returns false if already at `min`
    pub fn decrement(&mut self) -> bool {
        if self.value > self.min {
            self.value -= 1;
            true
        } else {
            false
        }
    }

    /// Set a new value, clamped into the bounds; returns the stored value
    pub fn set(&mut self, value: u32) -> u32 {
        self.value = value.clamp(self.min, self.max);
        self.value
    }
}
