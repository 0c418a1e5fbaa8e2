/* Key-state machinery shared by the bitfield drivers: grouped key bitmaps
 * (routing keys, sensor strips) and the 64-bit function-key set, with the
 * snapshot-on-press / emit-on-release discipline. */

/* One bit per key, packed eight to a byte in reading order. */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyGroup {
    bits: Vec<u8>,
    count: usize,
}

fn group_size(count: usize) -> usize {
    count.div_ceil(8)
}

impl KeyGroup {
    pub fn new(count: usize) -> Self {
        Self {
            bits: vec![0; group_size(count)],
            count,
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn clear(&mut self) {
        self.bits.fill(0);
    }

    /* Grow or shrink to a new key count, clearing every bit at or past
     * the new count. Used when the device announces a new cell count. */
    pub fn resize(&mut self, count: usize) {
        self.bits.resize(group_size(count), 0);
        self.count = count;
        let partial = count % 8;
        if partial != 0 {
            if let Some(last) = self.bits.last_mut() {
                *last &= (1 << partial) - 1;
            }
        }
    }

    /* Returns true iff the bit actually changed. */
    pub fn set(&mut self, number: usize, press: bool) -> bool {
        let byte = &mut self.bits[number / 8];
        let bit = 1 << (number % 8);
        if (*byte & bit != 0) == press {
            return false;
        }
        if press {
            *byte |= bit;
        } else {
            *byte &= !bit;
        }
        true
    }

    pub fn is_set(&self, number: usize) -> bool {
        self.bits[number / 8] & (1 << (number % 8)) != 0
    }

    /* Rebuild the group so that only `key` is down. Device protocols that
     * report a single one-based sensor index use 0 for "none". */
    pub fn set_only(&mut self, key: u8) {
        self.clear();
        if key > 0 {
            let number = usize::from(key - 1);
            if number < self.count {
                self.set(number, true);
            }
        }
    }

    /* Replace the group from a device bitmap. Sets *pressed when a bit
     * rose; returns true when anything changed. */
    pub fn update_from(&mut self, new: &[u8], pressed: &mut bool) -> bool {
        let mut changed = false;
        let size = self.bits.len().min(new.len());
        for (old, new) in self.bits[..size].iter_mut().zip(&new[..size]) {
            if *new != *old {
                changed = true;
                if *new & !*old != 0 {
                    *pressed = true;
                }
                *old = *new;
            }
        }
        changed
    }

    /* Numbers of all pressed keys, ascending. */
    pub fn numbers(&self) -> Vec<u8> {
        let mut numbers = Vec::new();
        for (index, byte) in self.bits.iter().enumerate() {
            if *byte == 0 {
                continue;
            }
            for bit in 0..8 {
                if byte & (1 << bit) != 0 {
                    numbers.push((index * 8 + bit) as u8);
                }
            }
        }
        numbers
    }

    /* First pressed key, for sensor strips that act on one position. */
    pub fn first(&self) -> Option<u8> {
        self.numbers().first().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|byte| *byte == 0)
    }

    pub fn raw(&self) -> &[u8] {
        &self.bits
    }
}

/* Up to 64 function keys as a plain bitset. */
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FunctionKeys(pub u64);

impl FunctionKeys {
    /* Merge the keys covered by `mask` into the set. Sets *pressed when a
     * bit rose; returns true when the set changed. */
    pub fn update_masked(&mut self, mask: u64, keys: u64, pressed: &mut bool) -> bool {
        let merged = keys | (self.0 & !mask);
        if merged == self.0 {
            return false;
        }
        if merged & !self.0 != 0 {
            *pressed = true;
        }
        self.0 = merged;
        true
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_reports_change() {
        let mut group = KeyGroup::new(40);
        assert!(group.set(5, true));
        assert!(!group.set(5, true));
        assert!(group.set(5, false));
        assert!(!group.set(5, false));
    }

    #[test]
    fn test_numbers_ascending() {
        let mut group = KeyGroup::new(40);
        group.set(10, true);
        group.set(5, true);
        group.set(33, true);
        assert_eq!(group.numbers(), vec![5, 10, 33]);
    }

    #[test]
    fn test_set_only_one_based() {
        let mut group = KeyGroup::new(27);
        group.set(3, true);
        group.set_only(6);
        assert_eq!(group.numbers(), vec![5]);
        group.set_only(0);
        assert!(group.is_empty());
    }

    #[test]
    fn test_update_from_detects_press_edge() {
        let mut group = KeyGroup::new(16);
        let mut pressed = false;
        assert!(group.update_from(&[0x04, 0x00], &mut pressed));
        assert!(pressed);

        /* A release alone changes the group without a press edge. */
        pressed = false;
        assert!(group.update_from(&[0x00, 0x00], &mut pressed));
        assert!(!pressed);
    }

    #[test]
    fn test_resize_clears_out_of_range_bits() {
        let mut group = KeyGroup::new(80);
        group.set(75, true);
        group.set(41, true);
        group.resize(44);
        assert_eq!(group.numbers(), vec![41]);
        assert_eq!(group.count(), 44);
    }

    #[test]
    fn test_function_keys_masked_update() {
        let mut keys = FunctionKeys::default();
        let mut pressed = false;
        assert!(keys.update_masked(0xFF, 0x03, &mut pressed));
        assert!(pressed);

        /* An update in a different byte keeps the first byte intact. */
        pressed = false;
        assert!(keys.update_masked(0xFF << 8, 0x01 << 8, &mut pressed));
        assert_eq!(keys.0, 0x0103);

        /* Releasing within the mask is a change but not a press. */
        pressed = false;
        assert!(keys.update_masked(0xFF, 0x01, &mut pressed));
        assert!(!pressed);
    }
}
