/// A contiguous RAM range `[start, end)` backed by bytes at `dest` inside
/// the in-memory binary/overlay buffer currently being patched.
#[derive(Debug, Clone, Copy)]
pub struct SectionData {
    pub start: u32,
    pub end: u32,
    pub dest: usize,
}

/// Translates RAM addresses to offsets into the loaded buffer for the
/// target currently being patched. An address outside every known section
/// is a warning, not an error — writes/reads are skipped.
#[derive(Debug, Default, Clone)]
pub struct SectionMap {
    sections: Vec<SectionData>,
}

impl SectionMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, section: SectionData) {
        self.sections.push(section);
    }

    fn find(&self, address: u32, size: u32) -> Option<&SectionData> {
        self.sections.iter().find(|s| address >= s.start && address.checked_add(size).is_some_and(|end| end <= s.end))
    }

    pub fn translate(&self, address: u32, size: u32) -> Option<usize> {
        self.find(address, size).map(|s| s.dest + (address - s.start) as usize)
    }

    pub fn write(&self, buffer: &mut [u8], address: u32, bytes: &[u8]) -> bool {
        match self.translate(address, bytes.len() as u32) {
            Some(offset) if offset + bytes.len() <= buffer.len() => {
                buffer[offset..offset + bytes.len()].copy_from_slice(bytes);
                true
            }
            _ => {
                log::warn!("address 0x{address:08x} is not mapped by any known section, skipping write");
                false
            }
        }
    }

    pub fn write_word(&self, buffer: &mut [u8], address: u32, value: u32) -> bool {
        self.write(buffer, address, &value.to_le_bytes())
    }

    pub fn write_halfword(&self, buffer: &mut [u8], address: u32, value: u16) -> bool {
        self.write(buffer, address, &value.to_le_bytes())
    }

    pub fn read_word(&self, buffer: &[u8], address: u32) -> Option<u32> {
        let offset = self.translate(address, 4)?;
        buffer.get(offset..offset + 4).map(|b| u32::from_le_bytes(b.try_into().unwrap()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_translate_and_write() {
        let mut map = SectionMap::new();
        map.add(SectionData { start: 0x0200_1000, end: 0x0200_2000, dest: 0x100 });
        let mut buffer = vec![0u8; 0x2000];
        assert!(map.write_word(&mut buffer, 0x0200_1004, 0xDEAD_BEEF));
        assert_eq!(map.read_word(&buffer, 0x0200_1004), Some(0xDEAD_BEEF));
    }

    #[test]
    fn test_out_of_range_is_skipped_not_panicking() {
        let map = SectionMap::new();
        let mut buffer = vec![0u8; 0x10];
        assert!(!map.write_word(&mut buffer, 0x0200_1000, 42));
    }
}
