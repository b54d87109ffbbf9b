use byteorder::{ByteOrder, LE};
use snafu::Snafu;

pub const OVERLAY_ENTRY_SIZE: usize = 32;
pub const FLAG_COMPRESSED: u32 = 1 << 24;
pub const FLAG_VERIFY: u32 = 1 << 25;

#[derive(Debug, Snafu)]
pub enum OverlayError {
    #[snafu(display("overlay table is truncated"))]
    Truncated,
    #[snafu(display("overlay table size is not a multiple of {OVERLAY_ENTRY_SIZE}"))]
    Misaligned,
}

/// One 32-byte overlay-table record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverlayEntry {
    pub overlay_id: u32,
    pub ram_start: u32,
    pub ram_size: u32,
    pub bss_size: u32,
    pub static_init_start: u32,
    pub static_init_end: u32,
    pub file_id: u32,
    pub flags: u32,
}

impl OverlayEntry {
    pub fn is_compressed(&self) -> bool {
        self.flags & FLAG_COMPRESSED != 0
    }

    pub fn verify_flag(&self) -> bool {
        self.flags & FLAG_VERIFY != 0
    }

    pub fn file_size(&self) -> u32 {
        self.flags & 0x00FF_FFFF
    }

    fn read(bytes: &[u8]) -> Self {
        Self {
            overlay_id: LE::read_u32(&bytes[0..4]),
            ram_start: LE::read_u32(&bytes[4..8]),
            ram_size: LE::read_u32(&bytes[8..12]),
            bss_size: LE::read_u32(&bytes[12..16]),
            static_init_start: LE::read_u32(&bytes[16..20]),
            static_init_end: LE::read_u32(&bytes[20..24]),
            file_id: LE::read_u32(&bytes[24..28]),
            flags: LE::read_u32(&bytes[28..32]),
        }
    }

    fn write(&self, bytes: &mut [u8]) {
        LE::write_u32(&mut bytes[0..4], self.overlay_id);
        LE::write_u32(&mut bytes[4..8], self.ram_start);
        LE::write_u32(&mut bytes[8..12], self.ram_size);
        LE::write_u32(&mut bytes[12..16], self.bss_size);
        LE::write_u32(&mut bytes[16..20], self.static_init_start);
        LE::write_u32(&mut bytes[20..24], self.static_init_end);
        LE::write_u32(&mut bytes[24..28], self.file_id);
        LE::write_u32(&mut bytes[28..32], self.flags);
    }

    /// Clears the compressed flag and rewrites the low 24 bits of `flags` to
    /// the given (final, on-disk) file size — the mutation applied on save.
    pub fn finalize_for_save(&mut self, new_file_size: u32) {
        self.flags &= !FLAG_COMPRESSED;
        self.flags = (self.flags & 0xFF00_0000) | (new_file_size & 0x00FF_FFFF);
    }
}

/// Parses the overlay table from `arm7ovt.bin`/`arm9ovt.bin`.
pub fn load_overlay_table(data: &[u8]) -> Result<Vec<OverlayEntry>, OverlayError> {
    if data.len() % OVERLAY_ENTRY_SIZE != 0 {
        return MisalignedSnafu.fail();
    }
    Ok(data.chunks_exact(OVERLAY_ENTRY_SIZE).map(OverlayEntry::read).collect())
}

/// Serializes the overlay table back to bytes, ARM7's table preceding
/// ARM9's when both are concatenated is a caller concern (they are
/// separate files); this only encodes one table.
pub fn save_overlay_table(entries: &[OverlayEntry]) -> Vec<u8> {
    let mut bytes = vec![0u8; entries.len() * OVERLAY_ENTRY_SIZE];
    for (entry, chunk) in entries.iter().zip(bytes.chunks_exact_mut(OVERLAY_ENTRY_SIZE)) {
        entry.write(chunk);
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entry() -> OverlayEntry {
        OverlayEntry {
            overlay_id: 3,
            ram_start: 0x021F_0000,
            ram_size: 0x1000,
            bss_size: 0x80,
            static_init_start: 0x021F_0F00,
            static_init_end: 0x021F_0F10,
            file_id: 42,
            flags: FLAG_COMPRESSED | 0x1234,
        }
    }

    #[test]
    fn test_round_trip_single_entry() {
        let entry = sample_entry();
        let bytes = save_overlay_table(std::slice::from_ref(&entry));
        assert_eq!(bytes.len(), OVERLAY_ENTRY_SIZE);
        let parsed = load_overlay_table(&bytes).unwrap();
        assert_eq!(parsed, vec![entry]);
    }

    // Invariant 7: compressed overlays have bit 24 cleared on save.
    #[test]
    fn test_finalize_clears_compressed_flag() {
        let mut entry = sample_entry();
        assert!(entry.is_compressed());
        entry.finalize_for_save(0x2000);
        assert!(!entry.is_compressed());
        assert_eq!(entry.file_size(), 0x2000);
    }

    #[test]
    fn test_misaligned_table_rejected() {
        assert!(load_overlay_table(&[0u8; 17]).is_err());
    }
}
