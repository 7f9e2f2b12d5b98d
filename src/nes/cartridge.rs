use std::{fs, path::Path};

use super::error::NesError;
use super::mapper::Mirroring;

/// A parsed iNES v1 ROM image, ready to be handed to a mapper.
#[derive(Debug, Clone)]
pub struct Cartridge {
    pub mapper_id: u16,
    pub mirroring: Mirroring,
    pub four_screen: bool,
    pub has_battery_backed_ram: bool,
    pub prg_rom: Vec<u8>,
    pub chr_data: Vec<u8>,
    pub chr_is_ram: bool,
    pub prg_ram_size: usize,
}

impl Cartridge {
    pub fn from_file(path: &Path) -> Result<Self, NesError> {
        let bytes = fs::read(path)?;
        Self::from_bytes(&bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, NesError> {
        if bytes.len() < 16 {
            return Err(NesError::CartridgeFormat(
                "file too small to contain an iNES header".into(),
            ));
        }
        if &bytes[0..4] != b"NES\x1A" {
            return Err(NesError::CartridgeFormat(
                "invalid iNES header magic, expected NES<EOF>".into(),
            ));
        }

        let flags6 = bytes[6];
        let flags7 = bytes[7];

        let mapper_id = ((flags6 as u16) >> 4) | ((flags7 as u16) & 0xF0);
        let four_screen = (flags6 & 0x08) != 0;
        let mirroring = if four_screen {
            Mirroring::FourScreen
        } else if (flags6 & 0x01) != 0 {
            Mirroring::Vertical
        } else {
            Mirroring::Horizontal
        };

        let trainer_present = (flags6 & 0x04) != 0;
        let has_battery_backed_ram = (flags6 & 0x02) != 0;

        let prg_units = (bytes[4] as usize).max(1);
        let chr_units = bytes[5] as usize;
        let prg_ram_units = if bytes[8] == 0 { 1 } else { bytes[8] as usize };

        let prg_rom_size = prg_units * 16 * 1024;
        let chr_rom_size = chr_units * 8 * 1024;
        let prg_ram_size = prg_ram_units * 8 * 1024;

        let mut cursor = 16usize;
        if trainer_present {
            // 512-byte trainer sits between the header and PRG; nothing in it
            // is relevant to mappers 0-4.
            cursor += 512;
        }

        if bytes.len() < cursor + prg_rom_size {
            return Err(NesError::CartridgeFormat(format!(
                "ROM truncated: expected {prg_rom_size} PRG bytes but file ended early"
            )));
        }

        let prg_rom_end = cursor + prg_rom_size;
        let prg_rom = bytes[cursor..prg_rom_end].to_vec();
        cursor = prg_rom_end;

        let (chr_data, chr_is_ram) = if chr_rom_size == 0 {
            (vec![0; 8 * 1024], true)
        } else {
            if bytes.len() < cursor + chr_rom_size {
                return Err(NesError::CartridgeFormat(format!(
                    "ROM truncated: expected {chr_rom_size} CHR bytes but file ended early"
                )));
            }
            (bytes[cursor..cursor + chr_rom_size].to_vec(), false)
        };

        log::debug!(
            "parsed iNES image: mapper {mapper_id}, {}K PRG, {}K CHR{}, {:?} mirroring",
            prg_rom.len() / 1024,
            chr_data.len() / 1024,
            if chr_is_ram { " (RAM)" } else { "" },
            mirroring
        );

        Ok(Self {
            mapper_id,
            mirroring,
            four_screen,
            has_battery_backed_ram,
            prg_rom,
            chr_data,
            chr_is_ram,
            prg_ram_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_ines(prg_units: u8, chr_units: u8, flags6: u8) -> Vec<u8> {
        let mut rom = Vec::new();
        rom.extend_from_slice(b"NES\x1A");
        rom.push(prg_units);
        rom.push(chr_units);
        rom.push(flags6);
        rom.extend_from_slice(&[0; 9]);
        rom.extend(std::iter::repeat(0xAA).take(prg_units as usize * 16 * 1024));
        rom.extend(std::iter::repeat(0x55).take(chr_units as usize * 8 * 1024));
        rom
    }

    #[test]
    fn parses_minimal_nrom_image() {
        let cart = Cartridge::from_bytes(&build_ines(1, 1, 0x00)).unwrap();
        assert_eq!(cart.mapper_id, 0);
        assert_eq!(cart.prg_rom.len(), 16 * 1024);
        assert_eq!(cart.chr_data.len(), 8 * 1024);
        assert!(!cart.chr_is_ram);
        assert_eq!(cart.mirroring, Mirroring::Horizontal);
    }

    #[test]
    fn zero_chr_units_allocates_chr_ram() {
        let cart = Cartridge::from_bytes(&build_ines(1, 0, 0x01)).unwrap();
        assert!(cart.chr_is_ram);
        assert_eq!(cart.chr_data.len(), 8 * 1024);
        assert_eq!(cart.mirroring, Mirroring::Vertical);
    }

    #[test]
    fn mapper_id_combines_both_header_nibbles() {
        let mut rom = build_ines(1, 1, 0x40);
        rom[7] = 0x30;
        let cart = Cartridge::from_bytes(&rom).unwrap();
        assert_eq!(cart.mapper_id, 0x34);
    }

    #[test]
    fn trainer_is_skipped() {
        let mut rom = Vec::new();
        rom.extend_from_slice(b"NES\x1A");
        rom.extend_from_slice(&[1, 1, 0x04, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        rom.extend(std::iter::repeat(0xFF).take(512));
        rom.extend(std::iter::repeat(0xAA).take(16 * 1024));
        rom.extend(std::iter::repeat(0x55).take(8 * 1024));
        let cart = Cartridge::from_bytes(&rom).unwrap();
        assert_eq!(cart.prg_rom[0], 0xAA);
        assert_eq!(cart.chr_data[0], 0x55);
    }

    #[test]
    fn rejects_short_file_and_bad_magic() {
        assert!(matches!(
            Cartridge::from_bytes(&[0; 8]),
            Err(NesError::CartridgeFormat(_))
        ));
        let mut rom = build_ines(1, 1, 0);
        rom[0] = b'X';
        assert!(matches!(
            Cartridge::from_bytes(&rom),
            Err(NesError::CartridgeFormat(_))
        ));
    }

    #[test]
    fn rejects_truncated_prg_body() {
        let mut rom = build_ines(2, 0, 0);
        rom.truncate(16 + 20 * 1024);
        assert!(matches!(
            Cartridge::from_bytes(&rom),
            Err(NesError::CartridgeFormat(_))
        ));
    }

    #[test]
    fn four_screen_flag_wins_over_mirroring_bit() {
        let cart = Cartridge::from_bytes(&build_ines(1, 1, 0x09)).unwrap();
        assert_eq!(cart.mirroring, Mirroring::FourScreen);
        assert!(cart.four_screen);
    }
}
