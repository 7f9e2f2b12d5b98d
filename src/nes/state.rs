use serde::{Deserialize, Serialize};

use super::apu::ApuState;
use super::controller::ControllerState;
use super::cpu::CpuState;
use super::error::NesError;
use super::ppu::PpuState;
use super::Bus;
use super::mapper::MapperState;

const STATE_MAGIC: [u8; 4] = *b"FCSS";
const STATE_VERSION: u32 = 1;

/// Everything needed to reconstitute a running machine, minus the ROM
/// itself: the loaded cartridge must match the one the state was taken
/// from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusState {
    pub ram: Vec<u8>,
    pub open_bus: u8,
    pub dma_stall: u32,
    pub dot_counter: u64,
    pub cpu: CpuState,
    pub ppu: PpuState,
    pub apu: ApuState,
    pub controllers: [ControllerState; 2],
    pub cartridge: Option<CartridgeState>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CartridgeState {
    pub prg_ram: Option<Vec<u8>>,
    pub chr_ram: Option<Vec<u8>>,
    pub mapper: MapperState,
}

impl Bus {
    /// Serialize the full machine state into a versioned envelope.
    pub fn save_state(&self) -> Result<Vec<u8>, NesError> {
        let cartridge = self.mapper.as_ref().map(|mapper| CartridgeState {
            prg_ram: mapper.prg_ram().map(|ram| ram.to_vec()),
            chr_ram: mapper.chr_ram().map(|ram| ram.to_vec()),
            mapper: mapper.save_state(),
        });

        let state = BusState {
            ram: self.ram.to_vec(),
            open_bus: self.open_bus,
            dma_stall: self.dma_stall,
            dot_counter: self.dot_counter,
            cpu: self.cpu.save_state(),
            ppu: self.ppu.save_state(),
            apu: self.apu.save_state(),
            controllers: [
                self.controllers[0].save_state(),
                self.controllers[1].save_state(),
            ],
            cartridge,
        };

        let body = bincode::serialize(&state)
            .map_err(|e| NesError::SaveStateFormat(format!("encode failed: {e}")))?;

        let mut out = Vec::with_capacity(8 + body.len());
        out.extend_from_slice(&STATE_MAGIC);
        out.extend_from_slice(&STATE_VERSION.to_le_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Restore a state produced by [`Bus::save_state`]. The same
    /// cartridge (and therefore the same mapper variant) must already be
    /// loaded.
    pub fn load_state(&mut self, bytes: &[u8]) -> Result<(), NesError> {
        if bytes.len() < 8 {
            return Err(NesError::SaveStateFormat("state too short".into()));
        }
        if bytes[0..4] != STATE_MAGIC {
            return Err(NesError::SaveStateFormat("bad magic".into()));
        }
        let version = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        if version != STATE_VERSION {
            return Err(NesError::SaveStateFormat(format!(
                "unknown version {version}"
            )));
        }

        let state: BusState = bincode::deserialize(&bytes[8..])
            .map_err(|e| NesError::SaveStateFormat(format!("decode failed: {e}")))?;

        if state.ram.len() != self.ram.len() {
            return Err(NesError::SaveStateFormat(format!(
                "RAM size mismatch: {}",
                state.ram.len()
            )));
        }

        match (&state.cartridge, self.mapper.as_mut()) {
            (Some(cart_state), Some(mapper)) => {
                mapper.load_state(&cart_state.mapper)?;
                if let (Some(saved), Some(ram)) = (&cart_state.prg_ram, mapper.prg_ram_mut()) {
                    if saved.len() != ram.len() {
                        return Err(NesError::SaveStateFormat(
                            "PRG-RAM size mismatch".into(),
                        ));
                    }
                    ram.copy_from_slice(saved);
                }
                if let (Some(saved), Some(ram)) = (&cart_state.chr_ram, mapper.chr_ram_mut()) {
                    if saved.len() != ram.len() {
                        return Err(NesError::SaveStateFormat(
                            "CHR-RAM size mismatch".into(),
                        ));
                    }
                    ram.copy_from_slice(saved);
                }
            }
            (None, None) => {}
            (Some(_), None) => {
                return Err(NesError::SaveStateFormat(
                    "state carries a cartridge but none is loaded".into(),
                ));
            }
            (None, Some(_)) => {
                return Err(NesError::SaveStateFormat(
                    "state has no cartridge but one is loaded".into(),
                ));
            }
        }

        self.ram.copy_from_slice(&state.ram);
        self.open_bus = state.open_bus;
        self.dma_stall = state.dma_stall;
        self.dot_counter = state.dot_counter;
        self.cpu.load_state(&state.cpu);
        self.ppu.load_state(&state.ppu);
        self.apu.load_state(&state.apu);
        self.controllers[0].load_state(&state.controllers[0]);
        self.controllers[1].load_state(&state.controllers[1]);

        log::debug!("state restored at dot {}", self.dot_counter);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nes::test_support::{bus_with_program, test_rom};

    // A short program that keeps mutating RAM so divergence shows up.
    fn busy_bus() -> Bus {
        // loop: INC $10; JMP loop
        bus_with_program(&[0xE6, 0x10, 0x4C, 0x00, 0x80])
    }

    #[test]
    fn round_trip_restores_identical_execution() {
        let mut bus = busy_bus();
        bus.run_frame();
        bus.run_frame();

        let snapshot = bus.save_state().unwrap();

        let mut expected = Vec::new();
        for _ in 0..3 {
            bus.run_frame();
            expected.push((bus.peek(0x0010), bus.frame_pixels().to_vec(), bus.dot_counter()));
        }

        let mut restored = busy_bus();
        restored.load_state(&snapshot).unwrap();
        for (ram_val, pixels, dots) in expected {
            restored.run_frame();
            assert_eq!(restored.peek(0x0010), ram_val);
            assert_eq!(restored.frame_pixels(), pixels.as_slice());
            assert_eq!(restored.dot_counter(), dots);
        }
    }

    #[test]
    fn rejects_bad_magic_and_unknown_version() {
        let mut bus = busy_bus();
        let mut state = bus.save_state().unwrap();

        let mut broken = state.clone();
        broken[0] = b'X';
        assert!(matches!(
            bus.load_state(&broken),
            Err(NesError::SaveStateFormat(_))
        ));

        state[4] = 0xFF;
        assert!(matches!(
            bus.load_state(&state),
            Err(NesError::SaveStateFormat(_))
        ));

        assert!(matches!(
            bus.load_state(&[1, 2, 3]),
            Err(NesError::SaveStateFormat(_))
        ));
    }

    #[test]
    fn rejects_truncated_body() {
        let mut bus = busy_bus();
        let state = bus.save_state().unwrap();
        assert!(matches!(
            bus.load_state(&state[..state.len() / 2]),
            Err(NesError::SaveStateFormat(_))
        ));
    }

    #[test]
    fn cartridge_presence_must_match() {
        let mut bus = busy_bus();
        let state = bus.save_state().unwrap();

        let mut empty = Bus::new();
        assert!(matches!(
            empty.load_state(&state),
            Err(NesError::SaveStateFormat(_))
        ));
    }

    #[test]
    fn chr_ram_contents_survive_the_round_trip() {
        let mut bus = bus_with_program(&[0x4C, 0x00, 0x80]);
        // Write a pattern byte through PPUADDR/PPUDATA into CHR-RAM.
        bus.write(0x2006, 0x00);
        bus.write(0x2006, 0x42);
        bus.write(0x2007, 0x99);

        let state = bus.save_state().unwrap();

        let mut restored = Bus::new();
        restored
            .load_rom_bytes(&test_rom(&[0x4C, 0x00, 0x80], 0xF000, 0xF000))
            .unwrap();
        restored.load_state(&state).unwrap();

        restored.write(0x2006, 0x00);
        restored.write(0x2006, 0x42);
        let _ = restored.read(0x2007); // prime the read buffer
        assert_eq!(restored.read(0x2007), 0x99);
    }
}
