pub mod apu;
pub mod cartridge;
pub mod controller;
pub mod cpu;
pub mod error;
pub mod mapper;
mod palette;
pub mod ppu;
pub mod state;
pub mod trace;

use std::path::Path;

use apu::Apu;
use cartridge::Cartridge;
use controller::Controller;
use cpu::Cpu;
use error::NesError;
use mapper::{build_mapper, mapper_name, Mapper};
use ppu::Ppu;

pub const BUTTON_A: u8 = 0x01;
pub const BUTTON_B: u8 = 0x02;
pub const BUTTON_SELECT: u8 = 0x04;
pub const BUTTON_START: u8 = 0x08;
pub const BUTTON_UP: u8 = 0x10;
pub const BUTTON_DOWN: u8 = 0x20;
pub const BUTTON_LEFT: u8 = 0x40;
pub const BUTTON_RIGHT: u8 = 0x80;

pub(crate) const FLAG_CARRY: u8 = 0x01;
pub(crate) const FLAG_ZERO: u8 = 0x02;
pub(crate) const FLAG_INTERRUPT: u8 = 0x04;
pub(crate) const FLAG_DECIMAL: u8 = 0x08;
pub(crate) const FLAG_BREAK: u8 = 0x10;
pub(crate) const FLAG_UNUSED: u8 = 0x20;
pub(crate) const FLAG_OVERFLOW: u8 = 0x40;
pub(crate) const FLAG_NEGATIVE: u8 = 0x80;

/// The system bus: owns every chip and the cartridge, decodes the CPU
/// address space, and drives the master clock. One `tick()` is one PPU
/// dot; every third dot also clocks the APU, the mapper, interrupt
/// sampling, and the CPU, in that order.
pub struct Bus {
    pub(crate) cpu: Cpu,
    pub(crate) ppu: Ppu,
    pub(crate) apu: Apu,
    pub(crate) controllers: [Controller; 2],
    pub(crate) mapper: Option<Box<dyn Mapper>>,

    pub(crate) ram: [u8; 2048],
    pub(crate) open_bus: u8,
    pub(crate) dma_stall: u32,
    pub(crate) dot_counter: u64,
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

impl Bus {
    pub fn new() -> Self {
        Self {
            cpu: Cpu::new(),
            ppu: Ppu::new(),
            apu: Apu::new(),
            controllers: [Controller::new(), Controller::new()],
            mapper: None,
            ram: [0; 2048],
            open_bus: 0,
            dma_stall: 0,
            dot_counter: 0,
        }
    }

    // -----------------------------------------------------------------
    // Cartridge lifecycle

    pub fn load_cartridge(&mut self, cart: Cartridge) -> Result<(), NesError> {
        let id = cart.mapper_id;
        self.mapper = Some(build_mapper(cart)?);
        log::info!("cartridge loaded: {} (mapper {id})", mapper_name(id));
        self.power_on();
        Ok(())
    }

    pub fn load_rom_bytes(&mut self, bytes: &[u8]) -> Result<(), NesError> {
        self.load_cartridge(Cartridge::from_bytes(bytes)?)
    }

    pub fn load_rom_file(&mut self, path: &Path) -> Result<(), NesError> {
        self.load_cartridge(Cartridge::from_file(path)?)
    }

    pub fn eject(&mut self) {
        self.mapper = None;
    }

    /// Cold boot: everything including RAM goes to its power-up state.
    pub fn power_on(&mut self) {
        self.ram = [0; 2048];
        self.open_bus = 0;
        self.dma_stall = 0;
        self.dot_counter = 0;
        self.controllers = [Controller::new(), Controller::new()];
        self.ppu = Ppu::new();
        self.apu.reset();
        self.cpu = Cpu::new();
        if self.mapper.is_some() {
            self.reset_cpu();
            log::debug!("power on, PC=${:04X}", self.cpu.pc);
        }
    }

    /// Warm reset: RAM and cartridge state survive.
    pub fn reset(&mut self) {
        if self.mapper.is_none() {
            return;
        }
        self.open_bus = 0;
        self.dma_stall = 0;
        self.ppu.reset();
        self.apu.reset();
        self.reset_cpu();
        log::debug!("reset, PC=${:04X}", self.cpu.pc);
    }

    // -----------------------------------------------------------------
    // Clocking

    /// Advance the machine by one PPU dot. Every third dot the CPU-side
    /// chain runs: APU, mapper, NMI latch, IRQ line, CPU, in that order.
    pub fn tick(&mut self) {
        if let Some(mapper) = self.mapper.as_mut() {
            self.ppu.tick(mapper.as_mut());
        }
        self.dot_counter += 1;

        if self.dot_counter % 3 == 0 {
            self.apu.tick();
            self.service_dmc_dma();

            if let Some(mapper) = self.mapper.as_mut() {
                mapper.tick();
            }

            if self.ppu.take_nmi() {
                self.cpu.nmi_pending = true;
            }
            self.cpu.irq_line = self.apu.irq_pending()
                || self.mapper.as_ref().is_some_and(|m| m.irq_pending());

            self.clock_cpu();
        }
    }

    /// Run until the PPU completes the current frame and return the
    /// pixels. One frame is 89,342 dots, one fewer on odd frames with
    /// rendering enabled.
    pub fn run_frame(&mut self) -> &[u8] {
        if self.mapper.is_none() {
            return self.ppu.frame_buffer();
        }

        self.ppu.clear_frame_complete();
        while !self.ppu.frame_complete() {
            self.tick();
        }
        self.ppu.frame_buffer()
    }

    pub fn frame_ready(&self) -> bool {
        self.ppu.frame_complete()
    }

    /// 256x240 RGBA pixels, row major from the top-left corner.
    pub fn frame_pixels(&self) -> &[u8] {
        self.ppu.frame_buffer()
    }

    pub fn dot_counter(&self) -> u64 {
        self.dot_counter
    }

    // -----------------------------------------------------------------
    // Controllers and audio

    pub fn set_controller(&mut self, port: usize, buttons: u8) {
        if let Some(pad) = self.controllers.get_mut(port) {
            pad.set_buttons(buttons);
        }
    }

    /// Convenience setter taking the buttons in A, B, Select, Start,
    /// Up, Down, Left, Right order.
    pub fn set_controller_buttons(&mut self, port: usize, buttons: [bool; 8]) {
        let mut bits = 0u8;
        for (i, pressed) in buttons.iter().enumerate() {
            if *pressed {
                bits |= 1 << i;
            }
        }
        self.set_controller(port, bits);
    }

    /// Drain queued audio into `dst` as interleaved stereo i16 pairs at
    /// 44.1 kHz. Returns the number of values written.
    pub fn audio_samples(&mut self, dst: &mut [i16]) -> usize {
        self.apu.drain_samples(dst)
    }

    // -----------------------------------------------------------------
    // CPU-visible address space

    pub fn read(&mut self, addr: u16) -> u8 {
        self.cpu_read(addr)
    }

    pub fn write(&mut self, addr: u16, value: u8) {
        self.cpu_write(addr, value);
    }

    pub(crate) fn cpu_read(&mut self, addr: u16) -> u8 {
        // Cartridge space first; an unhandled read floats the bus.
        if addr >= 0x4020 {
            let value = self
                .mapper
                .as_mut()
                .and_then(|m| m.cpu_read(addr))
                .unwrap_or(self.open_bus);
            self.open_bus = value;
            return value;
        }

        let value = match addr {
            0x0000..=0x1FFF => self.ram[(addr as usize) & 0x07FF],
            0x2000..=0x3FFF => {
                let reg = 0x2000 + (addr & 0x0007);
                if let Some(mapper) = self.mapper.as_mut() {
                    self.ppu.cpu_read_register(reg, mapper.as_mut())
                } else {
                    self.open_bus
                }
            }
            0x4015 => self.apu.read_status(),
            0x4016 => 0x40 | self.controllers[0].read(),
            0x4017 => 0x40 | self.controllers[1].read(),
            _ => self.open_bus,
        };
        self.open_bus = value;
        value
    }

    pub(crate) fn cpu_write(&mut self, addr: u16, value: u8) {
        self.open_bus = value;

        if addr >= 0x4020 {
            if let Some(mapper) = self.mapper.as_mut() {
                mapper.cpu_write(addr, value);
            }
            return;
        }

        match addr {
            0x0000..=0x1FFF => {
                self.ram[(addr as usize) & 0x07FF] = value;
            }
            0x2000..=0x3FFF => {
                let reg = 0x2000 + (addr & 0x0007);
                if let Some(mapper) = self.mapper.as_mut() {
                    self.ppu.cpu_write_register(reg, value, mapper.as_mut());
                }
            }
            0x4014 => self.oam_dma(value),
            0x4016 => {
                self.controllers[0].write(value);
                self.controllers[1].write(value);
            }
            0x4000..=0x4013 | 0x4015 | 0x4017 => {
                self.apu.write_register(addr, value);
            }
            _ => {}
        }
    }

    /// Side-effect-free read for debuggers and the trace disassembler.
    pub fn peek(&mut self, addr: u16) -> u8 {
        match addr {
            0x0000..=0x1FFF => self.ram[(addr as usize) & 0x07FF],
            0x4020..=0xFFFF => self
                .mapper
                .as_mut()
                .and_then(|m| m.cpu_read(addr))
                .unwrap_or(self.open_bus),
            _ => self.open_bus,
        }
    }

    // -----------------------------------------------------------------
    // DMA

    /// $4014: copy a 256-byte page into OAM. The copy itself is atomic;
    /// the CPU pays for it with a 513-cycle stall, 514 when the write
    /// lands on an odd cycle.
    fn oam_dma(&mut self, page: u8) {
        let base = (page as u16) << 8;
        let mut bytes = [0u8; 256];
        for (i, slot) in bytes.iter_mut().enumerate() {
            *slot = self.cpu_read(base.wrapping_add(i as u16));
        }
        self.ppu.write_oam_dma(&bytes);

        let parity = (self.cpu.total_cycles & 1) as u32;
        self.dma_stall += 513 + parity;
    }

    fn service_dmc_dma(&mut self) {
        if let Some(addr) = self.apu.take_dmc_dma_request() {
            let value = self.dmc_dma_read(addr);
            self.apu.complete_dmc_dma(value);
            let stall = if (self.cpu.total_cycles & 1) == 0 { 4 } else { 3 };
            self.dma_stall += stall;
        }
    }

    /// DMC sample fetches bypass I/O space: only RAM and PRG are legal
    /// sources.
    fn dmc_dma_read(&mut self, addr: u16) -> u8 {
        let value = match addr {
            0x0000..=0x1FFF => self.ram[(addr as usize) & 0x07FF],
            0x8000..=0xFFFF => self
                .mapper
                .as_mut()
                .and_then(|m| m.cpu_read(addr))
                .unwrap_or(0),
            _ => 0,
        };
        self.open_bus = value;
        value
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Build a 32 KiB NROM image with `program` at $8000, CHR-RAM, and
    /// the reset vector pointing at the program.
    pub fn test_rom(program: &[u8], nmi: u16, irq: u16) -> Vec<u8> {
        let mut prg = vec![0u8; 0x8000];
        prg[..program.len()].copy_from_slice(program);
        prg[0x7FFA] = nmi as u8;
        prg[0x7FFB] = (nmi >> 8) as u8;
        prg[0x7FFC] = 0x00;
        prg[0x7FFD] = 0x80;
        prg[0x7FFE] = irq as u8;
        prg[0x7FFF] = (irq >> 8) as u8;

        let mut rom = Vec::new();
        rom.extend_from_slice(b"NES\x1A");
        rom.extend_from_slice(&[2, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        rom.extend_from_slice(&prg);
        rom
    }

    pub fn bus_with_vectors(program: &[u8], nmi: u16, irq: u16) -> Bus {
        let mut bus = Bus::new();
        bus.load_rom_bytes(&test_rom(program, nmi, irq)).unwrap();
        // Spend the quiet reset cycles so tests start at an instruction
        // boundary.
        while bus.cpu.cycles > 0 {
            bus.clock_cpu();
        }
        bus
    }

    pub fn bus_with_program(program: &[u8]) -> Bus {
        bus_with_vectors(program, 0xF000, 0xF000)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn internal_ram_mirrors_every_0x800() {
        let mut bus = bus_with_program(&[0xEA]);
        bus.write(0x0001, 0x42);
        assert_eq!(bus.read(0x0801), 0x42);
        assert_eq!(bus.read(0x1001), 0x42);
        assert_eq!(bus.read(0x1801), 0x42);

        bus.write(0x1FFF, 0x24);
        assert_eq!(bus.read(0x07FF), 0x24);
    }

    #[test]
    fn controller_latch_sequence_reads_back_in_button_order() {
        let mut bus = bus_with_program(&[0xEA]);
        bus.set_controller_buttons(
            0,
            [true, false, true, false, true, false, true, false],
        );

        bus.write(0x4016, 0x01);
        bus.write(0x4016, 0x00);

        let expected = [1u8, 0, 1, 0, 1, 0, 1, 0, 1, 1, 1];
        for (i, want) in expected.iter().enumerate() {
            let bit = bus.read(0x4016) & 0x01;
            assert_eq!(bit, *want, "read {i}");
        }
    }

    #[test]
    fn unmapped_reads_return_the_last_bus_value() {
        let mut bus = bus_with_program(&[0xEA]);
        bus.write(0x0000, 0x5A);
        let _ = bus.read(0x0000);
        assert_eq!(bus.read(0x5000), 0x5A);
    }

    #[test]
    fn three_dots_advance_one_cpu_cycle() {
        let mut bus = bus_with_program(&[0xEA, 0xEA, 0xEA]);
        let start = bus.cpu.total_cycles;
        for _ in 0..9 {
            bus.tick();
        }
        assert_eq!(bus.cpu.total_cycles - start, 3);
    }

    #[test]
    fn run_frame_advances_the_documented_dot_count() {
        // Reset vector spins in place; rendering stays off.
        let mut bus = bus_with_program(&[0x4C, 0x00, 0x80]);

        // Align to a frame boundary first.
        bus.run_frame();
        for _ in 0..5 {
            let before = bus.dot_counter();
            bus.run_frame();
            assert_eq!(bus.dot_counter() - before, ppu::DOTS_PER_FRAME);
        }

        // With rendering enabled, odd frames drop one dot.
        bus.write(0x2001, 0x08);
        let mut lengths = Vec::new();
        for _ in 0..6 {
            let before = bus.dot_counter();
            bus.run_frame();
            lengths.push(bus.dot_counter() - before);
        }
        assert!(lengths.contains(&ppu::DOTS_PER_FRAME));
        assert!(lengths.contains(&(ppu::DOTS_PER_FRAME - 1)));
        for pair in lengths.windows(2) {
            assert_ne!(pair[0], pair[1], "frame lengths must alternate: {lengths:?}");
        }
    }

    #[test]
    fn oam_dma_copies_a_page_and_stalls_the_cpu() {
        let mut bus = bus_with_program(&[0xEA]);
        for i in 0..256u16 {
            bus.write(0x0200 + i, i as u8);
        }
        bus.write(0x2003, 0x00);

        let parity = bus.cpu.total_cycles & 1;
        bus.write(0x4014, 0x02);
        assert_eq!(bus.dma_stall, 513 + parity as u32);

        for i in 0..4u16 {
            bus.write(0x2003, i as u8);
            assert_eq!(bus.read(0x2004), i as u8);
        }

        // The stall burns CPU cycles without executing instructions.
        let pc = bus.cpu.pc;
        for _ in 0..(513 * 3) {
            bus.tick();
        }
        assert_eq!(bus.cpu.pc, pc);
    }

    #[test]
    fn vblank_flag_reads_set_then_clear_at_241_1() {
        let mut bus = bus_with_program(&[0x4C, 0x00, 0x80]);

        while !(bus.ppu.scanline() == 241 && bus.ppu.dot() == 2) {
            bus.tick();
        }
        assert_ne!(bus.read(0x2002) & 0x80, 0);
        assert_eq!(bus.read(0x2002) & 0x80, 0);
    }

    #[test]
    fn nmi_fires_after_vblank_when_enabled() {
        let mut bus = bus_with_vectors(&[0x4C, 0x00, 0x80], 0x9000, 0x9000);
        bus.write(0x2000, 0x80);

        let mut reached_handler = false;
        for _ in 0..(ppu::DOTS_PER_FRAME * 2) {
            bus.tick();
            if bus.cpu.pc >= 0x9000 && bus.cpu.pc < 0x9100 {
                reached_handler = true;
                break;
            }
        }
        assert!(reached_handler, "NMI handler never entered");
    }

    #[test]
    fn unsupported_mapper_is_a_load_error() {
        let mut rom = test_rom(&[0xEA], 0, 0);
        rom[6] = 0x50; // mapper 5 low nibble
        let mut bus = Bus::new();
        assert!(matches!(
            bus.load_rom_bytes(&rom),
            Err(NesError::UnsupportedMapper(5))
        ));
    }
}
