use std::collections::VecDeque;
use std::f32::consts::PI;

use serde::{Deserialize, Serialize};

const CPU_CLOCK_HZ: f64 = 1_789_772.727_272_727_3;

/// Output sample rate. The resampler duplicates each mono sample into an
/// interleaved stereo pair.
pub const SAMPLE_RATE: u32 = 44_100;

/// Ring capacity in i16 samples; roughly three quarters of a second of
/// stereo audio. A stalled reader loses the oldest samples, never the
/// newest.
const MAX_QUEUED_SAMPLES: usize = 64 * 1024;

const LENGTH_TABLE: [u8; 32] = [
    10, 254, 20, 2, 40, 4, 80, 6, 160, 8, 60, 10, 14, 12, 26, 14, 12, 16, 24, 18, 48, 20, 96, 22,
    192, 24, 72, 26, 16, 28, 32, 30,
];

const DUTY_TABLE: [[u8; 8]; 4] = [
    [0, 1, 0, 0, 0, 0, 0, 0],
    [0, 1, 1, 0, 0, 0, 0, 0],
    [0, 1, 1, 1, 1, 0, 0, 0],
    [1, 0, 0, 1, 1, 1, 1, 1],
];

const TRI_TABLE: [u8; 32] = [
    15, 14, 13, 12, 11, 10, 9, 8, 7, 6, 5, 4, 3, 2, 1, 0, 0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12,
    13, 14, 15,
];

const NOISE_PERIOD_TABLE: [u16; 16] = [
    4, 8, 16, 32, 64, 96, 128, 160, 202, 254, 380, 508, 762, 1016, 2034, 4068,
];

const DMC_RATE_TABLE: [u16; 16] = [
    428, 380, 340, 320, 286, 254, 226, 214, 190, 160, 142, 128, 106, 84, 72, 54,
];

// Frame sequencer steps in CPU cycles (the half-cycle APU values doubled).
const FC_4STEP_Q1: u32 = 7_457;
const FC_4STEP_Q2_H2: u32 = 14_913;
const FC_4STEP_Q3: u32 = 22_371;
const FC_4STEP_Q4_H4_IRQ: u32 = 29_829;
const FC_4STEP_RESET: u32 = 29_830;

const FC_5STEP_Q1: u32 = 7_457;
const FC_5STEP_Q2_H2: u32 = 14_913;
const FC_5STEP_Q3: u32 = 22_371;
const FC_5STEP_Q4_H4: u32 = 37_281;
const FC_5STEP_RESET: u32 = 37_282;

pub struct Apu {
    pulse1: PulseChannel,
    pulse2: PulseChannel,
    triangle: TriangleChannel,
    noise: NoiseChannel,
    dmc: DmcChannel,

    frame_counter: u32,
    frame_mode_5_step: bool,
    frame_irq_inhibit: bool,
    frame_irq_flag: bool,
    frame_counter_write_pending: bool,
    frame_counter_write_value: u8,
    frame_counter_write_delay: u8,

    cpu_cycle: u64,
    sample_phase: f64,
    samples: VecDeque<i16>,

    hp90: HighPass,
    hp440: HighPass,
    lp14k: LowPass,
    dmc_dma_request: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApuState {
    pub pulse1: PulseChannel,
    pub pulse2: PulseChannel,
    pub triangle: TriangleChannel,
    pub noise: NoiseChannel,
    pub dmc: DmcChannel,
    pub frame_counter: u32,
    pub frame_mode_5_step: bool,
    pub frame_irq_inhibit: bool,
    pub frame_irq_flag: bool,
    pub frame_counter_write_pending: bool,
    pub frame_counter_write_value: u8,
    pub frame_counter_write_delay: u8,
    pub cpu_cycle: u64,
    pub sample_phase: f64,
    pub dmc_dma_request: Option<u16>,
}

impl Apu {
    pub fn new() -> Self {
        let dt = 1.0f32 / SAMPLE_RATE as f32;
        Self {
            pulse1: PulseChannel::new(true),
            pulse2: PulseChannel::new(false),
            triangle: TriangleChannel::new(),
            noise: NoiseChannel::new(),
            dmc: DmcChannel::new(),
            frame_counter: 0,
            frame_mode_5_step: false,
            frame_irq_inhibit: false,
            frame_irq_flag: false,
            frame_counter_write_pending: false,
            frame_counter_write_value: 0,
            frame_counter_write_delay: 0,
            cpu_cycle: 0,
            sample_phase: 0.0,
            samples: VecDeque::with_capacity(MAX_QUEUED_SAMPLES),
            hp90: HighPass::new(90.0, dt),
            hp440: HighPass::new(440.0, dt),
            lp14k: LowPass::new(14_000.0, dt),
            dmc_dma_request: None,
        }
    }

    pub fn reset(&mut self) {
        self.pulse1 = PulseChannel::new(true);
        self.pulse2 = PulseChannel::new(false);
        self.triangle = TriangleChannel::new();
        self.noise = NoiseChannel::new();
        self.dmc = DmcChannel::new();
        self.frame_counter = 0;
        self.frame_mode_5_step = false;
        self.frame_irq_inhibit = false;
        self.frame_irq_flag = false;
        self.frame_counter_write_pending = false;
        self.frame_counter_write_value = 0;
        self.frame_counter_write_delay = 0;
        self.cpu_cycle = 0;
        self.sample_phase = 0.0;
        self.samples.clear();
        self.hp90.reset();
        self.hp440.reset();
        self.lp14k.reset();
        self.dmc_dma_request = None;
    }

    pub fn write_register(&mut self, addr: u16, value: u8) {
        match addr {
            0x4000 => self.pulse1.write_control(value),
            0x4001 => self.pulse1.write_sweep(value),
            0x4002 => self.pulse1.write_timer_low(value),
            0x4003 => self.pulse1.write_timer_high(value),

            0x4004 => self.pulse2.write_control(value),
            0x4005 => self.pulse2.write_sweep(value),
            0x4006 => self.pulse2.write_timer_low(value),
            0x4007 => self.pulse2.write_timer_high(value),

            0x4008 => self.triangle.write_linear(value),
            0x400A => self.triangle.write_timer_low(value),
            0x400B => self.triangle.write_timer_high(value),

            0x400C => self.noise.write_control(value),
            0x400E => self.noise.write_period(value),
            0x400F => self.noise.write_length(value),

            0x4010 => self.dmc.write_control(value),
            0x4011 => self.dmc.write_output_level(value),
            0x4012 => self.dmc.write_sample_addr(value),
            0x4013 => self.dmc.write_sample_length(value),

            0x4015 => self.write_status(value),
            0x4017 => self.write_frame_counter(value),
            _ => {}
        }
    }

    /// $4015 read: per-channel length status, DMC activity, and the two
    /// IRQ flags. The frame IRQ flag clears on read; the DMC flag does
    /// not.
    pub fn read_status(&mut self) -> u8 {
        let mut status = 0u8;
        if self.pulse1.length_counter > 0 {
            status |= 0x01;
        }
        if self.pulse2.length_counter > 0 {
            status |= 0x02;
        }
        if self.triangle.length_counter > 0 {
            status |= 0x04;
        }
        if self.noise.length_counter > 0 {
            status |= 0x08;
        }
        if self.dmc.bytes_remaining > 0 {
            status |= 0x10;
        }
        if self.frame_irq_flag {
            status |= 0x40;
        }
        if self.dmc.irq_flag {
            status |= 0x80;
        }

        self.frame_irq_flag = false;
        status
    }

    pub fn irq_pending(&self) -> bool {
        self.frame_irq_flag || self.dmc.irq_flag
    }

    /// Advance one CPU cycle.
    pub fn tick(&mut self) {
        self.cpu_cycle = self.cpu_cycle.wrapping_add(1);

        if self.frame_counter_write_pending {
            if self.frame_counter_write_delay > 0 {
                self.frame_counter_write_delay -= 1;
            }
            if self.frame_counter_write_delay == 0 {
                self.apply_frame_counter_write(self.frame_counter_write_value);
                self.frame_counter_write_pending = false;
            }
        }

        // Pulse and noise timers run at half the CPU rate; triangle and
        // DMC at full rate.
        if (self.cpu_cycle & 1) == 0 {
            self.pulse1.clock_timer();
            self.pulse2.clock_timer();
            self.noise.clock_timer();
        }
        self.triangle.clock_timer();
        self.dmc.clock_timer();
        if self.dmc.needs_dma() && self.dmc_dma_request.is_none() {
            self.dmc_dma_request = Some(self.dmc.current_addr);
        }

        self.clock_frame_counter();

        self.sample_phase += SAMPLE_RATE as f64;
        while self.sample_phase >= CPU_CLOCK_HZ {
            self.sample_phase -= CPU_CLOCK_HZ;
            let mixed = self.mix_sample();
            let filtered = self.lp14k.apply(self.hp440.apply(self.hp90.apply(mixed)));
            let sample = (filtered.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
            self.push_stereo(sample);
        }
    }

    fn push_stereo(&mut self, sample: i16) {
        while self.samples.len() + 2 > MAX_QUEUED_SAMPLES {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
        self.samples.push_back(sample);
    }

    /// Drain queued interleaved-stereo samples into `dst`, returning how
    /// many i16 values were written (always an even count).
    pub fn drain_samples(&mut self, dst: &mut [i16]) -> usize {
        let count = dst.len().min(self.samples.len()) & !1;
        for slot in dst.iter_mut().take(count) {
            *slot = self.samples.pop_front().unwrap_or(0);
        }
        count
    }

    pub fn queued_samples(&self) -> usize {
        self.samples.len()
    }

    pub fn take_dmc_dma_request(&mut self) -> Option<u16> {
        self.dmc_dma_request.take()
    }

    pub fn complete_dmc_dma(&mut self, value: u8) {
        self.dmc.consume_dma_byte(value);
        if self.dmc.needs_dma() && self.dmc_dma_request.is_none() {
            self.dmc_dma_request = Some(self.dmc.current_addr);
        }
    }

    fn write_status(&mut self, value: u8) {
        // Any write to $4015 clears a pending DMC IRQ.
        self.dmc.irq_flag = false;

        self.pulse1.enabled = (value & 0x01) != 0;
        if !self.pulse1.enabled {
            self.pulse1.length_counter = 0;
        }

        self.pulse2.enabled = (value & 0x02) != 0;
        if !self.pulse2.enabled {
            self.pulse2.length_counter = 0;
        }

        self.triangle.enabled = (value & 0x04) != 0;
        if !self.triangle.enabled {
            self.triangle.length_counter = 0;
        }

        self.noise.enabled = (value & 0x08) != 0;
        if !self.noise.enabled {
            self.noise.length_counter = 0;
        }

        self.dmc.enabled = (value & 0x10) != 0;
        if !self.dmc.enabled {
            self.dmc.stop();
        } else if !self.dmc.playback_active() {
            self.dmc.restart_sample();
            if self.dmc.needs_dma() && self.dmc_dma_request.is_none() {
                self.dmc_dma_request = Some(self.dmc.current_addr);
            }
        }
    }

    fn write_frame_counter(&mut self, value: u8) {
        if (value & 0x40) != 0 {
            self.frame_irq_flag = false;
        }
        // The mode change lands 3-4 CPU cycles after the write.
        self.frame_counter_write_pending = true;
        self.frame_counter_write_value = value;
        self.frame_counter_write_delay = if (self.cpu_cycle & 1) == 0 { 3 } else { 4 };
    }

    fn apply_frame_counter_write(&mut self, value: u8) {
        self.frame_mode_5_step = (value & 0x80) != 0;
        self.frame_irq_inhibit = (value & 0x40) != 0;
        if self.frame_irq_inhibit {
            self.frame_irq_flag = false;
        }
        self.frame_counter = 0;
        if self.frame_mode_5_step {
            self.clock_quarter_frame();
            self.clock_half_frame();
        }
    }

    fn clock_frame_counter(&mut self) {
        self.frame_counter = self.frame_counter.wrapping_add(1);

        if self.frame_mode_5_step {
            match self.frame_counter {
                FC_5STEP_Q1 | FC_5STEP_Q3 => self.clock_quarter_frame(),
                FC_5STEP_Q2_H2 | FC_5STEP_Q4_H4 => {
                    self.clock_quarter_frame();
                    self.clock_half_frame();
                }
                FC_5STEP_RESET => {
                    self.frame_counter = 0;
                }
                _ => {}
            }
        } else {
            match self.frame_counter {
                FC_4STEP_Q1 | FC_4STEP_Q3 => self.clock_quarter_frame(),
                FC_4STEP_Q2_H2 => {
                    self.clock_quarter_frame();
                    self.clock_half_frame();
                }
                FC_4STEP_Q4_H4_IRQ => {
                    self.clock_quarter_frame();
                    self.clock_half_frame();
                    if !self.frame_irq_inhibit {
                        self.frame_irq_flag = true;
                    }
                }
                FC_4STEP_RESET => {
                    if !self.frame_irq_inhibit {
                        self.frame_irq_flag = true;
                    }
                    self.frame_counter = 0;
                }
                _ => {}
            }
        }
    }

    fn clock_quarter_frame(&mut self) {
        self.pulse1.clock_envelope();
        self.pulse2.clock_envelope();
        self.triangle.clock_linear_counter();
        self.noise.clock_envelope();
    }

    fn clock_half_frame(&mut self) {
        self.pulse1.clock_length_and_sweep();
        self.pulse2.clock_length_and_sweep();
        self.triangle.clock_length_counter();
        self.noise.clock_length_counter();
    }

    /// The documented two-term nonlinear mixer.
    fn mix_sample(&self) -> f32 {
        let pulse_sum = (self.pulse1.output() + self.pulse2.output()) as f32;
        let pulse_out = if pulse_sum > 0.0 {
            95.88 / ((8128.0 / pulse_sum) + 100.0)
        } else {
            0.0
        };

        let tnd_in = (self.triangle.output() as f32 / 8227.0)
            + (self.noise.output() as f32 / 12241.0)
            + (self.dmc.output_level as f32 / 22638.0);
        let tnd_out = if tnd_in > 0.0 {
            159.79 / ((1.0 / tnd_in) + 100.0)
        } else {
            0.0
        };

        pulse_out + tnd_out
    }

    pub fn save_state(&self) -> ApuState {
        ApuState {
            pulse1: self.pulse1,
            pulse2: self.pulse2,
            triangle: self.triangle,
            noise: self.noise,
            dmc: self.dmc,
            frame_counter: self.frame_counter,
            frame_mode_5_step: self.frame_mode_5_step,
            frame_irq_inhibit: self.frame_irq_inhibit,
            frame_irq_flag: self.frame_irq_flag,
            frame_counter_write_pending: self.frame_counter_write_pending,
            frame_counter_write_value: self.frame_counter_write_value,
            frame_counter_write_delay: self.frame_counter_write_delay,
            cpu_cycle: self.cpu_cycle,
            sample_phase: self.sample_phase,
            dmc_dma_request: self.dmc_dma_request,
        }
    }

    pub fn load_state(&mut self, s: &ApuState) {
        self.pulse1 = s.pulse1;
        self.pulse2 = s.pulse2;
        self.triangle = s.triangle;
        self.noise = s.noise;
        self.dmc = s.dmc;
        self.frame_counter = s.frame_counter;
        self.frame_mode_5_step = s.frame_mode_5_step;
        self.frame_irq_inhibit = s.frame_irq_inhibit;
        self.frame_irq_flag = s.frame_irq_flag;
        self.frame_counter_write_pending = s.frame_counter_write_pending;
        self.frame_counter_write_value = s.frame_counter_write_value;
        self.frame_counter_write_delay = s.frame_counter_write_delay;
        self.cpu_cycle = s.cpu_cycle;
        self.sample_phase = s.sample_phase;
        self.dmc_dma_request = s.dmc_dma_request;
        self.samples.clear();
        self.hp90.reset();
        self.hp440.reset();
        self.lp14k.reset();
    }
}

#[derive(Debug, Clone, Copy)]
struct HighPass {
    alpha: f32,
    prev_in: f32,
    prev_out: f32,
}

impl HighPass {
    fn new(cutoff_hz: f32, dt: f32) -> Self {
        let rc = 1.0 / (2.0 * PI * cutoff_hz);
        Self {
            alpha: rc / (rc + dt),
            prev_in: 0.0,
            prev_out: 0.0,
        }
    }

    fn apply(&mut self, sample: f32) -> f32 {
        let out = self.alpha * (self.prev_out + sample - self.prev_in);
        self.prev_in = sample;
        self.prev_out = out;
        out
    }

    fn reset(&mut self) {
        self.prev_in = 0.0;
        self.prev_out = 0.0;
    }
}

#[derive(Debug, Clone, Copy)]
struct LowPass {
    alpha: f32,
    prev_out: f32,
}

impl LowPass {
    fn new(cutoff_hz: f32, dt: f32) -> Self {
        let rc = 1.0 / (2.0 * PI * cutoff_hz);
        Self {
            alpha: dt / (rc + dt),
            prev_out: 0.0,
        }
    }

    fn apply(&mut self, sample: f32) -> f32 {
        self.prev_out += self.alpha * (sample - self.prev_out);
        self.prev_out
    }

    fn reset(&mut self) {
        self.prev_out = 0.0;
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PulseChannel {
    enabled: bool,
    channel1: bool,
    duty: u8,
    duty_step: u8,

    timer_period: u16,
    timer_counter: u16,
    length_counter: u8,

    length_halt: bool,
    constant_volume: bool,
    volume: u8,
    envelope_period: u8,
    envelope_start: bool,
    envelope_divider: u8,
    envelope_decay: u8,

    sweep_enabled: bool,
    sweep_period: u8,
    sweep_negate: bool,
    sweep_shift: u8,
    sweep_reload: bool,
    sweep_divider: u8,
}

impl PulseChannel {
    fn new(channel1: bool) -> Self {
        Self {
            enabled: false,
            channel1,
            duty: 0,
            duty_step: 0,
            timer_period: 0,
            timer_counter: 0,
            length_counter: 0,
            length_halt: false,
            constant_volume: false,
            volume: 0,
            envelope_period: 0,
            envelope_start: false,
            envelope_divider: 0,
            envelope_decay: 0,
            sweep_enabled: false,
            sweep_period: 1,
            sweep_negate: false,
            sweep_shift: 0,
            sweep_reload: false,
            sweep_divider: 0,
        }
    }

    fn write_control(&mut self, value: u8) {
        self.duty = (value >> 6) & 0x03;
        self.length_halt = (value & 0x20) != 0;
        self.constant_volume = (value & 0x10) != 0;
        self.volume = value & 0x0F;
        self.envelope_period = value & 0x0F;
        self.envelope_start = true;
    }

    fn write_sweep(&mut self, value: u8) {
        self.sweep_enabled = (value & 0x80) != 0;
        self.sweep_period = ((value >> 4) & 0x07) + 1;
        self.sweep_negate = (value & 0x08) != 0;
        self.sweep_shift = value & 0x07;
        self.sweep_reload = true;
    }

    fn write_timer_low(&mut self, value: u8) {
        self.timer_period = (self.timer_period & 0xFF00) | value as u16;
    }

    fn write_timer_high(&mut self, value: u8) {
        self.timer_period = (self.timer_period & 0x00FF) | (((value & 0x07) as u16) << 8);
        if self.enabled {
            self.length_counter = LENGTH_TABLE[(value >> 3) as usize];
        }
        self.duty_step = 0;
        self.envelope_start = true;
    }

    fn clock_timer(&mut self) {
        if self.timer_counter == 0 {
            self.timer_counter = self.timer_period;
            self.duty_step = (self.duty_step + 1) & 0x07;
        } else {
            self.timer_counter -= 1;
        }
    }

    fn clock_envelope(&mut self) {
        if self.envelope_start {
            self.envelope_start = false;
            self.envelope_decay = 15;
            self.envelope_divider = self.envelope_period;
            return;
        }

        if self.envelope_divider == 0 {
            self.envelope_divider = self.envelope_period;
            if self.envelope_decay == 0 {
                if self.length_halt {
                    self.envelope_decay = 15;
                }
            } else {
                self.envelope_decay -= 1;
            }
        } else {
            self.envelope_divider -= 1;
        }
    }

    fn clock_length_and_sweep(&mut self) {
        if !self.length_halt && self.length_counter > 0 {
            self.length_counter -= 1;
        }

        if self.sweep_reload {
            if self.sweep_enabled && self.sweep_divider == 0 {
                self.apply_sweep();
            }
            self.sweep_divider = self.sweep_period;
            self.sweep_reload = false;
            return;
        }

        if self.sweep_divider == 0 {
            if self.sweep_enabled {
                self.apply_sweep();
            }
            self.sweep_divider = self.sweep_period;
        } else {
            self.sweep_divider -= 1;
        }
    }

    fn apply_sweep(&mut self) {
        if self.sweep_shift == 0 {
            return;
        }
        let target = self.sweep_target_period();
        if target <= 0x07FF {
            self.timer_period = target;
        }
    }

    /// Pulse 1 negates with one's complement (an off-by-one extra step
    /// down); pulse 2 uses two's complement.
    fn sweep_target_period(&self) -> u16 {
        if self.sweep_shift == 0 {
            return self.timer_period;
        }
        let change = self.timer_period >> self.sweep_shift;
        if self.sweep_negate {
            let extra = if self.channel1 { 1 } else { 0 };
            self.timer_period.wrapping_sub(change + extra)
        } else {
            self.timer_period.wrapping_add(change)
        }
    }

    fn output(&self) -> u8 {
        if !self.enabled || self.length_counter == 0 {
            return 0;
        }
        if DUTY_TABLE[self.duty as usize][self.duty_step as usize] == 0 {
            return 0;
        }
        if self.timer_period < 8 || self.sweep_target_period() > 0x07FF {
            return 0;
        }

        if self.constant_volume {
            self.volume
        } else {
            self.envelope_decay
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TriangleChannel {
    enabled: bool,
    control_flag: bool,
    linear_reload_value: u8,
    linear_counter: u8,
    linear_reload_flag: bool,

    timer_period: u16,
    timer_counter: u16,
    length_counter: u8,
    seq_step: u8,
}

impl TriangleChannel {
    fn new() -> Self {
        Self {
            enabled: false,
            control_flag: false,
            linear_reload_value: 0,
            linear_counter: 0,
            linear_reload_flag: false,
            timer_period: 0,
            timer_counter: 0,
            length_counter: 0,
            seq_step: 0,
        }
    }

    fn write_linear(&mut self, value: u8) {
        self.control_flag = (value & 0x80) != 0;
        self.linear_reload_value = value & 0x7F;
    }

    fn write_timer_low(&mut self, value: u8) {
        self.timer_period = (self.timer_period & 0xFF00) | value as u16;
    }

    fn write_timer_high(&mut self, value: u8) {
        self.timer_period = (self.timer_period & 0x00FF) | (((value & 0x07) as u16) << 8);
        if self.enabled {
            self.length_counter = LENGTH_TABLE[(value >> 3) as usize];
        }
        self.linear_reload_flag = true;
    }

    fn clock_linear_counter(&mut self) {
        if self.linear_reload_flag {
            self.linear_counter = self.linear_reload_value;
        } else if self.linear_counter > 0 {
            self.linear_counter -= 1;
        }

        if !self.control_flag {
            self.linear_reload_flag = false;
        }
    }

    fn clock_length_counter(&mut self) {
        if !self.control_flag && self.length_counter > 0 {
            self.length_counter -= 1;
        }
    }

    fn clock_timer(&mut self) {
        if self.timer_counter == 0 {
            self.timer_counter = self.timer_period;
            // Ultrasonic periods pause the sequencer instead of clicking.
            if self.length_counter > 0 && self.linear_counter > 0 && self.timer_period >= 2 {
                self.seq_step = (self.seq_step + 1) & 0x1F;
            }
        } else {
            self.timer_counter -= 1;
        }
    }

    fn output(&self) -> u8 {
        if !self.enabled
            || self.length_counter == 0
            || self.linear_counter == 0
            || self.timer_period < 2
        {
            0
        } else {
            TRI_TABLE[self.seq_step as usize]
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct NoiseChannel {
    enabled: bool,
    length_halt: bool,
    constant_volume: bool,
    volume: u8,
    envelope_period: u8,
    envelope_start: bool,
    envelope_divider: u8,
    envelope_decay: u8,

    mode: bool,
    timer_period: u16,
    timer_counter: u16,
    shift_register: u16,
    length_counter: u8,
}

impl NoiseChannel {
    fn new() -> Self {
        Self {
            enabled: false,
            length_halt: false,
            constant_volume: false,
            volume: 0,
            envelope_period: 0,
            envelope_start: false,
            envelope_divider: 0,
            envelope_decay: 0,
            mode: false,
            timer_period: NOISE_PERIOD_TABLE[0],
            timer_counter: 0,
            shift_register: 1,
            length_counter: 0,
        }
    }

    fn write_control(&mut self, value: u8) {
        self.length_halt = (value & 0x20) != 0;
        self.constant_volume = (value & 0x10) != 0;
        self.volume = value & 0x0F;
        self.envelope_period = value & 0x0F;
        self.envelope_start = true;
    }

    fn write_period(&mut self, value: u8) {
        self.mode = (value & 0x80) != 0;
        self.timer_period = NOISE_PERIOD_TABLE[(value & 0x0F) as usize];
    }

    fn write_length(&mut self, value: u8) {
        if self.enabled {
            self.length_counter = LENGTH_TABLE[(value >> 3) as usize];
        }
        self.envelope_start = true;
    }

    fn clock_timer(&mut self) {
        if self.timer_counter == 0 {
            self.timer_counter = self.timer_period;
            let tap = if self.mode { 6 } else { 1 };
            let feedback = (self.shift_register ^ (self.shift_register >> tap)) & 0x0001;
            self.shift_register >>= 1;
            self.shift_register |= feedback << 14;
        } else {
            self.timer_counter -= 1;
        }
    }

    fn clock_envelope(&mut self) {
        if self.envelope_start {
            self.envelope_start = false;
            self.envelope_decay = 15;
            self.envelope_divider = self.envelope_period;
            return;
        }

        if self.envelope_divider == 0 {
            self.envelope_divider = self.envelope_period;
            if self.envelope_decay == 0 {
                if self.length_halt {
                    self.envelope_decay = 15;
                }
            } else {
                self.envelope_decay -= 1;
            }
        } else {
            self.envelope_divider -= 1;
        }
    }

    fn clock_length_counter(&mut self) {
        if !self.length_halt && self.length_counter > 0 {
            self.length_counter -= 1;
        }
    }

    fn output(&self) -> u8 {
        if !self.enabled || self.length_counter == 0 || (self.shift_register & 0x0001) != 0 {
            return 0;
        }
        if self.constant_volume {
            self.volume
        } else {
            self.envelope_decay
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DmcChannel {
    enabled: bool,
    irq_enabled: bool,
    irq_flag: bool,
    loop_flag: bool,
    rate_index: u8,
    timer_period: u16,
    timer_counter: u16,
    output_level: u8,
    sample_addr: u8,
    sample_length: u8,
    current_addr: u16,
    bytes_remaining: u16,
    sample_buffer: Option<u8>,
    shift_register: u8,
    bits_remaining: u8,
    silence: bool,
    dma_pending: bool,
    dma_delay: u8,
}

impl DmcChannel {
    fn new() -> Self {
        Self {
            enabled: false,
            irq_enabled: false,
            irq_flag: false,
            loop_flag: false,
            rate_index: 0,
            timer_period: DMC_RATE_TABLE[0],
            timer_counter: DMC_RATE_TABLE[0],
            output_level: 0,
            sample_addr: 0,
            sample_length: 0,
            current_addr: 0xC000,
            bytes_remaining: 0,
            sample_buffer: None,
            shift_register: 0,
            bits_remaining: 8,
            silence: true,
            dma_pending: false,
            dma_delay: 0,
        }
    }

    fn write_control(&mut self, value: u8) {
        self.irq_enabled = (value & 0x80) != 0;
        if !self.irq_enabled {
            self.irq_flag = false;
        }
        self.loop_flag = (value & 0x40) != 0;
        self.rate_index = value & 0x0F;
        self.timer_period = DMC_RATE_TABLE[self.rate_index as usize];
        if self.timer_counter == 0 || self.timer_counter > self.timer_period {
            self.timer_counter = self.timer_period;
        }
    }

    fn write_output_level(&mut self, value: u8) {
        self.output_level = value & 0x7F;
    }

    fn write_sample_addr(&mut self, value: u8) {
        self.sample_addr = value;
    }

    fn write_sample_length(&mut self, value: u8) {
        self.sample_length = value;
    }

    fn restart_sample(&mut self) {
        self.current_addr = 0xC000 | ((self.sample_addr as u16) << 6);
        self.bytes_remaining = ((self.sample_length as u16) << 4) | 0x0001;
        if self.sample_buffer.is_none() && self.bytes_remaining > 0 {
            self.schedule_dma(2);
        }
    }

    fn playback_active(&self) -> bool {
        self.bytes_remaining > 0 || self.sample_buffer.is_some()
    }

    fn needs_dma(&self) -> bool {
        self.enabled && self.dma_pending && self.dma_delay == 0
    }

    fn stop(&mut self) {
        self.bytes_remaining = 0;
        self.dma_pending = false;
        self.dma_delay = 0;
    }

    fn consume_dma_byte(&mut self, byte: u8) {
        self.dma_pending = false;
        self.dma_delay = 0;
        self.sample_buffer = Some(byte);
        if self.bytes_remaining > 0 {
            self.current_addr = if self.current_addr == 0xFFFF {
                // Sample playback wraps into PRG space.
                0x8000
            } else {
                self.current_addr + 1
            };
            self.bytes_remaining -= 1;

            if self.bytes_remaining == 0 {
                if self.loop_flag {
                    self.restart_sample();
                } else if self.irq_enabled {
                    self.irq_flag = true;
                }
            }
        }
    }

    fn clock_output_unit(&mut self) {
        if !self.silence {
            if (self.shift_register & 0x01) != 0 {
                if self.output_level <= 125 {
                    self.output_level += 2;
                }
            } else if self.output_level >= 2 {
                self.output_level -= 2;
            }
        }

        self.shift_register >>= 1;
        if self.bits_remaining > 0 {
            self.bits_remaining -= 1;
        }

        if self.bits_remaining == 0 {
            self.bits_remaining = 8;
            if let Some(sample) = self.sample_buffer.take() {
                self.shift_register = sample;
                self.silence = false;
                if self.bytes_remaining > 0 {
                    self.schedule_dma(1);
                }
            } else {
                self.silence = true;
            }
        }
    }

    fn clock_timer(&mut self) {
        if self.dma_pending && self.dma_delay > 0 {
            self.dma_delay -= 1;
        }

        if self.timer_counter == 0 {
            self.timer_counter = self.timer_period;
        }
        self.timer_counter -= 1;
        if self.timer_counter == 0 {
            self.clock_output_unit();
        }
    }

    fn schedule_dma(&mut self, delay: u8) {
        if self.enabled && self.sample_buffer.is_none() && self.bytes_remaining > 0 {
            self.dma_pending = true;
            self.dma_delay = delay;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tick_n(apu: &mut Apu, cycles: u32) {
        for _ in 0..cycles {
            apu.tick();
        }
    }

    #[test]
    fn length_counter_loads_then_counts_down_to_silence() {
        let mut apu = Apu::new();
        apu.write_register(0x4015, 0x01);
        apu.write_register(0x4000, 0x10); // constant volume, halt clear
        apu.write_register(0x4002, 0x40);
        apu.write_register(0x4003, 0x08); // length index 1 -> 254

        assert_eq!(apu.pulse1.length_counter, 254);

        // The first half-frame clock lands at CPU cycle 14913.
        tick_n(&mut apu, FC_4STEP_Q2_H2);
        assert_eq!(apu.pulse1.length_counter, 253);

        apu.write_register(0x4015, 0x00);
        assert_eq!(apu.pulse1.length_counter, 0);
        assert_eq!(apu.pulse1.output(), 0);
    }

    #[test]
    fn disabled_channel_ignores_length_loads() {
        let mut apu = Apu::new();
        apu.write_register(0x4003, 0x08);
        assert_eq!(apu.pulse1.length_counter, 0);
    }

    #[test]
    fn four_step_mode_raises_frame_irq() {
        let mut apu = Apu::new();
        tick_n(&mut apu, FC_4STEP_Q4_H4_IRQ);
        assert!(apu.irq_pending());

        // $4015 read reports and clears it.
        let status = apu.read_status();
        assert_ne!(status & 0x40, 0);
        assert!(!apu.irq_pending());
    }

    #[test]
    fn irq_inhibit_masks_and_clears_the_frame_flag() {
        let mut apu = Apu::new();
        tick_n(&mut apu, FC_4STEP_Q4_H4_IRQ);
        assert!(apu.irq_pending());

        apu.write_register(0x4017, 0x40);
        assert!(!apu.irq_pending());
        tick_n(&mut apu, 2 * FC_4STEP_RESET);
        assert!(!apu.irq_pending());
    }

    #[test]
    fn five_step_write_with_bit7_clocks_immediately() {
        let mut apu = Apu::new();
        apu.write_register(0x4015, 0x01);
        apu.write_register(0x4000, 0x10);
        apu.write_register(0x4002, 0x40);
        apu.write_register(0x4003, 0x08);
        assert_eq!(apu.pulse1.length_counter, 254);

        apu.write_register(0x4017, 0x80);
        // The write applies after its 3-4 cycle delay.
        tick_n(&mut apu, 4);
        assert_eq!(apu.pulse1.length_counter, 253);
    }

    #[test]
    fn pulse_is_silent_below_timer_eight() {
        let mut apu = Apu::new();
        apu.write_register(0x4015, 0x01);
        apu.write_register(0x4000, 0xBF); // duty 2, constant volume 15
        apu.write_register(0x4002, 0x07);
        apu.write_register(0x4003, 0x08);

        // Walk the sequencer into the duty high region; output stays 0.
        tick_n(&mut apu, 256);
        assert_eq!(apu.pulse1.output(), 0);

        apu.write_register(0x4002, 0x80);
        let mut saw_nonzero = false;
        for _ in 0..4096 {
            apu.tick();
            if apu.pulse1.output() > 0 {
                saw_nonzero = true;
                break;
            }
        }
        assert!(saw_nonzero);
    }

    #[test]
    fn pulse_sweep_negate_offset_differs_between_channels() {
        let mut apu = Apu::new();
        apu.pulse1.timer_period = 0x100;
        apu.pulse2.timer_period = 0x100;
        apu.write_register(0x4001, 0x88 | 0x01); // enabled, negate, shift 1
        apu.write_register(0x4005, 0x88 | 0x01);

        // Pulse 1: 0x100 - 0x80 - 1; pulse 2: 0x100 - 0x80.
        assert_eq!(apu.pulse1.sweep_target_period(), 0x7F);
        assert_eq!(apu.pulse2.sweep_target_period(), 0x80);
    }

    #[test]
    fn triangle_needs_both_counters_to_advance() {
        let mut apu = Apu::new();
        apu.write_register(0x4015, 0x04);
        apu.write_register(0x400A, 0x20);
        apu.write_register(0x400B, 0x08); // loads length, sets reload flag
        apu.write_register(0x4008, 0x05); // linear reload value 5

        // Linear counter is still zero until a quarter-frame clock.
        let step_before = apu.triangle.seq_step;
        tick_n(&mut apu, 0x21 * 3);
        assert_eq!(apu.triangle.seq_step, step_before);

        tick_n(&mut apu, FC_4STEP_Q1);
        assert!(apu.triangle.linear_counter > 0);
        let step_before = apu.triangle.seq_step;
        tick_n(&mut apu, 0x21 * 2);
        assert_ne!(apu.triangle.seq_step, step_before);
    }

    #[test]
    fn noise_lfsr_starts_seeded_and_shifts() {
        let mut apu = Apu::new();
        assert_eq!(apu.noise.shift_register, 1);

        apu.write_register(0x400E, 0x00);
        // Period table entry 0 is 4 CPU cycles; the timer halves that
        // again, so a handful of ticks is enough to shift.
        tick_n(&mut apu, 64);
        assert_ne!(apu.noise.shift_register, 1);
    }

    #[test]
    fn dmc_requests_dma_from_the_sample_start_address() {
        let mut apu = Apu::new();
        apu.write_register(0x4012, 0x04); // $C000 + 64*4 = $C100
        apu.write_register(0x4013, 0x01); // 16*1 + 1 = 17 bytes
        apu.write_register(0x4015, 0x10);

        tick_n(&mut apu, 4);
        assert_eq!(apu.take_dmc_dma_request(), Some(0xC100));
        apu.complete_dmc_dma(0xAA);
        assert_eq!(apu.dmc.bytes_remaining, 16);
    }

    #[test]
    fn resampler_produces_stereo_pairs_at_44100() {
        let mut apu = Apu::new();
        // One NTSC frame of CPU cycles.
        tick_n(&mut apu, 29_781);
        let queued = apu.queued_samples();
        // 44100 / 60.0988 ≈ 733.8 mono samples, stereo doubles that.
        assert!((1460..=1476).contains(&queued), "queued = {queued}");

        let mut buf = [0i16; 4096];
        let written = apu.drain_samples(&mut buf);
        assert_eq!(written, queued);
        assert_eq!(written % 2, 0);
        assert_eq!(apu.queued_samples(), 0);
    }
}
