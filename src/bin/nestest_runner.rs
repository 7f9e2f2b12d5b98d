//! Headless 6502 conformance harness.
//!
//! Runs nestest.nes from the automation entry point ($C000) and prints
//! one canonical trace line per instruction. With a reference log it
//! diffs instead, stopping at the first mismatching line.
//!
//! Usage: nestest_runner <nestest.nes> [nestest.log] [max-instructions]

use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use famicore::Bus;

/// The official-opcode suite reports success by looping here.
const PASS_LANDMARK: u16 = 0xC66E;

fn main() -> ExitCode {
    env_logger::init();
    match run() {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<bool> {
    let mut args = std::env::args().skip(1);
    let rom_path = PathBuf::from(
        args.next()
            .context("usage: nestest_runner <nestest.nes> [nestest.log] [max-instructions]")?,
    );
    let log_path = args.next().map(PathBuf::from);
    let max_instructions: usize = args
        .next()
        .map(|v| v.parse())
        .transpose()
        .context("max-instructions must be a number")?
        .unwrap_or(9_000);

    let mut bus = Bus::new();
    bus.load_rom_file(&rom_path)
        .with_context(|| format!("failed to load {}", rom_path.display()))?;
    bus.begin_nestest();

    let reference: Option<Vec<String>> = match &log_path {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            Some(text.lines().map(|l| l.trim_end().to_string()).collect())
        }
        None => None,
    };

    let mut executed = 0usize;
    while executed < max_instructions {
        if bus.cpu_halted() {
            eprintln!("CPU jammed after {executed} instructions");
            return Ok(false);
        }

        let line = bus.trace_line();
        match &reference {
            Some(lines) => {
                let Some(expected) = lines.get(executed) else {
                    println!("matched all {} reference lines", lines.len());
                    return Ok(true);
                };
                if line != *expected {
                    eprintln!("mismatch at line {}:", executed + 1);
                    eprintln!("  got:      {line}");
                    eprintln!("  expected: {expected}");
                    return Ok(false);
                }
            }
            None => println!("{line}"),
        }

        if bus.cpu_pc() == PASS_LANDMARK && executed > 0 {
            eprintln!("reached ${PASS_LANDMARK:04X} after {executed} instructions");
            return Ok(true);
        }

        bus.step_instruction();
        executed += 1;
    }

    eprintln!("stopped after {executed} instructions");
    Ok(true)
}
