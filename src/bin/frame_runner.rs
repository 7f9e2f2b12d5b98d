//! Headless frame regression tool: run a ROM for N frames, hash each
//! framebuffer, and report throughput.
//!
//! Usage: frame_runner <rom> [frames] [--hash-every <n>]

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use famicore::Bus;
use sha1::{Digest, Sha1};

fn main() -> Result<()> {
    env_logger::init();

    let mut frames = 60usize;
    let mut hash_every = 0usize;
    let mut rom_path: Option<PathBuf> = None;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--hash-every" => {
                hash_every = args
                    .next()
                    .context("--hash-every needs a value")?
                    .parse()
                    .context("--hash-every must be a number")?;
            }
            other if rom_path.is_none() => rom_path = Some(PathBuf::from(other)),
            other => frames = other.parse().context("frames must be a number")?,
        }
    }
    let rom_path = rom_path.context("usage: frame_runner <rom> [frames] [--hash-every <n>]")?;

    let mut bus = Bus::new();
    bus.load_rom_file(&rom_path)
        .with_context(|| format!("failed to load {}", rom_path.display()))?;
    bus.power_on();

    let mut audio = vec![0i16; 4096];
    let started = Instant::now();
    let mut last_hash = String::new();

    for frame in 1..=frames {
        bus.run_frame();
        // Keep the audio ring from saturating on long runs.
        while bus.audio_samples(&mut audio) > 0 {}

        if hash_every > 0 && frame % hash_every == 0 {
            let mut hasher = Sha1::new();
            hasher.update(bus.frame_pixels());
            last_hash = format!("{:x}", hasher.finalize());
            println!("frame {frame:5}  sha1 {last_hash}");
        }
    }

    let elapsed = started.elapsed();
    let mut hasher = Sha1::new();
    hasher.update(bus.frame_pixels());
    let final_hash = format!("{:x}", hasher.finalize());

    println!(
        "{}: {} frames in {:.2?} ({:.1} fps)",
        rom_path.display(),
        frames,
        elapsed,
        frames as f64 / elapsed.as_secs_f64()
    );
    println!("final frame sha1 {final_hash}");
    if !last_hash.is_empty() && last_hash != final_hash {
        println!("last periodic hash {last_hash}");
    }

    Ok(())
}
