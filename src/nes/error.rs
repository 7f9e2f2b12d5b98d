use thiserror::Error;

/// Errors surfaced while constructing or restoring emulator state.
///
/// Runtime misbehavior from the executing game (unmapped reads, writes to
/// ROM, malformed register sequences) is never an error; the core mimics
/// the hardware and keeps going.
#[derive(Debug, Error)]
pub enum NesError {
    #[error("bad ROM image: {0}")]
    CartridgeFormat(String),

    #[error("unsupported mapper {0}")]
    UnsupportedMapper(u16),

    #[error("bad save state: {0}")]
    SaveStateFormat(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
