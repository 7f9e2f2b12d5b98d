pub mod nes;

pub use nes::cartridge::Cartridge;
pub use nes::error::NesError;
pub use nes::{
    Bus, BUTTON_A, BUTTON_B, BUTTON_DOWN, BUTTON_LEFT, BUTTON_RIGHT, BUTTON_SELECT, BUTTON_START,
    BUTTON_UP,
};
