//! Partial emulation with sentinel tracking

mod context;
mod emulator;

pub use context::{is_sentinel, sentinel_base, Context, Flags, SENTINEL_TAG};
pub use emulator::{
    AllowNone, AllowRange, Emulation, Emulator, Halt, MemoryWrite, Step, WritePolicy,
};
