#[cfg(feature = "sdl-display")]
pub mod display;
pub mod sink;

#[cfg(feature = "sdl-display")]
pub use display::Sdl2Display;
pub use sink::{ChannelSink, DisplayEvent, DisplayFrame, DisplaySink};
