//! SDL2 Window Display Module
//! Renders frames forwarded by a [`ChannelSink`](super::ChannelSink) on the
//! thread that owns the SDL context.

use std::time::Duration;

use color_eyre::{eyre::eyre, Result};
use flume::{Receiver, RecvTimeoutError};
use sdl2::event::Event;
use sdl2::pixels::{Color, PixelFormatEnum};
use sdl2::render::{Canvas, TextureCreator};
use sdl2::video::{Window, WindowContext};
use tracing::{debug, info};

use crate::display::sink::{DisplayEvent, DisplayFrame};
use crate::pipeline::OutputFormat;

/// Texture layout and row pitch for a frame format
fn texture_format(format: OutputFormat, width: u32) -> (PixelFormatEnum, usize) {
    let width = width as usize;
    match format {
        OutputFormat::Raw | OutputFormat::Yuyv => (PixelFormatEnum::YUY2, width * 2),
        OutputFormat::Rgb565 => (PixelFormatEnum::RGB565, width * 2),
        // bytes R,G,B,X in memory
        OutputFormat::Rgbx => (PixelFormatEnum::ABGR8888, width * 4),
        OutputFormat::Nv12 => (PixelFormatEnum::NV12, width),
        OutputFormat::Nv21 => (PixelFormatEnum::NV21, width),
        OutputFormat::I420 => (PixelFormatEnum::IYUV, width),
    }
}

/// SDL2 Window Display
pub struct Sdl2Display {
    canvas: Canvas<Window>,
    texture_creator: TextureCreator<WindowContext>,
}

impl Sdl2Display {
    pub fn new(sdl_context: &sdl2::Sdl, width: u32, height: u32) -> Result<Self> {
        let video_subsystem = sdl_context.video().map_err(|e| eyre!(e))?;

        let window = video_subsystem
            .window("UVC Preview", width, height)
            .position_centered()
            .resizable()
            .build()?;

        let canvas = window.into_canvas().present_vsync().build()?;
        let texture_creator = canvas.texture_creator();

        Ok(Self {
            canvas,
            texture_creator,
        })
    }

    pub fn render_frame(&mut self, frame: &DisplayFrame) -> Result<()> {
        let (pixel_format, pitch) = texture_format(frame.format, frame.width);

        let mut texture = self
            .texture_creator
            .create_texture_streaming(pixel_format, frame.width, frame.height)
            .map_err(|e| eyre!(e))?;

        texture
            .update(None, &frame.data, pitch)
            .map_err(|e| eyre!(e))?;

        self.canvas.clear();
        self.canvas
            .copy(&texture, None, None)
            .map_err(|e| eyre!(e))?;

        self.canvas.present();
        Ok(())
    }

    pub fn clear(&mut self) {
        self.canvas.set_draw_color(Color::BLACK);
        self.canvas.clear();
        self.canvas.present();
    }

    /// Pump window events and render frames until the window closes or the
    /// sink side hangs up.
    pub fn run(&mut self, sdl_context: &sdl2::Sdl, rx: Receiver<DisplayEvent>) -> Result<()> {
        let mut event_pump = sdl_context.event_pump().map_err(|e| eyre!(e))?;

        'running: loop {
            for event in event_pump.poll_iter() {
                if let Event::Quit { .. } = event {
                    info!("Quit event received");
                    break 'running;
                }
            }

            match rx.recv_timeout(Duration::from_millis(16)) {
                Ok(DisplayEvent::Frame(frame)) => {
                    if let Err(e) = self.render_frame(&frame) {
                        debug!(sequence = frame.sequence, "render failed: {}", e);
                    }
                }
                Ok(DisplayEvent::Geometry {
                    width,
                    height,
                    format,
                }) => {
                    info!("Display geometry {}x{} {:?}", width, height, format);
                }
                Ok(DisplayEvent::Clear) => self.clear(),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break 'running,
            }
        }

        Ok(())
    }
}
