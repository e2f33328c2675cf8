use std::path::Path;

use tracing::info;
use v4l::{capability::Flags, video::Capture, Device, FourCC};

use crate::capture::StreamMode;

/// Detected capture device info
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundDevice {
    pub path: String,
    /// Best mode the device offers
    pub mode: StreamMode,
}

/// Find the first video device that streams MJPEG or YUYV.
pub async fn auto_detect_device() -> Option<FoundDevice> {
    info!("Auto-detecting capture devices...");

    for i in 0..10 {
        let path = format!("/dev/video{}", i);
        if !Path::new(&path).exists() {
            continue;
        }
        let Ok(dev) = Device::with_path(&path) else {
            continue;
        };
        let Ok(caps) = dev.query_caps() else {
            continue;
        };
        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
            continue;
        }

        // Prefer devices with MJPEG support
        let Ok(formats) = dev.enum_formats() else {
            continue;
        };
        let mut found = None;
        for fmt in formats {
            if fmt.fourcc == FourCC::new(b"MJPG") {
                info!("Found MJPEG device: {} - {}", path, caps.card);
                found = Some(StreamMode::Compressed);
                break;
            } else if fmt.fourcc == FourCC::new(b"YUYV") {
                found.get_or_insert(StreamMode::Raw);
            }
        }
        if let Some(mode) = found {
            info!("Using {} in {:?} mode", path, mode);
            return Some(FoundDevice { path, mode });
        }
    }

    None
}
