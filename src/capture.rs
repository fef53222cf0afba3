use std::fs;
use std::io::Cursor;
use std::process::Command;
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};

/// One captured frame, downscaled and encoded for the perception service.
#[derive(Debug, Clone)]
pub struct Screenshot {
    pub image_b64: String,
    pub width: u32,
    pub height: u32,
    pub file_ref: String,
}

/// Screen capture seam. `screen_size` reports the dimensions as known right
/// now, so bbox conversion always uses conversion-time geometry.
#[async_trait]
pub trait ScreenCapture: Send + Sync {
    async fn capture(&self) -> Result<Screenshot>;
    fn screen_size(&self) -> (u32, u32);
}

/// Captures through the platform screenshot tool, keeping the image within
/// a bounded width before encoding so perception requests stay small.
pub struct PlatformCapture {
    last_width: AtomicU32,
    last_height: AtomicU32,
}

const MAX_CAPTURE_DIM: u32 = 1920;

impl PlatformCapture {
    pub fn new() -> Self {
        Self {
            last_width: AtomicU32::new(1920),
            last_height: AtomicU32::new(1080),
        }
    }

    fn capture_to_file(path: &str) -> Result<()> {
        #[cfg(target_os = "macos")]
        {
            let status = Command::new("screencapture")
                .arg("-x")
                .arg(path)
                .status()
                .context("Failed to run screencapture")?;
            if !status.success() {
                return Err(anyhow::anyhow!("screencapture exited with failure"));
            }
            Ok(())
        }
        #[cfg(target_os = "linux")]
        {
            // gnome-screenshot first, ImageMagick as the fallback.
            let gnome = Command::new("gnome-screenshot").arg("-f").arg(path).status();
            if matches!(gnome, Ok(s) if s.success()) {
                return Ok(());
            }
            let status = Command::new("import")
                .arg("-window")
                .arg("root")
                .arg(path)
                .status()
                .context("Failed to run a screenshot tool (gnome-screenshot/import)")?;
            if !status.success() {
                return Err(anyhow::anyhow!("screenshot tool exited with failure"));
            }
            Ok(())
        }
        #[cfg(target_os = "windows")]
        {
            let script = format!(
                "Add-Type -AssemblyName System.Windows.Forms,System.Drawing; \
                 $b = New-Object System.Drawing.Bitmap([System.Windows.Forms.SystemInformation]::VirtualScreen.Width, [System.Windows.Forms.SystemInformation]::VirtualScreen.Height); \
                 $g = [System.Drawing.Graphics]::FromImage($b); \
                 $g.CopyFromScreen(0, 0, 0, 0, $b.Size); \
                 $b.Save('{}')",
                path
            );
            let status = Command::new("powershell")
                .arg("-NoProfile")
                .arg("-Command")
                .arg(&script)
                .status()
                .context("Failed to run powershell screenshot")?;
            if !status.success() {
                return Err(anyhow::anyhow!("powershell screenshot exited with failure"));
            }
            Ok(())
        }
        #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
        {
            let _ = path;
            Err(anyhow::anyhow!("No screenshot tool available on this platform"))
        }
    }
}

impl Default for PlatformCapture {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ScreenCapture for PlatformCapture {
    async fn capture(&self) -> Result<Screenshot> {
        let path = format!("/tmp/deskdriver_{}.png", uuid::Uuid::new_v4());
        let path_for_task = path.clone();

        // Subprocess + image decode are blocking work.
        let screenshot = tokio::task::spawn_blocking(move || -> Result<Screenshot> {
            Self::capture_to_file(&path_for_task)?;
            let data = fs::read(&path_for_task).context("Failed to read captured image")?;

            let img = image::load_from_memory(&data).context("Failed to decode captured image")?;
            let (width, height) = (img.width(), img.height());

            let resized = if width > MAX_CAPTURE_DIM {
                img.resize(MAX_CAPTURE_DIM, MAX_CAPTURE_DIM, image::imageops::FilterType::Triangle)
            } else {
                img
            };

            let mut buffer = Cursor::new(Vec::new());
            resized
                .write_to(&mut buffer, image::ImageOutputFormat::Jpeg(80))
                .context("Failed to encode screenshot")?;

            Ok(Screenshot {
                image_b64: general_purpose::STANDARD.encode(buffer.get_ref()),
                width,
                height,
                file_ref: path_for_task,
            })
        })
        .await
        .context("Screenshot task panicked")??;

        self.last_width.store(screenshot.width, Ordering::Relaxed);
        self.last_height.store(screenshot.height, Ordering::Relaxed);

        // The encoded copy is what travels; the temp file is only a debug ref.
        let _ = fs::remove_file(&path);

        Ok(screenshot)
    }

    fn screen_size(&self) -> (u32, u32) {
        (
            self.last_width.load(Ordering::Relaxed),
            self.last_height.load(Ordering::Relaxed),
        )
    }
}
