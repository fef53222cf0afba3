use anyhow::{Context, Result};
use std::process::Command;

/// OS input primitives. Implementations are synchronous and uninterruptible;
/// the dispatcher decides how they are scheduled and timed out.
pub trait OsInput: Send + Sync {
    fn press(&self, key: &str) -> Result<()>;
    fn hotkey(&self, keys: &[String]) -> Result<()>;
    fn click(&self, x: i32, y: i32) -> Result<()>;
    fn type_text(&self, text: &str) -> Result<()>;
    fn scroll(&self, amount: i32) -> Result<()>;
}

/// Injects input through platform tools: osascript on macOS, xdotool on
/// Linux, SendKeys via PowerShell on Windows.
pub struct PlatformInput;

impl PlatformInput {
    pub fn new() -> Self {
        Self
    }

    #[cfg(target_os = "macos")]
    fn osascript(script: &str) -> Result<()> {
        let output = Command::new("osascript")
            .arg("-e")
            .arg(script)
            .output()
            .context("Failed to run osascript")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(anyhow::anyhow!("osascript error: {}", stderr));
        }
        Ok(())
    }

    #[cfg(target_os = "linux")]
    fn xdotool(args: &[&str]) -> Result<()> {
        let status = Command::new("xdotool")
            .args(args)
            .status()
            .context("Failed to run xdotool")?;
        if !status.success() {
            return Err(anyhow::anyhow!("xdotool {:?} exited with failure", args));
        }
        Ok(())
    }

    #[cfg(target_os = "windows")]
    fn powershell(script: &str) -> Result<()> {
        let status = Command::new("powershell")
            .arg("-NoProfile")
            .arg("-Command")
            .arg(script)
            .status()
            .context("Failed to run powershell")?;
        if !status.success() {
            return Err(anyhow::anyhow!("powershell input command exited with failure"));
        }
        Ok(())
    }
}

impl Default for PlatformInput {
    fn default() -> Self {
        Self::new()
    }
}

/// The platform meta key: opens the OS launcher/search surface everywhere.
pub fn meta_key() -> &'static str {
    #[cfg(target_os = "macos")]
    {
        "command"
    }
    #[cfg(target_os = "windows")]
    {
        "win"
    }
    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    {
        "super"
    }
}

/// Chord that brings up the OS search box.
pub fn os_search_chord() -> Vec<String> {
    #[cfg(target_os = "macos")]
    {
        vec!["command".to_string(), "space".to_string()]
    }
    #[cfg(not(target_os = "macos"))]
    {
        vec![meta_key().to_string()]
    }
}

impl OsInput for PlatformInput {
    fn press(&self, key: &str) -> Result<()> {
        #[cfg(target_os = "macos")]
        {
            let code = match key.to_lowercase().as_str() {
                "enter" | "return" => "36",
                "tab" => "48",
                "escape" | "esc" => "53",
                "space" => "49",
                "command" | "win" | "super" => "55",
                _ => {
                    return Self::osascript(&format!(
                        "tell application \"System Events\" to keystroke \"{}\"",
                        key.replace('"', "\\\"")
                    ))
                }
            };
            Self::osascript(&format!("tell application \"System Events\" to key code {}", code))
        }
        #[cfg(target_os = "linux")]
        {
            let lowered = key.to_lowercase();
            let key = match lowered.as_str() {
                "enter" | "return" => "Return",
                "esc" | "escape" => "Escape",
                "tab" => "Tab",
                "space" => "space",
                "win" | "command" | "super" => "super",
                other => other,
            };
            Self::xdotool(&["key", key])
        }
        #[cfg(target_os = "windows")]
        {
            let mapped = match key.to_lowercase().as_str() {
                "enter" | "return" => "{ENTER}",
                "tab" => "{TAB}",
                "escape" | "esc" => "{ESC}",
                "win" | "super" => "^{ESC}",
                other => return Self::powershell(&format!(
                    "[System.Windows.Forms.SendKeys]::SendWait('{}')",
                    other
                )),
            };
            Self::powershell(&format!(
                "Add-Type -AssemblyName System.Windows.Forms; [System.Windows.Forms.SendKeys]::SendWait('{}')",
                mapped
            ))
        }
        #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
        {
            let _ = key;
            Err(anyhow::anyhow!("No input backend on this platform"))
        }
    }

    fn hotkey(&self, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Err(anyhow::anyhow!("Empty key combination"));
        }
        if keys.len() == 1 {
            return self.press(&keys[0]);
        }
        #[cfg(target_os = "macos")]
        {
            let (key, modifiers) = match keys.split_last() {
                Some(pair) => pair,
                None => return Err(anyhow::anyhow!("Empty key combination")),
            };
            let mods = modifiers
                .iter()
                .map(|m| format!("{} down", m))
                .collect::<Vec<_>>()
                .join(", ");
            Self::osascript(&format!(
                "tell application \"System Events\" to keystroke \"{}\" using {{{}}}",
                key.replace('"', "\\\""),
                mods
            ))
        }
        #[cfg(target_os = "linux")]
        {
            let combo = keys.join("+");
            Self::xdotool(&["key", &combo])
        }
        #[cfg(target_os = "windows")]
        {
            let mut chord = String::new();
            for key in keys {
                match key.to_lowercase().as_str() {
                    "ctrl" | "control" => chord.push('^'),
                    "alt" => chord.push('%'),
                    "shift" => chord.push('+'),
                    other => chord.push_str(other),
                }
            }
            Self::powershell(&format!(
                "Add-Type -AssemblyName System.Windows.Forms; [System.Windows.Forms.SendKeys]::SendWait('{}')",
                chord
            ))
        }
        #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
        {
            Err(anyhow::anyhow!("No input backend on this platform"))
        }
    }

    fn click(&self, x: i32, y: i32) -> Result<()> {
        #[cfg(target_os = "macos")]
        {
            Self::osascript(&format!(
                "tell application \"System Events\" to click at {{{}, {}}}",
                x, y
            ))
        }
        #[cfg(target_os = "linux")]
        {
            Self::xdotool(&["mousemove", &x.to_string(), &y.to_string()])?;
            Self::xdotool(&["click", "1"])
        }
        #[cfg(target_os = "windows")]
        {
            let script = format!(
                "Add-Type -AssemblyName System.Windows.Forms; \
                 [System.Windows.Forms.Cursor]::Position = New-Object System.Drawing.Point({}, {}); \
                 $sig = '[DllImport(\"user32.dll\")] public static extern void mouse_event(uint f, uint x, uint y, uint d, int e);'; \
                 $m = Add-Type -MemberDefinition $sig -Name M -Namespace W32 -PassThru; \
                 $m::mouse_event(0x02, 0, 0, 0, 0); $m::mouse_event(0x04, 0, 0, 0, 0)",
                x, y
            );
            Self::powershell(&script)
        }
        #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
        {
            let _ = (x, y);
            Err(anyhow::anyhow!("No input backend on this platform"))
        }
    }

    fn type_text(&self, text: &str) -> Result<()> {
        #[cfg(target_os = "macos")]
        {
            Self::osascript(&format!(
                "tell application \"System Events\" to keystroke \"{}\"",
                text.replace('\\', "\\\\").replace('"', "\\\"")
            ))
        }
        #[cfg(target_os = "linux")]
        {
            Self::xdotool(&["type", "--delay", "50", text])
        }
        #[cfg(target_os = "windows")]
        {
            Self::powershell(&format!(
                "Add-Type -AssemblyName System.Windows.Forms; [System.Windows.Forms.SendKeys]::SendWait('{}')",
                text.replace('\'', "''")
            ))
        }
        #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
        {
            let _ = text;
            Err(anyhow::anyhow!("No input backend on this platform"))
        }
    }

    fn scroll(&self, amount: i32) -> Result<()> {
        #[cfg(target_os = "macos")]
        {
            // Negative scrolls down, matching the wheel convention.
            let code = if amount < 0 { 121 } else { 116 };
            Self::osascript(&format!("tell application \"System Events\" to key code {}", code))
        }
        #[cfg(target_os = "linux")]
        {
            let button = if amount < 0 { "5" } else { "4" };
            for _ in 0..amount.unsigned_abs().min(10) {
                Self::xdotool(&["click", button])?;
            }
            Ok(())
        }
        #[cfg(target_os = "windows")]
        {
            let key = if amount < 0 { "{PGDN}" } else { "{PGUP}" };
            Self::powershell(&format!(
                "Add-Type -AssemblyName System.Windows.Forms; [System.Windows.Forms.SendKeys]::SendWait('{}')",
                key
            ))
        }
        #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
        {
            let _ = amount;
            Err(anyhow::anyhow!("No input backend on this platform"))
        }
    }
}
