//! Display resize driver: `xrandr`/`cvt` subprocess orchestration to change
//! the X screen resolution. Every external call uses an argument
//! vector (no shell) and is bounded to 3 seconds.

use regex::Regex;
use std::process::Command;
use std::time::Duration;
use tracing::{info, warn};

const DVI_CAP: (u32, u32) = (2560, 1600);
const DEFAULT_CAP: (u32, u32) = (7680, 4320);
const SHRINK_FACTOR: f64 = 0.9999;

#[derive(Debug, Clone, PartialEq)]
pub struct ScreenMode {
    pub name: String,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone)]
pub struct ScreenInfo {
    pub output_name: String,
    pub is_dvi: bool,
    pub modes: Vec<ScreenMode>,
}

/// Runs `xrandr` with no arguments and parses the connected output name and
/// its advertised modes.
pub fn query_screen() -> anyhow::Result<ScreenInfo> {
    let output = run_bounded("xrandr", &[])?;
    parse_xrandr_output(&output)
}

fn parse_xrandr_output(text: &str) -> anyhow::Result<ScreenInfo> {
    let output_re = Regex::new(r"^(\S+) connected").unwrap();
    let mode_re = Regex::new(r"^\s*(\d+)x(\d+)").unwrap();

    let mut output_name = None;
    let mut is_dvi = false;
    let mut modes = Vec::new();

    for line in text.lines() {
        if let Some(caps) = output_re.captures(line) {
            let name = caps[1].to_string();
            is_dvi = name.to_uppercase().starts_with("DVI");
            output_name = Some(name);
            continue;
        }
        if output_name.is_some() {
            if let Some(caps) = mode_re.captures(line) {
                let width: u32 = caps[1].parse()?;
                let height: u32 = caps[2].parse()?;
                modes.push(ScreenMode { name: format!("{width}x{height}"), width, height });
            }
        }
    }

    let output_name = output_name.ok_or_else(|| anyhow::anyhow!("no connected xrandr output found"))?;
    Ok(ScreenInfo { output_name, is_dvi, modes })
}

/// Clamps a target resolution to the per-screen cap by iterative 0.9999
/// multiplicative shrinking, then rounds up to an even pixel count.
pub fn clamp_to_cap(width: u32, height: u32, is_dvi: bool) -> (u32, u32) {
    let (cap_w, cap_h) = if is_dvi { DVI_CAP } else { DEFAULT_CAP };
    let mut w = width as f64;
    let mut h = height as f64;
    while w > cap_w as f64 || h > cap_h as f64 {
        w *= SHRINK_FACTOR;
        h *= SHRINK_FACTOR;
    }
    let w = w.ceil() as u32;
    let h = h.ceil() as u32;
    (w + w % 2, h + h % 2)
}

/// Performs the full resize sequence for a target `WxH`. No-ops if the
/// target is already the current mode.
pub fn resize(target_width: u32, target_height: u32) -> anyhow::Result<()> {
    let screen = query_screen()?;
    let (width, height) = clamp_to_cap(target_width, target_height, screen.is_dvi);

    if screen.modes.iter().any(|m| m.width == width && m.height == height) {
        info!(width, height, "display already at target resolution");
        return Ok(());
    }

    if !screen.modes.iter().any(|m| m.width == width && m.height == height) {
        let modeline = generate_modeline(width, height)?;
        add_mode(&screen.output_name, &modeline)?;
    }

    set_mode(&screen.output_name, width, height)
}

fn generate_modeline(width: u32, height: u32) -> anyhow::Result<Modeline> {
    let cvt_output = run_bounded("cvt", &["-r", &width.to_string(), &height.to_string()])?;
    parse_cvt_modeline(&cvt_output)
}

#[derive(Debug, Clone)]
struct Modeline {
    name: String,
    params: Vec<String>,
}

fn parse_cvt_modeline(text: &str) -> anyhow::Result<Modeline> {
    let line = text
        .lines()
        .find(|l| l.trim_start().starts_with("Modeline"))
        .ok_or_else(|| anyhow::anyhow!("cvt produced no Modeline"))?;
    let mut toks = line.trim_start().trim_start_matches("Modeline").trim().split_whitespace();
    let name = toks.next().ok_or_else(|| anyhow::anyhow!("cvt Modeline missing name"))?.trim_matches('"').to_string();
    let params: Vec<String> = toks.map(|s| s.to_string()).collect();
    Ok(Modeline { name, params })
}

fn add_mode(output: &str, modeline: &Modeline) -> anyhow::Result<()> {
    let mut newmode_args = vec!["--newmode".to_string(), modeline.name.clone()];
    newmode_args.extend(modeline.params.iter().cloned());
    let newmode_args: Vec<&str> = newmode_args.iter().map(String::as_str).collect();
    run_bounded("xrandr", &newmode_args)?;
    run_bounded("xrandr", &["--addmode", output, &modeline.name])?;
    Ok(())
}

fn set_mode(output: &str, width: u32, height: u32) -> anyhow::Result<()> {
    let mode = format!("{width}x{height}");
    run_bounded("xrandr", &["--output", output, "--mode", &mode])?;
    Ok(())
}

fn run_bounded(cmd: &str, args: &[&str]) -> anyhow::Result<String> {
    let mut command = Command::new(cmd);
    command.args(args);
    let output = run_with_timeout(command, Duration::from_secs(3))?;
    if !output.status.success() {
        anyhow::bail!("{cmd} exited with {:?}", output.status.code());
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

fn run_with_timeout(mut command: Command, timeout: Duration) -> anyhow::Result<std::process::Output> {
    use std::sync::mpsc;
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let _ = tx.send(command.output());
    });
    match rx.recv_timeout(timeout) {
        Ok(result) => result.map_err(Into::into),
        Err(_) => {
            warn!("subprocess exceeded 3s timeout");
            anyhow::bail!("subprocess timed out")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_passes_through_in_range_resolution() {
        assert_eq!(clamp_to_cap(1920, 1080, false), (1920, 1080));
    }

    #[test]
    fn clamp_shrinks_past_default_cap() {
        let (w, h) = clamp_to_cap(8000, 4500, false);
        assert!(w <= DEFAULT_CAP.0 && h <= DEFAULT_CAP.1);
    }

    #[test]
    fn clamp_uses_dvi_cap_when_flagged() {
        let (w, h) = clamp_to_cap(3000, 2000, true);
        assert!(w <= DVI_CAP.0 && h <= DVI_CAP.1);
    }

    #[test]
    fn clamp_rounds_up_to_even() {
        let (w, h) = clamp_to_cap(1921, 1081, false);
        assert_eq!(w % 2, 0);
        assert_eq!(h % 2, 0);
    }

    #[test]
    fn parses_connected_output_and_modes() {
        let sample = "HDMI-1 connected primary 1920x1080+0+0\n   1920x1080     60.00*+\n   1280x720      60.00\nVGA-1 disconnected\n";
        let info = parse_xrandr_output(sample).expect("parse");
        assert_eq!(info.output_name, "HDMI-1");
        assert!(!info.is_dvi);
        assert_eq!(info.modes.len(), 2);
    }

    #[test]
    fn parses_cvt_modeline() {
        let sample = "# 1920x1080 59.96 Hz (CVT 2.07M9-R) hsync: 66.59 kHz; pclk: 138.50 MHz\nModeline \"1920x1080_60.00\"  138.50  1920 1968 2000 2080  1080 1083 1088 1120 +hsync -vsync\n";
        let modeline = parse_cvt_modeline(sample).expect("parse");
        assert_eq!(modeline.name, "1920x1080_60.00");
        assert!(!modeline.params.is_empty());
    }
}
