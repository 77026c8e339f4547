// SPDX-FileCopyrightText: Copyright © 2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! VESA mode selection for the LILO boot menu

use std::fmt;

use topology::{Invocation, System};

/// `(width, height, depth, mode)`, `None` where VESA defines no mode
type Entry = (u32, u32, u32, Option<u16>);

const RESOLUTIONS: [(u32, u32); 15] = [
    (320, 200),
    (640, 400),
    (640, 480),
    (800, 500),
    (800, 600),
    (896, 672),
    (1024, 640),
    (1024, 768),
    (1152, 720),
    (1280, 800),
    (1280, 1024),
    (1400, 1050),
    (1440, 900),
    (1600, 1200),
    (1920, 1200),
];

// Codes per depth, in RESOLUTIONS order
const DEPTH_8: [Option<u16>; 15] = [
    None,
    Some(768),
    Some(769),
    Some(879),
    Some(771),
    Some(815),
    Some(874),
    Some(773),
    Some(869),
    Some(864),
    Some(775),
    Some(796),
    Some(864),
    Some(796),
    Some(893),
];
const DEPTH_15: [u16; 15] = [781, 801, 784, 880, 787, 816, 875, 790, 870, 865, 793, 797, 865, 797, 894];
const DEPTH_16: [u16; 15] = [782, 802, 785, 881, 788, 817, 876, 791, 871, 866, 794, 798, 866, 798, 895];
const DEPTH_24: [u16; 15] = [783, 803, 786, 882, 789, 818, 877, 792, 872, 867, 795, 799, 867, 799, 896];
const DEPTH_32: [Option<u16>; 15] = [
    None,
    Some(804),
    Some(809),
    Some(883),
    Some(814),
    Some(819),
    Some(878),
    Some(824),
    Some(873),
    Some(868),
    Some(829),
    Some(834),
    Some(868),
    Some(834),
    Some(897),
];

/// 4 bit colour only has a few modes
const DEPTH_4: [Entry; 3] = [
    (800, 600, 4, Some(770)),
    (1024, 768, 4, Some(772)),
    (1280, 1024, 4, Some(774)),
];

const GEOMETRY: &str = "fbset | grep -w geometry";

/// Every known mode, largest first: by height, then width, then depth
fn modes() -> Vec<Entry> {
    let mut modes = DEPTH_4.to_vec();
    for (index, (width, height)) in RESOLUTIONS.iter().copied().enumerate() {
        modes.push((width, height, 8, DEPTH_8[index]));
        modes.push((width, height, 15, Some(DEPTH_15[index])));
        modes.push((width, height, 16, Some(DEPTH_16[index])));
        modes.push((width, height, 24, Some(DEPTH_24[index])));
        modes.push((width, height, 32, DEPTH_32[index]));
    }
    modes.sort_by(|a, b| (b.1, b.0, b.2).cmp(&(a.1, a.0, a.2)));
    modes
}

/// The `vga =` setting for LILO
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoMode {
    /// VESA mode number, `None` for plain text
    pub code: Option<u16>,

    /// i.e. `1024x768x32`
    pub label: String,
}

impl VideoMode {
    pub fn text() -> Self {
        Self {
            code: None,
            label: "text".to_owned(),
        }
    }
}

impl fmt::Display for VideoMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{code}"),
            None => f.write_str("normal"),
        }
    }
}

/// Parse the `geometry <xres> <yres> <vxres> <vyres> <depth>` line of fbset
pub fn parse_geometry(line: &str) -> Option<(u32, u32, u32)> {
    let values = line.split_whitespace().collect::<Vec<_>>();
    if values.first() != Some(&"geometry") || values.len() < 4 {
        return None;
    }
    let width = values[1].parse().ok()?;
    let height = values[2].parse().ok()?;
    let depth = values.last()?.parse().ok()?;
    Some((width, height, depth))
}

/// Largest mode fitting within the detected geometry
pub fn best_mode(width: u32, height: u32, depth: u32) -> VideoMode {
    modes()
        .into_iter()
        .filter(|(w, h, d, _)| *w <= width && *h <= height && *d <= depth)
        .find_map(|(w, h, d, code)| {
            code.map(|code| VideoMode {
                code: Some(code),
                label: format!("{w}x{h}x{d}"),
            })
        })
        .unwrap_or_else(VideoMode::text)
}

/// Query the running framebuffer. Anything unexpected means text mode.
pub fn resolve(system: &dyn System) -> VideoMode {
    let lines = match system.output(&Invocation::shell(GEOMETRY)) {
        Ok(lines) => lines,
        Err(e) => {
            log::debug!("No framebuffer information: {e}");
            return VideoMode::text();
        }
    };
    let mode = match lines.iter().find_map(|l| parse_geometry(l)) {
        Some((width, height, depth)) => best_mode(width, height, depth),
        None => VideoMode::text(),
    };
    log::debug!("Using video mode {} ({})", mode, mode.label);
    mode
}
