//! Channel layout of the forecast model.
//!
//! Eight surface channels come first, followed by five upper-air variables at
//! thirteen pressure levels each. Upper-air channels are named by the variable
//! letter followed by the level in hPa (`u850`, `z500`).

pub const SURFACE_CHANNELS: [&str; 8] = [
    "u10m", "v10m", "u100m", "v100m", "t2m", "sp", "msl", "tcwv",
];

pub const PRESSURE_VARIABLES: [&str; 5] = ["u", "v", "z", "t", "r"];

/// Pressure levels in hPa, top of the atmosphere first.
pub const PRESSURE_LEVELS: [u32; 13] = [
    50, 100, 150, 200, 250, 300, 400, 500, 600, 700, 850, 925, 1000,
];

pub fn pressure_channel(variable: &str, level_hpa: u32) -> String {
    format!("{variable}{level_hpa}")
}

/// Splits `u850` into `("u", 850)`. Surface channels such as `u10m` do not
/// carry a pressure level and return `None`.
pub fn split_pressure_channel(name: &str) -> Option<(&str, u32)> {
    let digits_at = name.find(|c: char| c.is_ascii_digit())?;
    let (variable, level) = name.split_at(digits_at);
    if variable.is_empty() {
        return None;
    }
    level.parse().ok().map(|level| (variable, level))
}

pub fn is_model_channel(name: &str) -> bool {
    if SURFACE_CHANNELS.contains(&name) {
        return true;
    }
    split_pressure_channel(name).is_some_and(|(variable, level)| {
        PRESSURE_VARIABLES.contains(&variable) && PRESSURE_LEVELS.contains(&level)
    })
}
