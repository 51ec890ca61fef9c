use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::frame::Region;

pub const DEFAULT_PORT: u16 = 8082;
pub const DEFAULT_ACTION_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_FRAME_SKIP: u32 = 4;
pub const DEFAULT_SCREEN_WIDTH: u32 = 640;
pub const DEFAULT_SCREEN_HEIGHT: u32 = 480;
pub const DEFAULT_SCREEN_DEPTH: u32 = 3;
pub const DEFAULT_OFFSET_X: u32 = 400;
pub const DEFAULT_OFFSET_Y: u32 = 240;

// =============================================================================
// Environment Constants
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvConfig {
    /// Port the input plugin polls.
    pub port: u16,
    /// How long a push waits for the input plugin before giving up on sync.
    pub action_timeout: Duration,
    /// Emulator frames per agent step.
    pub frame_skip: u32,
    pub screen_width: u32,
    pub screen_height: u32,
    pub screen_depth: u32,
    /// Position of the emulator window on a shared desktop.
    pub offset_x: u32,
    pub offset_y: u32,
    /// Emulator renders into its own virtual display, so capture starts at the origin.
    pub use_xvfb: bool,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            action_timeout: Duration::from_secs(DEFAULT_ACTION_TIMEOUT_SECS),
            frame_skip: DEFAULT_FRAME_SKIP,
            screen_width: DEFAULT_SCREEN_WIDTH,
            screen_height: DEFAULT_SCREEN_HEIGHT,
            screen_depth: DEFAULT_SCREEN_DEPTH,
            offset_x: DEFAULT_OFFSET_X,
            offset_y: DEFAULT_OFFSET_Y,
            use_xvfb: false,
        }
    }
}

impl EnvConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds a config from any key/value source; unset keys keep their defaults
    /// and unparsable values are reported and ignored.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = Self::default();
        let config = Self {
            port: read_value(&lookup, "PORT_NUMBER", d.port),
            action_timeout: Duration::from_secs(read_value(
                &lookup,
                "ACTION_TIMEOUT",
                DEFAULT_ACTION_TIMEOUT_SECS,
            )),
            frame_skip: read_positive(&lookup, "FRAME_SKIP", d.frame_skip),
            screen_width: read_positive(&lookup, "SCR_W", d.screen_width),
            screen_height: read_positive(&lookup, "SCR_H", d.screen_height),
            screen_depth: read_positive(&lookup, "SCR_D", d.screen_depth),
            offset_x: read_value(&lookup, "OFFSET_X", d.offset_x),
            offset_y: read_value(&lookup, "OFFSET_Y", d.offset_y),
            use_xvfb: read_flag(&lookup, "USE_XVFB", d.use_xvfb),
        };
        if config.screen_depth != 3 {
            tracing::warn!(
                "SCR_D ({}) is not 3; captures are always RGB",
                config.screen_depth
            );
        }
        config
    }

    /// Capture rectangle of the emulator window.
    pub fn screen_region(&self) -> Region {
        let (x, y) = if self.use_xvfb {
            (0, 0)
        } else {
            (self.offset_x, self.offset_y)
        };
        Region::new(x, y, self.screen_width, self.screen_height)
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.port))
    }
}

fn read_value<T, F>(lookup: &F, name: &str, default: T) -> T
where
    T: FromStr + Copy + std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(name) else {
        return default;
    };
    match raw.trim().parse::<T>() {
        Ok(value) => value,
        Err(_) => {
            tracing::warn!("{} ({:?}) is not valid. Falling back to {}.", name, raw, default);
            default
        }
    }
}

fn read_positive<F>(lookup: &F, name: &str, default: u32) -> u32
where
    F: Fn(&str) -> Option<String>,
{
    let value = read_value(lookup, name, default);
    if value == 0 {
        tracing::warn!("{} must be positive. Falling back to {}.", name, default);
        return default;
    }
    value
}

fn read_flag<F>(lookup: &F, name: &str, default: bool) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(name) else {
        return default;
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" | "" => false,
        _ => {
            tracing::warn!("{} ({:?}) is not a boolean. Falling back to {}.", name, raw, default);
            default
        }
    }
}
