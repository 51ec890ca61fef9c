pub mod action;
pub mod adapter;
pub mod channel;
pub mod config;
pub mod damage;
pub mod digits;
pub mod end_detect;
pub mod env;
pub mod frame;
pub mod server;
pub mod track;

pub use action::{ActionError, ActionFrame, Button, ControllerRecord, KartAction, SmashAction};
pub use adapter::{
    GameAdapter, MarioKartAdapter, MarioKartRewards, MenuPhase, MenuStep, RaceEndDetection,
    SmashAdapter, SmashRewards, StepContext,
};
pub use channel::{ChannelError, ChannelStatsSnapshot, ControlChannel, Delivery, FrameSkipGuard};
pub use config::EnvConfig;
pub use damage::{DamageTracker, DamageTrackerConfig};
pub use digits::{DamageReading, DigitReadError, DigitRecognizer, GlyphSet, InkMask, RecognizerConfig};
pub use end_detect::{EndDetectorConfig, EndEpisodeDetector, EndPattern};
pub use env::{EmulatorProcess, Mupen64Env, StepResult};
pub use frame::{FrameObserver, FrameSource, PixelGrid, Region, ReplaySource, Rgb};
pub use server::ControllerServer;
pub use track::{CheckpointSet, CheckpointTracker, CheckpointUpdate, HudPalette, LapDetector, Point};
