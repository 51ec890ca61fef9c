//! Per-title knowledge: how actions map to controls, how rewards and episode
//! ends are read off the screen, and which button presses navigate the menus.

pub mod mario_kart;
pub mod smash;

pub use mario_kart::{MarioKartAdapter, MarioKartRewards, RaceEndDetection};
pub use smash::{SmashAdapter, SmashRewards};

use crate::action::ActionFrame;
use crate::frame::PixelGrid;

/// What the driver knows about the step being scored.
#[derive(Debug, Clone, Copy)]
pub struct StepContext {
    /// Steps taken this episode before the current one.
    pub step_count: u64,
    pub episode_over: bool,
    pub action: ActionFrame,
    /// Emulator frames covered by one step.
    pub frames_per_step: u32,
}

/// When a menu script runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MenuPhase {
    /// Emulator just started; get from the title screen into gameplay.
    Boot,
    /// The previous episode finished normally.
    AfterEpisode,
    /// The previous episode was cut short.
    MidEpisode { steps_taken: u64, frames_per_step: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MenuStep {
    /// Push `frame` then a release frame, `times` times.
    Press { frame: ActionFrame, times: u32 },
    /// Push `frames` no-op frames.
    Wait { frames: u32 },
}

impl MenuStep {
    pub fn press(frame: ActionFrame) -> Self {
        MenuStep::Press { frame, times: 1 }
    }

    pub fn wait(frames: u32) -> Self {
        MenuStep::Wait { frames }
    }

    /// Number of frames this step pushes.
    pub fn frame_count(&self) -> u64 {
        match *self {
            MenuStep::Press { times, .. } => 2 * times as u64,
            MenuStep::Wait { frames } => frames as u64,
        }
    }
}

pub trait GameAdapter {
    fn name(&self) -> &str;

    /// Turns an agent action into a controller vector; shorter vectors are
    /// zero-padded by the encoder.
    fn expand_action(&self, action: &[i32]) -> Vec<i32> {
        action.to_vec()
    }

    /// Clears per-episode state. Called before the reset menu script runs.
    fn reset_episode(&mut self);

    /// Whether `grid` shows the end of the episode. Called once per step,
    /// before [`GameAdapter::extract_reward`].
    fn extract_end_state(&mut self, grid: &PixelGrid) -> bool;

    fn extract_reward(&mut self, grid: &PixelGrid, ctx: &StepContext) -> f64;

    fn menu_script(&self, phase: MenuPhase) -> Vec<MenuStep>;
}

impl<G: GameAdapter + ?Sized> GameAdapter for Box<G> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn expand_action(&self, action: &[i32]) -> Vec<i32> {
        (**self).expand_action(action)
    }

    fn reset_episode(&mut self) {
        (**self).reset_episode()
    }

    fn extract_end_state(&mut self, grid: &PixelGrid) -> bool {
        (**self).extract_end_state(grid)
    }

    fn extract_reward(&mut self, grid: &PixelGrid, ctx: &StepContext) -> f64 {
        (**self).extract_reward(grid, ctx)
    }

    fn menu_script(&self, phase: MenuPhase) -> Vec<MenuStep> {
        (**self).menu_script(phase)
    }
}

/// Common menu controls, `[X, Y, A, B, R]`.
pub mod controls {
    use crate::action::{ActionFrame, Button};

    pub const NOOP: ActionFrame = ActionFrame::NOOP;

    pub fn a() -> ActionFrame {
        ActionFrame::NOOP.with_button(Button::A)
    }

    pub fn b() -> ActionFrame {
        ActionFrame::NOOP.with_button(Button::B)
    }

    pub fn start() -> ActionFrame {
        ActionFrame::NOOP.with_button(Button::Start)
    }

    pub fn c_right() -> ActionFrame {
        ActionFrame::NOOP.with_button(Button::CRight)
    }

    pub fn up() -> ActionFrame {
        ActionFrame::new(0, 80)
    }

    pub fn down() -> ActionFrame {
        ActionFrame::new(0, -80)
    }

    pub fn left() -> ActionFrame {
        ActionFrame::new(-80, 0)
    }

    pub fn right() -> ActionFrame {
        ActionFrame::new(80, 0)
    }
}
