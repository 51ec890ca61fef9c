use anyhow::Result;
use clap::ValueEnum;

use super::controls::{a, c_right, down, left, right, start, up};
use super::{GameAdapter, MenuPhase, MenuStep, StepContext};
use crate::end_detect::{EndDetectorConfig, EndEpisodeDetector, EndPattern};
use crate::frame::{PixelGrid, Rgb};
use crate::track::{CheckpointSet, CheckpointTracker, HudPalette, LapDetector, Point};

// =============================================================================
// Reward Tuning Knobs
// =============================================================================

#[derive(Debug, Clone)]
pub struct MarioKartRewards {
    pub step: f64,
    pub lap: f64,
    pub checkpoint: f64,
    pub backwards: f64,
    pub finish: f64,
    /// Finishing pays `finish + finish_step_scale * (finish_step_par - steps)`.
    pub finish_step_scale: f64,
    pub finish_step_par: f64,
}

impl Default for MarioKartRewards {
    fn default() -> Self {
        Self {
            step: -0.1,
            lap: 100.0,
            checkpoint: 0.5,
            backwards: -1.0,
            finish: 1000.0,
            finish_step_scale: 5.0,
            finish_step_par: 1250.0,
        }
    }
}

// =============================================================================
// Game Setup
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Character {
    Mario,
    Luigi,
    Peach,
    Toad,
    Yoshi,
    #[value(name = "dk")]
    DonkeyKong,
    Wario,
    Bowser,
}

impl Character {
    /// (row, column) on the player select screen.
    pub fn grid_position(self) -> (u32, u32) {
        let i = self as u32;
        (i / 4, i % 4)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Course {
    LuigiRaceway,
    MooMooFarm,
    KoopaTroopaBeach,
    KalimariDesert,
    ToadsTurnpike,
    FrappeSnowland,
    ChocoMountain,
    MarioRaceway,
    WarioStadium,
    SherbetLand,
    RoyalRaceway,
    BowsersCastle,
    DksJungleParkway,
    YoshiValley,
    BansheeBoardwalk,
    RainbowRoad,
}

impl Course {
    /// (cup, position in cup) on the map select screen.
    pub fn map_position(self) -> (u32, u32) {
        let i = self as u32;
        (i / 4, i % 4)
    }

    /// Hand-placed minimap checkpoints, where a course has them.
    pub fn checkpoint_groups(self) -> Option<Vec<Vec<Point>>> {
        match self {
            Course::LuigiRaceway => Some(vec![
                // straight-away
                vec![(563, 317), (564, 317), (565, 317), (566, 317), (567, 317)],
                // first bend
                vec![(563, 285), (564, 285), (565, 285), (566, 285), (567, 285)],
                vec![(540, 259), (540, 260), (540, 261), (540, 262), (540, 263)],
                vec![(516, 286), (517, 286), (518, 286), (519, 286), (520, 286)],
                // angled sections around the tunnel
                vec![(553, 321), (554, 321), (554, 320), (555, 320), (555, 319)],
                vec![(547, 370), (548, 371), (549, 372), (550, 373)],
                // second left turn
                vec![(526, 397), (527, 397), (528, 397), (529, 397), (530, 397)],
                vec![(546, 412), (546, 413), (546, 414), (546, 415), (546, 416)],
                vec![(562, 398), (563, 398), (564, 398), (565, 398), (566, 398)],
                // run to the line
                vec![(563, 380), (564, 380), (565, 380), (566, 380), (567, 380)],
            ]),
            _ => None,
        }
    }
}

/// Video plugins draw the lap readout in slightly different colors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum GfxPlugin {
    Rice,
    Glide64mk2,
    Glide64,
}

impl GfxPlugin {
    pub fn from_library(name: &str) -> Option<Self> {
        match name {
            "mupen64plus-video-rice.so" => Some(GfxPlugin::Rice),
            "mupen64plus-video-glide64mk2.so" => Some(GfxPlugin::Glide64mk2),
            "mupen64plus-video-glide64.so" => Some(GfxPlugin::Glide64),
            _ => None,
        }
    }

    /// Color of the lap readout pixel once the race is over.
    pub fn race_over_color(self) -> Rgb {
        match self {
            GfxPlugin::Rice => Rgb::new(66, 49, 66),
            GfxPlugin::Glide64mk2 => Rgb::new(214, 148, 214),
            GfxPlugin::Glide64 => Rgb::new(157, 112, 158),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaceEndDetection {
    /// The screen corners go black for a while after the finish.
    BlackCorners,
    /// The lap readout changes color on the results screen.
    LapReadout(GfxPlugin),
}

/// Pixel of the lap readout that changes color on the results screen.
pub const LAP_READOUT_PIXEL: Point = (203, 51);

impl RaceEndDetection {
    fn detector_config(self) -> EndDetectorConfig {
        match self {
            RaceEndDetection::BlackCorners => EndDetectorConfig::corners(EndPattern::Sentinel(Rgb::BLACK)),
            RaceEndDetection::LapReadout(plugin) => EndDetectorConfig {
                points: vec![LAP_READOUT_PIXEL],
                pattern: EndPattern::PixelIs {
                    point: LAP_READOUT_PIXEL,
                    color: plugin.race_over_color(),
                },
                threshold: 0,
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct MarioKartConfig {
    pub character: Character,
    pub course: Course,
    pub rewards: MarioKartRewards,
    pub end_detection: RaceEndDetection,
    pub enable_checkpoints: bool,
    pub laps: usize,
}

impl Default for MarioKartConfig {
    fn default() -> Self {
        Self {
            character: Character::Mario,
            course: Course::LuigiRaceway,
            rewards: MarioKartRewards::default(),
            end_detection: RaceEndDetection::BlackCorners,
            enable_checkpoints: false,
            laps: 3,
        }
    }
}

/// Border of the progress HUD on a 640x480 capture.
pub const PROGRESS_BORDER: (u32, u32, u32, u32) = (64, 36, 584, 444);

/// Frames after the race starts before the pause menu opens.
const GREEN_LIGHT_FRAMES: u64 = 120;
const GREEN_LIGHT_WAIT: u64 = 100;

// =============================================================================
// Adapter
// =============================================================================

pub struct MarioKartAdapter {
    config: MarioKartConfig,
    border: CheckpointSet,
    laps: LapDetector,
    checkpoints: Option<CheckpointTracker>,
    end: EndEpisodeDetector,
    lap: u8,
    step_count_at_lap: u64,
}

impl MarioKartAdapter {
    pub fn new(config: MarioKartConfig) -> Result<Self> {
        let (min_x, min_y, max_x, max_y) = PROGRESS_BORDER;
        let border = CheckpointSet::perimeter(min_x, min_y, max_x, max_y);
        let palette = HudPalette::default();
        let laps = LapDetector::new(palette.clone(), border.lap_corner().to_vec());

        let checkpoints = if config.enable_checkpoints {
            let set = match config.course.checkpoint_groups() {
                Some(groups) => CheckpointSet::from_groups(groups)?,
                None => border.clone(),
            };
            tracing::info!(course = ?config.course, groups = set.len(), "checkpoint rewards enabled");
            Some(CheckpointTracker::new(set, palette, config.laps))
        } else {
            None
        };

        let end = EndEpisodeDetector::new(config.end_detection.detector_config());
        Ok(Self {
            config,
            border,
            laps,
            checkpoints,
            end,
            lap: 1,
            step_count_at_lap: 0,
        })
    }

    pub fn lap(&self) -> u8 {
        self.lap
    }

    pub fn border(&self) -> &CheckpointSet {
        &self.border
    }

    pub fn checkpoints(&self) -> Option<&CheckpointTracker> {
        self.checkpoints.as_ref()
    }

    fn map_select(&self, script: &mut Vec<MenuStep>) {
        let (series, choice) = self.config.course.map_position();
        // The menu remembers the last choice, so start from the top-left.
        press(script, left(), 3);
        press(script, right(), series);
        press(script, a(), 1);
        press(script, up(), 3);
        press(script, down(), choice);
        press(script, a(), 1);
        press(script, a(), 1);
    }

    fn restart_race(&self, script: &mut Vec<MenuStep>, steps_taken: u64, frames_per_step: u32) {
        // The race can't be paused before the green light.
        let frames = steps_taken * frames_per_step as u64;
        if frames < GREEN_LIGHT_FRAMES {
            let wait = GREEN_LIGHT_WAIT.saturating_sub(frames);
            if wait > 0 {
                script.push(MenuStep::wait(wait as u32));
            }
        }
        press(script, start(), 1);
        press(script, down(), 1);
        press(script, a(), 1);
        script.push(MenuStep::wait(76));
    }
}

fn press(script: &mut Vec<MenuStep>, frame: crate::action::ActionFrame, times: u32) {
    if times > 0 {
        script.push(MenuStep::Press { frame, times });
    }
}

impl GameAdapter for MarioKartAdapter {
    fn name(&self) -> &str {
        "mario-kart"
    }

    fn reset_episode(&mut self) {
        self.laps.reset();
        if let Some(checkpoints) = self.checkpoints.as_mut() {
            checkpoints.reset();
        }
        self.end.reset();
        self.lap = 1;
        self.step_count_at_lap = 0;
    }

    fn extract_end_state(&mut self, grid: &PixelGrid) -> bool {
        self.end.observe(grid) || self.end.is_ended()
    }

    fn extract_reward(&mut self, grid: &PixelGrid, ctx: &StepContext) -> f64 {
        let rewards = &self.config.rewards;
        let cur_lap = self.laps.detect(grid);
        let update = self
            .checkpoints
            .as_mut()
            .map(|tracker| tracker.evaluate(grid, cur_lap));

        if ctx.episode_over {
            let refund = self.end.refund(rewards.step);
            let finish = rewards.finish
                + rewards.finish_step_scale * (rewards.finish_step_par - ctx.step_count as f64);
            tracing::info!(steps = ctx.step_count, finish, refund, "race finished");
            return finish + refund;
        }

        if cur_lap > self.lap {
            tracing::info!(
                lap = cur_lap,
                steps_this_lap = ctx.step_count - self.step_count_at_lap,
                "new lap"
            );
            self.lap = cur_lap;
            self.step_count_at_lap = ctx.step_count;
            return rewards.lap;
        }

        match update {
            Some(u) if u.credited => rewards.checkpoint,
            Some(u) if u.went_backwards => rewards.backwards,
            _ => rewards.step,
        }
    }

    fn menu_script(&self, phase: MenuPhase) -> Vec<MenuStep> {
        let mut script = Vec::new();
        match phase {
            MenuPhase::Boot => {
                let (row, col) = self.config.character.grid_position();
                script.push(MenuStep::wait(10));
                press(&mut script, a(), 1);
                script.push(MenuStep::wait(68));
                press(&mut script, a(), 1);
                script.push(MenuStep::wait(68));

                // one player, time trials
                press(&mut script, a(), 1);
                script.push(MenuStep::wait(3));
                press(&mut script, down(), 1);
                script.push(MenuStep::wait(3));
                press(&mut script, a(), 3);
                script.push(MenuStep::wait(14));

                press(&mut script, up(), 1);
                press(&mut script, left(), 3);
                press(&mut script, down(), row);
                press(&mut script, right(), col);
                press(&mut script, a(), 2);
                script.push(MenuStep::wait(31));

                self.map_select(&mut script);
                script.push(MenuStep::wait(46));

                // HUD view with the progress border
                press(&mut script, c_right(), 2);
                self.restart_race(&mut script, 0, 1);
            }
            MenuPhase::AfterEpisode => {
                script.push(MenuStep::wait(275));
                press(&mut script, a(), 1);
                script.push(MenuStep::wait(13));
                // The post-race menu doesn't wrap, so this lands on "Retry".
                press(&mut script, up(), 5);
                press(&mut script, down(), 1);
                press(&mut script, a(), 1);
                script.push(MenuStep::wait(40));
                self.map_select(&mut script);
                script.push(MenuStep::wait(50));
            }
            MenuPhase::MidEpisode {
                steps_taken,
                frames_per_step,
            } => self.restart_race(&mut script, steps_taken, frames_per_step),
        }
        script
    }
}
