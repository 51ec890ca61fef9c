use anyhow::{Result, ensure};
use clap::ValueEnum;

use super::controls::{a, b, down, right, start, up};
use super::{GameAdapter, MenuPhase, MenuStep, StepContext};
use crate::action::{ActionFrame, Button};
use crate::damage::{DamageTracker, DamageTrackerConfig};
use crate::digits::{DigitRecognizer, GlyphSet, RecognizerConfig};
use crate::frame::{PixelGrid, Region};

/// Damage readout of the agent (player one) on a 640x480 capture.
pub const PLAYER_ONE_DAMAGE: Region = Region::span(50, 173, 400, 438);
/// Damage readout of the opponent (player two).
pub const PLAYER_TWO_DAMAGE: Region = Region::span(190, 313, 400, 438);

const FRAMES_PER_SECOND: f64 = 60.0;

// =============================================================================
// Reward Tuning Knobs
// =============================================================================

#[derive(Debug, Clone)]
pub struct SmashRewards {
    /// Reward per percent of damage dealt (and penalty per percent taken).
    pub damage_factor: f64,
    pub death: f64,
    pub taunt: f64,
    /// Frames without any damage before the idle penalty starts.
    pub idle_frames: u64,
    /// Idle penalty per second of play, the same as taking 1% every second.
    pub idle_penalty_per_second: f64,
}

impl Default for SmashRewards {
    fn default() -> Self {
        Self {
            damage_factor: 1.0,
            death: 200.0,
            taunt: 1.0,
            idle_frames: 4 * 60,
            idle_penalty_per_second: 1.0,
        }
    }
}

// =============================================================================
// Match Setup
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Fighter {
    Luigi,
    Mario,
    #[value(name = "dk")]
    DonkeyKong,
    Link,
    Samus,
    Falcon,
    Ness,
    Yoshi,
    Kirby,
    Fox,
    Pikachu,
    Jigglypuff,
}

impl Fighter {
    /// (row, column) on the character select screen.
    pub fn grid_position(self) -> (u32, u32) {
        let i = self as u32;
        (i / 6, i % 6)
    }
}

/// C button used to pick a costume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Costume {
    CUp,
    CDown,
    CLeft,
    CRight,
}

impl Costume {
    fn frame(self) -> ActionFrame {
        let button = match self {
            Costume::CUp => Button::CUp,
            Costume::CDown => Button::CDown,
            Costume::CLeft => Button::CLeft,
            Costume::CRight => Button::CRight,
        };
        ActionFrame::NOOP.with_button(button)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Stage {
    PeachsCastle,
    CongoJungle,
    HyruleCastle,
    PlanetZebes,
    MushroomKingdom,
    YoshisIsland,
    DreamLand,
    SectorZ,
    SaffronCity,
    Random,
}

impl Stage {
    pub fn grid_position(self) -> (u32, u32) {
        let i = self as u32;
        (i / 5, i % 5)
    }
}

#[derive(Debug, Clone)]
pub struct SmashConfig {
    pub me: Fighter,
    pub opponent: Fighter,
    pub my_costume: Costume,
    pub opponent_costume: Costume,
    pub opponent_level: u32,
    pub stage: Stage,
    pub rewards: SmashRewards,
    pub tracker: DamageTrackerConfig,
    pub recognizer: RecognizerConfig,
    /// End the episode once either side has died this many times.
    pub stock: Option<u32>,
}

impl Default for SmashConfig {
    fn default() -> Self {
        Self {
            me: Fighter::Pikachu,
            opponent: Fighter::Jigglypuff,
            my_costume: Costume::CUp,
            opponent_costume: Costume::CLeft,
            opponent_level: 10,
            stage: Stage::DreamLand,
            rewards: SmashRewards::default(),
            tracker: DamageTrackerConfig::default(),
            recognizer: RecognizerConfig::default(),
            stock: None,
        }
    }
}

// Full-deflection stick for menu cursors.
fn hard_up() -> ActionFrame {
    ActionFrame::new(0, 127)
}

fn hard_down() -> ActionFrame {
    ActionFrame::new(0, -128)
}

fn hard_left() -> ActionFrame {
    ActionFrame::new(-128, 0)
}

fn hard_right() -> ActionFrame {
    ActionFrame::new(127, 0)
}

/// Cursor steps between two character portraits.
const PORTRAIT_STEP: u32 = 7;

// =============================================================================
// Adapter
// =============================================================================

pub struct SmashAdapter {
    config: SmashConfig,
    me: DamageTracker,
    opponent: DamageTracker,
    frame: u64,
    last_damage_frame: u64,
    my_deaths: u32,
    opponent_deaths: u32,
}

impl SmashAdapter {
    pub fn new(config: SmashConfig, glyphs: GlyphSet) -> Result<Self> {
        ensure!(
            config.me != config.opponent || config.my_costume != config.opponent_costume,
            "agent and opponent cannot share character and costume"
        );
        let reader = |region| {
            DamageTracker::new(config.tracker.clone()).with_reader(
                DigitRecognizer::new(glyphs.clone(), config.recognizer.clone()),
                region,
            )
        };
        let me = reader(PLAYER_ONE_DAMAGE);
        let opponent = reader(PLAYER_TWO_DAMAGE);
        Ok(Self {
            config,
            me,
            opponent,
            frame: 0,
            last_damage_frame: 0,
            my_deaths: 0,
            opponent_deaths: 0,
        })
    }

    pub fn my_damage(&self) -> u16 {
        self.me.current_damage()
    }

    pub fn opponent_damage(&self) -> u16 {
        self.opponent.current_damage()
    }

    pub fn deaths(&self) -> (u32, u32) {
        (self.my_deaths, self.opponent_deaths)
    }

    fn observe(&mut self, grid: &PixelGrid, frames_per_step: u32) {
        for (who, tracker) in [("me", &mut self.me), ("opponent", &mut self.opponent)] {
            tracker.set_frames_per_step(frames_per_step);
            match tracker.observe_grid(grid) {
                Ok(reading) => tracing::trace!(who, ?reading, "damage reading"),
                Err(err) => tracing::warn!(who, "damage readout unavailable: {err:#}"),
            }
        }
    }

    fn start_menus(script: &mut Vec<MenuStep>) {
        script.push(MenuStep::wait(150));
        script.push(MenuStep::press(start()));
        script.push(MenuStep::wait(150));
        script.push(MenuStep::press(start()));
        script.push(MenuStep::wait(30));
        // versus mode
        script.push(MenuStep::press(down()));
        script.push(MenuStep::press(start()));
        script.push(MenuStep::wait(30));
        // infinite time
        press(script, down(), 2);
        press(script, hard_left(), 3);
        // items off
        script.push(MenuStep::press(down()));
        script.push(MenuStep::press(start()));
        script.push(MenuStep::wait(30));
        script.push(MenuStep::press(up()));
        script.push(MenuStep::press(start()));
        script.push(MenuStep::wait(30));
        press(script, hard_left(), 3);
        script.push(MenuStep::press(b()));
        script.push(MenuStep::wait(30));
        script.push(MenuStep::press(b()));
        script.push(MenuStep::wait(30));
        script.push(MenuStep::press(down()));
        script.push(MenuStep::press(start()));
        script.push(MenuStep::wait(125));
    }

    fn move_cursor(script: &mut Vec<MenuStep>, from: (u32, u32), to: (u32, u32)) {
        if to.0 > from.0 {
            press(script, hard_down(), PORTRAIT_STEP * (to.0 - from.0));
        } else {
            press(script, hard_up(), PORTRAIT_STEP * (from.0 - to.0));
        }
        if to.1 > from.1 {
            press(script, hard_right(), PORTRAIT_STEP * (to.1 - from.1));
        } else {
            press(script, hard_left(), PORTRAIT_STEP * (from.1 - to.1));
        }
    }

    fn player_select(&self, script: &mut Vec<MenuStep>) {
        let me = self.config.me.grid_position();
        let opponent = self.config.opponent.grid_position();

        // computer opponent on, then its level (default 3)
        press(script, hard_up(), 5);
        press(script, hard_right(), 13);
        script.push(MenuStep::press(a()));
        press(script, hard_down(), 10);
        press(script, hard_right(), 2);
        let level = self.config.opponent_level;
        if level > 3 {
            press(script, a(), level - 3);
        } else if level < 3 {
            press(script, hard_left(), 8);
            press(script, a(), 3 - level);
        }

        // Park player one somewhere that is neither the computer's default
        // portrait nor the requested one.
        let parked = if opponent == (0, 1) { (1, 0) } else { (0, 1) };
        press(script, hard_up(), 35);
        press(script, hard_left(), 45);
        press(script, hard_down(), 5 + PORTRAIT_STEP * parked.0);
        press(script, hard_right(), 5 + PORTRAIT_STEP * parked.1);
        script.push(MenuStep::press(self.config.my_costume.frame()));
        script.push(MenuStep::wait(20));

        // Grab the computer's token from the default portrait and drop it.
        let default_cp = (0, 0);
        Self::move_cursor(script, parked, default_cp);
        script.push(MenuStep::press(a()));
        script.push(MenuStep::wait(20));
        Self::move_cursor(script, default_cp, opponent);
        script.push(MenuStep::press(self.config.opponent_costume.frame()));
        script.push(MenuStep::wait(20));

        script.push(MenuStep::press(b()));
        script.push(MenuStep::wait(30));
        Self::move_cursor(script, opponent, me);
        script.push(MenuStep::press(self.config.my_costume.frame()));
        script.push(MenuStep::press(start()));
        script.push(MenuStep::wait(75));
    }

    fn stage_select(&self, script: &mut Vec<MenuStep>) {
        let (row, col) = self.config.stage.grid_position();
        for _ in 0..col {
            script.push(MenuStep::press(right()));
            script.push(MenuStep::wait(15));
        }
        for _ in 0..row {
            script.push(MenuStep::press(down()));
            script.push(MenuStep::wait(15));
        }
        script.push(MenuStep::press(start()));
        script.push(MenuStep::wait(200));
    }
}

fn press(script: &mut Vec<MenuStep>, frame: ActionFrame, times: u32) {
    if times > 0 {
        script.push(MenuStep::Press { frame, times });
    }
}

impl GameAdapter for SmashAdapter {
    fn name(&self) -> &str {
        "smash"
    }

    fn reset_episode(&mut self) {
        self.me.reset();
        self.opponent.reset();
        self.frame = 0;
        self.last_damage_frame = 0;
        self.my_deaths = 0;
        self.opponent_deaths = 0;
    }

    fn extract_end_state(&mut self, _grid: &PixelGrid) -> bool {
        self.config
            .stock
            .is_some_and(|stock| self.my_deaths >= stock || self.opponent_deaths >= stock)
    }

    fn extract_reward(&mut self, grid: &PixelGrid, ctx: &StepContext) -> f64 {
        self.frame += ctx.frames_per_step as u64;
        self.observe(grid, ctx.frames_per_step);
        let rewards = &self.config.rewards;

        let mut reward = 0.0;
        if ctx.action.is_pressed(Button::L) {
            self.last_damage_frame = self.frame;
            reward += rewards.taunt;
        }

        let (i_died, taken) = self.me.consume_delta();
        let (they_died, given) = self.opponent.consume_delta();
        reward += rewards.damage_factor * (given.max(0) - taken.max(0)) as f64;
        if i_died {
            self.my_deaths += 1;
            reward -= rewards.death;
            tracing::info!(deaths = self.my_deaths, "agent died");
        }
        if they_died {
            self.opponent_deaths += 1;
            reward += rewards.death;
            tracing::info!(deaths = self.opponent_deaths, "opponent died");
        }
        if taken != 0 || given != 0 || i_died || they_died {
            self.last_damage_frame = self.frame;
        }

        if self.frame - self.last_damage_frame > rewards.idle_frames {
            reward -= rewards.idle_penalty_per_second * ctx.frames_per_step as f64 / FRAMES_PER_SECOND;
        }
        reward
    }

    fn menu_script(&self, phase: MenuPhase) -> Vec<MenuStep> {
        let mut script = Vec::new();
        // Matches run with infinite time, so only boot needs menus.
        if phase == MenuPhase::Boot {
            Self::start_menus(&mut script);
            self.player_select(&mut script);
            self.stage_select(&mut script);
        }
        script
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digits::testing;
    use crate::frame::Rgb;

    fn adapter(config: SmashConfig) -> SmashAdapter {
        SmashAdapter::new(config, testing::glyphs()).unwrap()
    }

    fn screen(me: Option<&str>, opponent: Option<&str>) -> PixelGrid {
        let mut grid = PixelGrid::filled(640, 480, Rgb::WHITE);
        if let Some(text) = me {
            grid.paste(&testing::readout(text, Rgb::BLACK), PLAYER_ONE_DAMAGE.x + 40, PLAYER_ONE_DAMAGE.y);
        }
        if let Some(text) = opponent {
            grid.paste(&testing::readout(text, Rgb::BLACK), PLAYER_TWO_DAMAGE.x + 40, PLAYER_TWO_DAMAGE.y);
        }
        grid
    }

    fn ctx(action: ActionFrame) -> StepContext {
        StepContext {
            step_count: 0,
            episode_over: false,
            action,
            frames_per_step: 4,
        }
    }

    fn step(adapter: &mut SmashAdapter, grid: &PixelGrid) -> f64 {
        adapter.extract_reward(grid, &ctx(ActionFrame::NOOP))
    }

    #[test]
    fn damage_dealt_and_taken() {
        let mut smash = adapter(SmashConfig::default());
        let hit = screen(Some("0%"), Some("10%"));
        assert_eq!(step(&mut smash, &hit), 0.0);
        assert_eq!(step(&mut smash, &hit), 0.0);
        assert_eq!(step(&mut smash, &hit), 10.0);
        assert_eq!(smash.opponent_damage(), 10);

        let hurt = screen(Some("7%"), Some("10%"));
        let rewards: Vec<f64> = (0..3).map(|_| step(&mut smash, &hurt)).collect();
        assert_eq!(rewards, [0.0, 0.0, -7.0]);
    }

    #[test]
    fn taunt_pays_and_counts_as_activity() {
        let mut smash = adapter(SmashConfig::default());
        let taunt = ActionFrame::encode(&crate::action::SmashAction::TAUNT.controls()).unwrap();
        let calm = screen(Some("0%"), Some("0%"));
        assert_eq!(smash.extract_reward(&calm, &ctx(taunt)), 1.0);
    }

    #[test]
    fn idle_penalty_after_four_seconds() {
        let mut smash = adapter(SmashConfig::default());
        let calm = screen(Some("0%"), Some("0%"));
        // 60 steps of 4 frames reach exactly 240 frames.
        for _ in 0..60 {
            assert_eq!(step(&mut smash, &calm), 0.0);
        }
        let penalty = step(&mut smash, &calm);
        assert!((penalty + 4.0 / 60.0).abs() < 1e-12);
    }

    #[test]
    fn death_after_readout_disappears() {
        let mut smash = adapter(SmashConfig {
            stock: Some(1),
            ..SmashConfig::default()
        });
        let hurt = screen(Some("25%"), Some("0%"));
        let taken: f64 = (0..3).map(|_| step(&mut smash, &hurt)).sum();
        assert_eq!(taken, -25.0);

        let gone = screen(None, Some("0%"));
        for _ in 0..3 {
            step(&mut smash, &gone);
        }
        let respawn = screen(Some("0%"), Some("0%"));
        assert_eq!(step(&mut smash, &respawn), 0.0);
        assert_eq!(step(&mut smash, &respawn), 0.0);
        assert!(!smash.extract_end_state(&respawn));
        assert_eq!(step(&mut smash, &respawn), -200.0);
        assert_eq!(smash.deaths(), (1, 0));
        assert!(smash.extract_end_state(&respawn));

        smash.reset_episode();
        assert_eq!(smash.deaths(), (0, 0));
        assert!(!smash.extract_end_state(&respawn));
    }

    #[test]
    fn mirror_match_needs_different_costumes() {
        let config = SmashConfig {
            me: Fighter::Fox,
            opponent: Fighter::Fox,
            my_costume: Costume::CUp,
            opponent_costume: Costume::CUp,
            ..SmashConfig::default()
        };
        assert!(SmashAdapter::new(config, testing::glyphs()).is_err());
    }

    #[test]
    fn only_boot_has_a_menu_script() {
        let smash = adapter(SmashConfig::default());
        let boot = smash.menu_script(MenuPhase::Boot);
        assert_eq!(boot.first(), Some(&MenuStep::wait(150)));
        assert_eq!(boot.last(), Some(&MenuStep::wait(200)));
        assert!(smash.menu_script(MenuPhase::AfterEpisode).is_empty());
        assert_eq!(Fighter::Jigglypuff.grid_position(), (1, 5));
        assert_eq!(Stage::DreamLand.grid_position(), (1, 1));
    }
}
