use anyhow::{Context, Result};

use crate::action::ActionFrame;
use crate::adapter::{GameAdapter, MenuPhase, MenuStep, StepContext};
use crate::channel::{ControlChannel, Delivery};
use crate::config::EnvConfig;
use crate::frame::{FrameObserver, FrameSource, PixelGrid, Rgb};

// =============================================================================
// Emulator Process
// =============================================================================

/// Liveness of the emulator the environment is driving.
pub trait EmulatorProcess {
    fn is_alive(&mut self) -> bool;
}

impl EmulatorProcess for std::process::Child {
    fn is_alive(&mut self) -> bool {
        match self.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                tracing::debug!(%status, "emulator exited");
                false
            }
            Err(err) => {
                tracing::debug!("cannot query emulator process: {err}");
                false
            }
        }
    }
}

// =============================================================================
// Environment
// =============================================================================

pub struct StepResult {
    pub observation: PixelGrid,
    pub reward: f64,
    pub done: bool,
    /// The emulator died; the episode cannot continue.
    pub emulator_lost: bool,
}

/// Generic episode driver: pushes controls through the channel, watches the
/// screen, and lets the adapter score what it sees.
pub struct Mupen64Env<G, F> {
    channel: ControlChannel,
    observer: FrameObserver<F>,
    adapter: G,
    process: Option<Box<dyn EmulatorProcess + Send>>,
    config: EnvConfig,
    step_count: u64,
    episode_over: bool,
    booted: bool,
    pub total_reward: f64,
}

impl<G: GameAdapter, F: FrameSource> Mupen64Env<G, F> {
    pub fn new(channel: ControlChannel, source: F, adapter: G, config: EnvConfig) -> Self {
        channel.set_frame_skip(config.frame_skip);
        let observer = FrameObserver::new(source, config.screen_region());
        Self {
            channel,
            observer,
            adapter,
            process: None,
            config,
            step_count: 0,
            episode_over: false,
            booted: false,
            total_reward: 0.0,
        }
    }

    /// Watches `process` and ends the episode when it dies.
    pub fn with_process(mut self, process: impl EmulatorProcess + Send + 'static) -> Self {
        self.process = Some(Box::new(process));
        self
    }

    pub fn adapter(&self) -> &G {
        &self.adapter
    }

    pub fn adapter_mut(&mut self) -> &mut G {
        &mut self.adapter
    }

    pub fn channel(&self) -> &ControlChannel {
        &self.channel
    }

    pub fn config(&self) -> &EnvConfig {
        &self.config
    }

    pub fn step_count(&self) -> u64 {
        self.step_count
    }

    pub fn episode_over(&self) -> bool {
        self.episode_over
    }

    fn emulator_alive(&mut self) -> bool {
        self.process.as_mut().is_none_or(|p| p.is_alive())
    }

    fn send(&self, frame: ActionFrame) -> Result<()> {
        match self.channel.push(frame).context("sending controls")? {
            Delivery::Complete => {}
            Delivery::TimedOut => tracing::debug!(step = self.step_count, "step ran with degraded sync"),
        }
        Ok(())
    }

    pub fn step(&mut self, action: &[i32]) -> Result<StepResult> {
        if !self.emulator_alive() {
            tracing::error!(
                step = self.step_count,
                adapter = self.adapter.name(),
                "emulator is gone, ending episode"
            );
            self.episode_over = true;
            let observation = self.observer.latest().cloned().unwrap_or_else(|| {
                PixelGrid::filled(self.config.screen_width, self.config.screen_height, Rgb::BLACK)
            });
            return Ok(StepResult {
                observation,
                reward: 0.0,
                done: true,
                emulator_lost: true,
            });
        }

        let controls = self.adapter.expand_action(action);
        let frame = ActionFrame::encode(&controls).context("encoding agent action")?;
        self.send(frame)?;

        let grid = self.observer.observe()?;
        self.episode_over = self.adapter.extract_end_state(grid);
        let ctx = StepContext {
            step_count: self.step_count,
            episode_over: self.episode_over,
            action: frame,
            frames_per_step: self.channel.frame_skip(),
        };
        let reward = self.adapter.extract_reward(grid, &ctx);
        let observation = grid.clone();

        self.step_count += 1;
        self.total_reward += reward;
        tracing::debug!(
            step = self.step_count,
            reward,
            total = self.total_reward,
            done = self.episode_over,
            "step"
        );

        Ok(StepResult {
            observation,
            reward,
            done: self.episode_over,
            emulator_lost: false,
        })
    }

    /// Navigates from the title screen into the first episode.
    pub fn boot(&mut self) -> Result<PixelGrid> {
        self.adapter.reset_episode();
        self.run_script(MenuPhase::Boot)?;
        self.booted = true;
        self.begin_episode()
    }

    /// Starts a new episode, booting first if needed.
    pub fn reset(&mut self) -> Result<PixelGrid> {
        if !self.booted {
            return self.boot();
        }
        let phase = if self.episode_over {
            MenuPhase::AfterEpisode
        } else {
            MenuPhase::MidEpisode {
                steps_taken: self.step_count,
                frames_per_step: self.channel.frame_skip(),
            }
        };
        self.adapter.reset_episode();
        self.run_script(phase)?;
        self.begin_episode()
    }

    fn begin_episode(&mut self) -> Result<PixelGrid> {
        tracing::info!(
            adapter = self.adapter.name(),
            previous_steps = self.step_count,
            previous_reward = self.total_reward,
            "episode start"
        );
        self.step_count = 0;
        self.episode_over = false;
        self.total_reward = 0.0;
        Ok(self.observer.observe()?.clone())
    }

    fn run_script(&mut self, phase: MenuPhase) -> Result<()> {
        let script = self.adapter.menu_script(phase);
        let frames: u64 = script.iter().map(MenuStep::frame_count).sum();
        tracing::info!(?phase, steps = script.len(), frames, "running menu script");

        let _skip = self.channel.frame_skip_disabled();
        for step in script {
            match step {
                MenuStep::Press { frame, times } => {
                    for _ in 0..times {
                        self.send(frame)?;
                        self.send(ActionFrame::NOOP)?;
                    }
                }
                MenuStep::Wait { frames } => {
                    for _ in 0..frames {
                        self.send(ActionFrame::NOOP)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Stops the channel; blocked pollers are released.
    pub fn close(&mut self) {
        tracing::info!(adapter = self.adapter.name(), "closing environment");
        self.channel.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::controls;
    use crate::frame::Region;
    use std::thread::{self, JoinHandle};
    use std::time::Duration;

    struct Still;

    impl FrameSource for Still {
        fn grab(&mut self, region: Region) -> Result<PixelGrid> {
            Ok(PixelGrid::filled(region.width, region.height, Rgb::WHITE))
        }
    }

    struct Dead;

    impl EmulatorProcess for Dead {
        fn is_alive(&mut self) -> bool {
            false
        }
    }

    #[derive(Default)]
    struct Counting {
        seen: Vec<(u64, u32)>,
        resets: u32,
        end_after: Option<u64>,
    }

    impl GameAdapter for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        fn reset_episode(&mut self) {
            self.resets += 1;
        }

        fn extract_end_state(&mut self, _grid: &PixelGrid) -> bool {
            self.end_after.is_some_and(|n| self.seen.len() as u64 + 1 >= n)
        }

        fn extract_reward(&mut self, _grid: &PixelGrid, ctx: &StepContext) -> f64 {
            self.seen.push((ctx.step_count, ctx.frames_per_step));
            if ctx.action.is_pressed(crate::action::Button::A) { 1.0 } else { -0.1 }
        }

        fn menu_script(&self, phase: MenuPhase) -> Vec<MenuStep> {
            match phase {
                MenuPhase::Boot => vec![
                    MenuStep::Press { frame: controls::a(), times: 2 },
                    MenuStep::wait(3),
                ],
                MenuPhase::MidEpisode { .. } => vec![MenuStep::press(controls::start())],
                MenuPhase::AfterEpisode => vec![MenuStep::press(controls::b())],
            }
        }
    }

    fn config() -> EnvConfig {
        EnvConfig {
            screen_width: 8,
            screen_height: 8,
            frame_skip: 2,
            action_timeout: Duration::from_secs(5),
            ..EnvConfig::default()
        }
    }

    fn env(adapter: Counting) -> Mupen64Env<Counting, Still> {
        let config = config();
        Mupen64Env::new(ControlChannel::new(1, config.action_timeout), Still, adapter, config)
    }

    fn poller(channel: ControlChannel) -> JoinHandle<Vec<ActionFrame>> {
        thread::spawn(move || {
            let mut frames = Vec::new();
            while let Ok(frame) = channel.poll() {
                frames.push(frame);
            }
            frames
        })
    }

    #[test]
    fn step_scores_and_counts() {
        let mut env = env(Counting::default());
        assert_eq!(env.channel().frame_skip(), 2);
        let driver = poller(env.channel().clone());

        let first = env.step(&[0, 0, 1]).unwrap();
        assert_eq!(first.reward, 1.0);
        assert!(!first.done && !first.emulator_lost);
        assert_eq!(first.observation.width(), 8);
        let second = env.step(&[]).unwrap();
        assert_eq!(second.reward, -0.1);
        assert_eq!(env.step_count(), 2);
        assert!((env.total_reward - 0.9).abs() < 1e-12);
        assert_eq!(env.adapter().seen, [(0, 2), (1, 2)]);

        env.close();
        let frames = driver.join().unwrap();
        assert_eq!(frames.len(), 4);
        assert!(frames[0].is_pressed(crate::action::Button::A));
        assert_eq!(frames[2], ActionFrame::NOOP);
    }

    #[test]
    fn invalid_action_is_an_error() {
        let mut env = env(Counting::default());
        assert!(env.step(&[0, 0, 2]).is_err());
        assert_eq!(env.channel().stats().pushes, 0);
    }

    #[test]
    fn dead_emulator_ends_episode_without_pushing() {
        let mut env = env(Counting::default()).with_process(Dead);
        let result = env.step(&[0, 0, 1]).unwrap();
        assert!(result.done);
        assert!(result.emulator_lost);
        assert_eq!(result.reward, 0.0);
        assert_eq!(env.channel().stats().pushes, 0);
    }

    #[test]
    fn boot_script_runs_without_frame_skip() {
        let mut env = env(Counting::default());
        let driver = poller(env.channel().clone());

        let observation = env.reset().unwrap();
        assert_eq!(observation.height(), 8);
        assert!(env.channel().frame_skip_enabled());
        assert_eq!(env.adapter().resets, 1);

        env.close();
        let frames = driver.join().unwrap();
        let a = controls::a();
        let noop = ActionFrame::NOOP;
        assert_eq!(frames, [a, noop, a, noop, noop, noop, noop]);
    }

    #[test]
    fn reset_picks_phase_from_episode_state() {
        let mut env = env(Counting {
            end_after: Some(2),
            ..Counting::default()
        });
        let driver = poller(env.channel().clone());
        env.reset().unwrap();

        env.step(&[]).unwrap();
        env.reset().unwrap();
        assert_eq!(env.step_count(), 0);

        assert!(env.step(&[]).unwrap().done);
        assert!(env.episode_over());
        env.reset().unwrap();

        env.close();
        let frames = driver.join().unwrap();
        assert_eq!(env.adapter().resets, 3);
        let noop = ActionFrame::NOOP;
        // boot, step, mid-episode reset, step, after-episode reset
        assert_eq!(frames.len(), 7 + 2 + 2 + 2 + 2);
        assert_eq!(&frames[9..11], [controls::start(), noop]);
        assert_eq!(&frames[13..], [controls::b(), noop]);
    }
}
