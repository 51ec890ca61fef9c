// =============================================================================
// N64 RL bridge: controller endpoint and pixel readers for mupen64plus
// =============================================================================
// Run:
//   cargo run --release -- serve --game kart --frames captures/ --episodes 2
//   cargo run --release -- serve --game smash --frames captures/ --glyphs glyphs/
//   cargo run --release -- read-damage --image shot.png --glyphs glyphs/ --player 2
//   cargo run --release -- inspect --image shot.png --course luigi-raceway

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use n64_rl_bridge::adapter::mario_kart::{
    Character, Course, GfxPlugin, LAP_READOUT_PIXEL, MarioKartConfig, PROGRESS_BORDER,
};
use n64_rl_bridge::adapter::smash::{Fighter, PLAYER_ONE_DAMAGE, PLAYER_TWO_DAMAGE, SmashConfig, Stage};
use n64_rl_bridge::{
    CheckpointSet, CheckpointTracker, ControlChannel, ControllerServer, DigitRecognizer,
    EndDetectorConfig, EndEpisodeDetector, EndPattern, EnvConfig, GameAdapter, GlyphSet,
    HudPalette, KartAction, LapDetector, MarioKartAdapter, Mupen64Env, PixelGrid,
    RecognizerConfig, Region, ReplaySource, Rgb, SmashAction, SmashAdapter,
};

// =============================================================================
// CLI
// =============================================================================

#[derive(Parser)]
#[command(name = "n64-rl-bridge", about = "Drive mupen64plus from an RL loop and read rewards off the screen")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve controls to the input plugin, driven by a random agent
    Serve(ServeArgs),
    /// Read a damage readout from a screenshot
    ReadDamage(ReadDamageArgs),
    /// Show lap, checkpoint and race-end readings of a screenshot
    Inspect(InspectArgs),
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Game {
    Kart,
    Smash,
}

#[derive(Parser)]
struct ServeArgs {
    #[arg(long, value_enum, default_value_t = Game::Kart)]
    game: Game,
    /// Directory of PNG captures replayed as the emulator screen
    #[arg(long)]
    frames: PathBuf,
    /// Glyph templates (percent.png, 0.png .. 9.png), needed for smash
    #[arg(long)]
    glyphs: Option<PathBuf>,
    /// Overrides PORT_NUMBER
    #[arg(long)]
    port: Option<u16>,
    #[arg(long, default_value = "1")]
    episodes: usize,
    #[arg(long, default_value = "200")]
    max_steps: u64,
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long, value_enum, default_value_t = Character::Mario)]
    character: Character,
    #[arg(long, value_enum, default_value_t = Course::LuigiRaceway)]
    course: Course,
    #[arg(long, default_value_t = false)]
    checkpoints: bool,
    #[arg(long, value_enum, default_value_t = Fighter::Pikachu)]
    fighter: Fighter,
    #[arg(long, value_enum, default_value_t = Fighter::Jigglypuff)]
    opponent: Fighter,
    #[arg(long, value_enum, default_value_t = Stage::DreamLand)]
    stage: Stage,
}

#[derive(Parser)]
struct ReadDamageArgs {
    #[arg(long)]
    image: PathBuf,
    #[arg(long)]
    glyphs: PathBuf,
    /// Which player's readout to read
    #[arg(long, default_value = "1", value_parser = clap::value_parser!(u8).range(1..=2))]
    player: u8,
    /// Explicit readout rectangle as x,y,width,height
    #[arg(long, value_parser = parse_region)]
    region: Option<Region>,
}

#[derive(Parser)]
struct InspectArgs {
    #[arg(long)]
    image: PathBuf,
    /// Also read the course's minimap checkpoints
    #[arg(long, value_enum)]
    course: Option<Course>,
    /// Check the lap readout color of this video plugin
    #[arg(long, value_enum)]
    plugin: Option<GfxPlugin>,
}

fn parse_region(raw: &str) -> Result<Region, String> {
    let parts: Vec<u32> = raw
        .split(',')
        .map(|p| p.trim().parse::<u32>().map_err(|e| format!("{p:?}: {e}")))
        .collect::<Result<_, _>>()?;
    match parts[..] {
        [x, y, width, height] if width > 0 && height > 0 => Ok(Region::new(x, y, width, height)),
        _ => Err("expected x,y,width,height with a non-empty size".to_string()),
    }
}

// =============================================================================
// Serve
// =============================================================================

fn build_adapter(args: &ServeArgs) -> Result<Box<dyn GameAdapter>> {
    match args.game {
        Game::Kart => {
            let config = MarioKartConfig {
                character: args.character,
                course: args.course,
                enable_checkpoints: args.checkpoints,
                ..MarioKartConfig::default()
            };
            Ok(Box::new(MarioKartAdapter::new(config)?))
        }
        Game::Smash => {
            let Some(dir) = args.glyphs.as_deref() else {
                bail!("--glyphs is required for smash");
            };
            let glyphs = GlyphSet::load_dir(dir)?;
            let config = SmashConfig {
                me: args.fighter,
                opponent: args.opponent,
                stage: args.stage,
                ..SmashConfig::default()
            };
            Ok(Box::new(SmashAdapter::new(config, glyphs)?))
        }
    }
}

fn random_action(game: Game, rng: &mut SmallRng) -> Vec<i32> {
    match game {
        Game::Kart => KartAction::ALL[rng.random_range(0..KartAction::COUNT)]
            .controls()
            .to_vec(),
        Game::Smash => {
            let index = rng.random_range(0..SmashAction::COUNT);
            SmashAction::from_index(index)
                .map(|a| a.controls().to_vec())
                .unwrap_or_default()
        }
    }
}

fn serve(args: &ServeArgs) -> Result<()> {
    let mut config = EnvConfig::from_env();
    if let Some(port) = args.port {
        config.port = port;
    }
    eprintln!("═══════════════════════════════════════════════════════════");
    eprintln!("  SERVE: controller endpoint on {}", config.bind_addr());
    eprintln!("═══════════════════════════════════════════════════════════");

    let channel = ControlChannel::new(config.frame_skip, config.action_timeout);
    let mut server = ControllerServer::start(channel.clone(), config.bind_addr())?;
    let source = ReplaySource::from_dir(&args.frames)?;
    let adapter = build_adapter(args)?;
    let mut env = Mupen64Env::new(channel, source, adapter, config);

    let mut rng = match args.seed {
        Some(seed) => SmallRng::seed_from_u64(seed),
        None => SmallRng::from_os_rng(),
    };

    for episode in 1..=args.episodes {
        env.reset().context("reset failed")?;
        let mut steps = 0;
        let mut lost = false;
        while steps < args.max_steps {
            let action = random_action(args.game, &mut rng);
            let result = env.step(&action)?;
            steps += 1;
            if result.done {
                lost = result.emulator_lost;
                break;
            }
        }
        eprintln!(
            "Episode {episode:>4} | steps {steps:>6} | reward {:>9.2}{}",
            env.total_reward,
            if lost { " | emulator lost" } else { "" }
        );
        if lost {
            break;
        }
    }

    let stats = env.channel().stats();
    tracing::info!(
        pushes = stats.pushes,
        deliveries = stats.deliveries,
        timeouts = stats.timeouts,
        "channel totals"
    );
    env.close();
    server.stop();
    Ok(())
}

// =============================================================================
// Offline Readers
// =============================================================================

fn read_damage(args: &ReadDamageArgs) -> Result<()> {
    let screen = PixelGrid::load_png(&args.image)?;
    let glyphs = GlyphSet::load_dir(&args.glyphs)?;
    let region = args.region.unwrap_or(if args.player == 1 {
        PLAYER_ONE_DAMAGE
    } else {
        PLAYER_TWO_DAMAGE
    });
    let mut recognizer = DigitRecognizer::new(glyphs, RecognizerConfig::default());
    match recognizer.recognize_in(&screen, region)? {
        Ok(damage) => println!("{damage}%"),
        Err(err) => println!("unreadable: {err}"),
    }
    Ok(())
}

fn describe(color: Option<Rgb>) -> String {
    color.map_or_else(|| "off-screen".to_string(), |c| format!("({}, {}, {})", c.r, c.g, c.b))
}

fn inspect(args: &InspectArgs) -> Result<()> {
    let screen = PixelGrid::load_png(&args.image)?;
    println!("{}: {}x{}", args.image.display(), screen.width(), screen.height());

    let palette = HudPalette::default();
    let (min_x, min_y, max_x, max_y) = PROGRESS_BORDER;
    let border = CheckpointSet::perimeter(min_x, min_y, max_x, max_y);
    let mut laps = LapDetector::new(palette.clone(), border.lap_corner().to_vec());
    println!("lap:                {}", laps.detect(&screen));

    let border_len = border.len();
    let progress = CheckpointTracker::new(border, palette.clone(), 3);
    match progress.current_checkpoint(&screen) {
        Some(k) => println!("border progress:    {k} / {border_len}"),
        None => println!("border progress:    unknown"),
    }

    if let Some(course) = args.course {
        match course.checkpoint_groups() {
            Some(groups) => {
                let set = CheckpointSet::from_groups(groups)?;
                let len = set.len();
                let minimap = CheckpointTracker::new(set, palette, 3);
                match minimap.current_checkpoint(&screen) {
                    Some(k) => println!("minimap checkpoint: {k} / {len}"),
                    None => println!("minimap checkpoint: unknown"),
                }
            }
            None => println!("minimap checkpoint: no checkpoints for {course:?}"),
        }
    }

    let corners = EndDetectorConfig {
        threshold: 0,
        ..EndDetectorConfig::corners(EndPattern::Sentinel(Rgb::BLACK))
    };
    let black = EndEpisodeDetector::new(corners.clone()).observe(&screen);
    let colors: Vec<String> = corners
        .points
        .iter()
        .map(|&(x, y)| describe(screen.pixel(x, y)))
        .collect();
    println!("black corners:      {black} [{}]", colors.join(", "));

    if let Some(plugin) = args.plugin {
        let (x, y) = LAP_READOUT_PIXEL;
        let seen = screen.pixel(x, y);
        println!(
            "lap readout:        {} (saw {}, race over is {})",
            seen == Some(plugin.race_over_color()),
            describe(seen),
            describe(Some(plugin.race_over_color()))
        );
    }
    Ok(())
}

// =============================================================================
// Main
// =============================================================================

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Serve(args) => serve(args),
        Commands::ReadDamage(args) => read_damage(args),
        Commands::Inspect(args) => inspect(args),
    }
}
