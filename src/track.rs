use anyhow::{Result, ensure};

use crate::frame::{PixelGrid, Rgb};

pub type Point = (u32, u32);

// =============================================================================
// HUD Palette
// =============================================================================

/// Maps the colors of the race progress border to lap numbers.
#[derive(Debug, Clone)]
pub struct HudPalette {
    entries: Vec<(Rgb, u8)>,
    tolerance: u8,
}

impl Default for HudPalette {
    fn default() -> Self {
        Self {
            entries: vec![
                (Rgb::new(0, 0, 255), 1),
                (Rgb::new(255, 255, 0), 2),
                (Rgb::new(255, 0, 0), 3),
            ],
            tolerance: 0,
        }
    }
}

impl HudPalette {
    pub fn new(entries: Vec<(Rgb, u8)>, tolerance: u8) -> Self {
        Self { entries, tolerance }
    }

    pub fn value_of(&self, color: Rgb) -> Option<u8> {
        self.entries
            .iter()
            .find(|(c, _)| c.close_to(color, self.tolerance))
            .map(|&(_, v)| v)
    }

    /// Progress value of a sample group, if every point shows the same palette color.
    pub fn group_value(&self, grid: &PixelGrid, points: &[Point]) -> Option<u8> {
        let (&(x0, y0), rest) = points.split_first()?;
        let first = grid.pixel(x0, y0)?;
        let value = self.value_of(first)?;
        rest.iter()
            .all(|&(x, y)| grid.pixel(x, y) == Some(first))
            .then_some(value)
    }
}

// =============================================================================
// Checkpoint Geometry
// =============================================================================

/// Ordered sample-point groups around the screen border. Group 0 is the lap corner.
#[derive(Debug, Clone)]
pub struct CheckpointSet {
    groups: Vec<Vec<Point>>,
}

impl CheckpointSet {
    pub fn from_groups(groups: Vec<Vec<Point>>) -> Result<Self> {
        ensure!(!groups.is_empty(), "checkpoint set is empty");
        for (i, group) in groups.iter().enumerate() {
            ensure!(
                (2..=5).contains(&group.len()),
                "checkpoint group {i} has {} points, expected 2 to 5",
                group.len()
            );
        }
        Ok(Self { groups })
    }

    /// 2x2 groups every 2 px clockwise around the rectangle, starting at the
    /// top-left corner. The bottom-right corner is skipped; the HUD never draws it.
    pub fn perimeter(min_x: u32, min_y: u32, max_x: u32, max_y: u32) -> Self {
        let square = |x: u32, y: u32| vec![(x, y), (x + 1, y), (x, y + 1), (x + 1, y + 1)];
        let across = (max_x - min_x) / 2;
        let down = (max_y - min_y) / 2;

        let mut groups = Vec::with_capacity((2 * across + 2 * down) as usize);
        groups.extend((0..across).map(|i| square(min_x + i * 2, min_y)));
        groups.extend((0..down).map(|i| square(max_x, min_y + i * 2)));
        groups.extend((1..across).map(|i| square(max_x - i * 2, max_y)));
        groups.extend((0..down).map(|i| square(min_x, max_y - i * 2)));
        Self { groups }
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn groups(&self) -> &[Vec<Point>] {
        &self.groups
    }

    pub fn lap_corner(&self) -> &[Point] {
        &self.groups[0]
    }
}

// =============================================================================
// Lap Detection
// =============================================================================

pub struct LapDetector {
    palette: HudPalette,
    corner: Vec<Point>,
    last_known_lap: u8,
}

impl LapDetector {
    pub fn new(palette: HudPalette, corner: Vec<Point>) -> Self {
        Self {
            palette,
            corner,
            last_known_lap: 1,
        }
    }

    /// Current lap. An unrecognized corner color is usually the character icon
    /// covering it, so the last known lap is kept.
    pub fn detect(&mut self, grid: &PixelGrid) -> u8 {
        if let Some(lap) = self.palette.group_value(grid, &self.corner) {
            self.last_known_lap = lap;
        }
        self.last_known_lap
    }

    pub fn last_known_lap(&self) -> u8 {
        self.last_known_lap
    }

    pub fn reset(&mut self) {
        self.last_known_lap = 1;
    }
}

// =============================================================================
// Checkpoint Tracking
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointUpdate {
    pub lap: u8,
    pub checkpoint: Option<usize>,
    /// A new checkpoint was credited this observation.
    pub credited: bool,
    /// Progress went down; the highest credited checkpoint was taken back.
    pub went_backwards: bool,
}

pub struct CheckpointTracker {
    set: CheckpointSet,
    palette: HudPalette,
    achieved: Vec<Vec<bool>>,
    last_known_lap: u8,
    last_known_checkpoint: Option<usize>,
}

impl CheckpointTracker {
    pub fn new(set: CheckpointSet, palette: HudPalette, laps: usize) -> Self {
        let achieved = vec![vec![false; set.len()]; laps];
        Self {
            set,
            palette,
            achieved,
            last_known_lap: 1,
            last_known_checkpoint: None,
        }
    }

    pub fn set(&self) -> &CheckpointSet {
        &self.set
    }

    /// Highest checkpoint the border progress shows as reached, or `None` when
    /// no group has a recognizable color.
    pub fn current_checkpoint(&self, grid: &PixelGrid) -> Option<usize> {
        let mut lowest: Option<(usize, u8)> = None;
        for (i, group) in self.set.groups().iter().enumerate() {
            if let Some(value) = self.palette.group_value(grid, group) {
                if lowest.is_none_or(|(_, v)| value < v) {
                    lowest = Some((i, value));
                }
            }
        }
        // Lowest at the lap corner means the whole border has the same color.
        lowest.map(|(i, _)| if i == 0 { self.set.len() - 1 } else { i - 1 })
    }

    fn lap_slot(&mut self, lap: u8) -> Option<&mut Vec<bool>> {
        self.achieved.get_mut(usize::from(lap).checked_sub(1)?)
    }

    pub fn is_achieved(&self, lap: u8, checkpoint: usize) -> bool {
        usize::from(lap)
            .checked_sub(1)
            .and_then(|l| self.achieved.get(l))
            .and_then(|cps| cps.get(checkpoint))
            .copied()
            .unwrap_or(false)
    }

    /// Number of checkpoints credited so far in `lap` (always a prefix).
    pub fn achieved_count(&self, lap: u8) -> usize {
        usize::from(lap)
            .checked_sub(1)
            .and_then(|l| self.achieved.get(l))
            .map_or(0, |cps| cps.iter().take_while(|&&a| a).count())
    }

    /// Credits `checkpoint` in `lap` if it directly follows the credited prefix.
    pub fn credit(&mut self, lap: u8, checkpoint: usize) -> bool {
        let next = self.achieved_count(lap);
        let Some(slot) = self.lap_slot(lap) else {
            return false;
        };
        if checkpoint != next || checkpoint >= slot.len() {
            return false;
        }
        slot[checkpoint] = true;
        true
    }

    /// Takes back the highest credited checkpoint of `lap`.
    pub fn retreat(&mut self, lap: u8) -> Option<usize> {
        let last = self.achieved_count(lap).checked_sub(1)?;
        self.lap_slot(lap)?[last] = false;
        Some(last)
    }

    pub fn evaluate(&mut self, grid: &PixelGrid, lap: u8) -> CheckpointUpdate {
        let Some(current) = self.current_checkpoint(grid) else {
            // Nothing readable (HUD hidden or covered): assume no change.
            return CheckpointUpdate {
                lap,
                checkpoint: None,
                credited: false,
                went_backwards: false,
            };
        };
        let checkpoint = Some(current);
        let credited = self.credit(lap, current);
        let went_backwards = !credited
            && (lap < self.last_known_lap
                || self.last_known_checkpoint.is_some_and(|last| current < last));
        if went_backwards {
            let taken = self.retreat(lap);
            tracing::debug!(lap, ?checkpoint, ?taken, "went backwards");
        } else if credited {
            tracing::trace!(lap, ?checkpoint, "checkpoint credited");
        }

        self.last_known_lap = lap;
        self.last_known_checkpoint = checkpoint;
        CheckpointUpdate {
            lap,
            checkpoint,
            credited,
            went_backwards,
        }
    }

    pub fn reset(&mut self) {
        for lap in &mut self.achieved {
            lap.fill(false);
        }
        self.last_known_lap = 1;
        self.last_known_checkpoint = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLUE: Rgb = Rgb::new(0, 0, 255);
    const YELLOW: Rgb = Rgb::new(255, 255, 0);
    const GREY: Rgb = Rgb::new(90, 90, 90);

    fn paint(grid: &mut PixelGrid, group: &[Point], color: Rgb) {
        for &(x, y) in group {
            grid.set_pixel(x, y, color);
        }
    }

    fn small_set() -> CheckpointSet {
        CheckpointSet::perimeter(2, 2, 14, 10)
    }

    /// Border showing `progress` groups in `ahead` and the rest in `behind`.
    fn border(set: &CheckpointSet, progress: usize, ahead: Rgb, behind: Rgb) -> PixelGrid {
        let mut grid = PixelGrid::filled(20, 16, GREY);
        for (i, group) in set.groups().iter().enumerate() {
            paint(&mut grid, group, if i < progress { ahead } else { behind });
        }
        grid
    }

    #[test]
    fn perimeter_layout() {
        let set = small_set();
        // 6 top, 4 right, 5 bottom, 4 left
        assert_eq!(set.len(), 19);
        assert_eq!(set.lap_corner()[0], (2, 2));
        assert_eq!(set.groups()[6][0], (14, 2));
        assert_eq!(set.groups()[10][0], (12, 10));
        assert_eq!(set.groups()[15][0], (2, 10));
    }

    #[test]
    fn from_groups_validates_sizes() {
        assert!(CheckpointSet::from_groups(vec![vec![(0, 0), (1, 0)]]).is_ok());
        assert!(CheckpointSet::from_groups(vec![vec![(0, 0)]]).is_err());
        assert!(CheckpointSet::from_groups(vec![]).is_err());
    }

    #[test]
    fn group_needs_agreement() {
        let palette = HudPalette::default();
        let mut grid = PixelGrid::filled(4, 4, BLUE);
        let group = [(0, 0), (1, 0), (0, 1)];
        assert_eq!(palette.group_value(&grid, &group), Some(1));
        grid.set_pixel(1, 0, YELLOW);
        assert_eq!(palette.group_value(&grid, &group), None);
        assert_eq!(palette.group_value(&grid, &[(9, 9), (0, 0)]), None);
    }

    #[test]
    fn current_checkpoint_from_border() {
        let set = small_set();
        let tracker = CheckpointTracker::new(set.clone(), HudPalette::default(), 3);

        // Lap 2 color has reached groups 0..5; group 5 is the first still at lap 1.
        let grid = border(&set, 5, YELLOW, BLUE);
        assert_eq!(tracker.current_checkpoint(&grid), Some(4));

        let all_blue = border(&set, 0, YELLOW, BLUE);
        assert_eq!(tracker.current_checkpoint(&all_blue), Some(set.len() - 1));

        let nothing = PixelGrid::filled(20, 16, GREY);
        assert_eq!(tracker.current_checkpoint(&nothing), None);
    }

    #[test]
    fn occluded_groups_are_ignored() {
        let set = small_set();
        let tracker = CheckpointTracker::new(set.clone(), HudPalette::default(), 3);
        let mut grid = border(&set, 5, YELLOW, BLUE);
        // Something covers part of the first blue group.
        paint(&mut grid, &set.groups()[5][..1], GREY);
        assert_eq!(tracker.current_checkpoint(&grid), Some(5));
    }

    #[test]
    fn credit_is_sequential_and_idempotent() {
        let mut tracker = CheckpointTracker::new(small_set(), HudPalette::default(), 3);
        assert!(!tracker.credit(1, 2));
        assert!(!tracker.is_achieved(1, 2));
        assert!(tracker.credit(1, 0));
        assert!(!tracker.credit(1, 0));
        assert!(tracker.credit(1, 1));
        assert!(tracker.credit(1, 2));
        assert_eq!(tracker.achieved_count(1), 3);
        assert_eq!(tracker.achieved_count(2), 0);
        assert!(!tracker.credit(0, 0));
        assert!(!tracker.credit(4, 0));

        for lap in 1..=3u8 {
            for k in 0..tracker.set().len() {
                if tracker.is_achieved(lap, k) {
                    assert!((0..k).all(|j| tracker.is_achieved(lap, j)));
                }
            }
        }
    }

    #[test]
    fn same_frame_twice_credits_once() {
        let set = small_set();
        let mut tracker = CheckpointTracker::new(set.clone(), HudPalette::default(), 3);
        let start = border(&set, 1, YELLOW, BLUE);
        let first = tracker.evaluate(&start, 1);
        assert_eq!(first.checkpoint, Some(0));
        assert!(first.credited);

        let again = tracker.evaluate(&start, 1);
        assert!(!again.credited);
        assert!(!again.went_backwards);
        assert_eq!(tracker.achieved_count(1), 1);
    }

    #[test]
    fn skipped_checkpoint_is_not_credited() {
        let set = small_set();
        let mut tracker = CheckpointTracker::new(set.clone(), HudPalette::default(), 3);
        tracker.evaluate(&border(&set, 1, YELLOW, BLUE), 1);
        let jump = tracker.evaluate(&border(&set, 4, YELLOW, BLUE), 1);
        assert_eq!(jump.checkpoint, Some(3));
        assert!(!jump.credited);
        assert!(!jump.went_backwards);
        assert_eq!(tracker.achieved_count(1), 1);
    }

    #[test]
    fn backwards_takes_back_progress() {
        let set = small_set();
        let mut tracker = CheckpointTracker::new(set.clone(), HudPalette::default(), 3);
        for progress in 1..=3 {
            assert!(tracker.evaluate(&border(&set, progress, YELLOW, BLUE), 1).credited);
        }
        let back = tracker.evaluate(&border(&set, 2, YELLOW, BLUE), 1);
        assert!(back.went_backwards);
        assert_eq!(tracker.achieved_count(1), 2);

        // Driving forward again re-credits the same checkpoint.
        assert!(tracker.evaluate(&border(&set, 3, YELLOW, BLUE), 1).credited);

        tracker.reset();
        assert_eq!(tracker.achieved_count(1), 0);
    }

    #[test]
    fn unreadable_frame_changes_nothing() {
        let set = small_set();
        let mut tracker = CheckpointTracker::new(set.clone(), HudPalette::default(), 3);
        let two = border(&set, 2, YELLOW, BLUE);
        assert!(tracker.evaluate(&border(&set, 1, YELLOW, BLUE), 1).credited);
        assert!(tracker.evaluate(&two, 1).credited);

        let hidden = tracker.evaluate(&PixelGrid::filled(20, 16, GREY), 1);
        assert_eq!(hidden.checkpoint, None);
        assert!(!hidden.credited);
        assert!(!hidden.went_backwards);
        assert_eq!(tracker.achieved_count(1), 2);

        // Same view as before the occlusion: neither credit nor backwards.
        let back_in_view = tracker.evaluate(&two, 1);
        assert!(!back_in_view.credited);
        assert!(!back_in_view.went_backwards);
        assert_eq!(tracker.achieved_count(1), 2);
    }

    #[test]
    fn lap_detector_keeps_last_lap_when_occluded() {
        let set = small_set();
        let mut laps = LapDetector::new(HudPalette::default(), set.lap_corner().to_vec());
        assert_eq!(laps.detect(&border(&set, 1, YELLOW, BLUE)), 2);
        assert_eq!(laps.detect(&PixelGrid::filled(20, 16, GREY)), 2);
        assert_eq!(laps.detect(&border(&set, 0, YELLOW, BLUE)), 1);
        laps.reset();
        assert_eq!(laps.last_known_lap(), 1);
    }
}
