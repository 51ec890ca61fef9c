use crate::frame::{PixelGrid, Rgb};
use crate::track::Point;

/// What the sampled pixels must look like on an end-of-episode frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndPattern {
    /// All sample points show the same color.
    AllEqual,
    /// All sample points show this color.
    Sentinel(Rgb),
    /// A single pixel shows a known color (sample points are ignored).
    PixelIs { point: Point, color: Rgb },
}

#[derive(Debug, Clone)]
pub struct EndDetectorConfig {
    pub points: Vec<Point>,
    pub pattern: EndPattern,
    /// Consecutive matches needed is `threshold + 1`.
    pub threshold: u32,
}

impl EndDetectorConfig {
    /// The four screen corners of a 640x480 capture.
    pub const CORNERS: [Point; 4] = [(19, 19), (620, 19), (19, 460), (620, 460)];

    pub fn corners(pattern: EndPattern) -> Self {
        Self {
            points: Self::CORNERS.to_vec(),
            pattern,
            threshold: 30,
        }
    }
}

impl Default for EndDetectorConfig {
    fn default() -> Self {
        Self::corners(EndPattern::Sentinel(Rgb::BLACK))
    }
}

/// Debounced end-of-episode detection over sampled pixels.
pub struct EndEpisodeDetector {
    config: EndDetectorConfig,
    confidence: u32,
    ended: bool,
    refunded: bool,
}

impl EndEpisodeDetector {
    pub fn new(config: EndDetectorConfig) -> Self {
        Self {
            config,
            confidence: 0,
            ended: false,
            refunded: false,
        }
    }

    fn matches(&self, grid: &PixelGrid) -> bool {
        match self.config.pattern {
            EndPattern::PixelIs { point, color } => grid.pixel(point.0, point.1) == Some(color),
            EndPattern::Sentinel(color) => {
                !self.config.points.is_empty()
                    && self
                        .config
                        .points
                        .iter()
                        .all(|&(x, y)| grid.pixel(x, y) == Some(color))
            }
            EndPattern::AllEqual => {
                let mut colors = self.config.points.iter().map(|&(x, y)| grid.pixel(x, y));
                match colors.next() {
                    Some(Some(first)) => colors.all(|c| c == Some(first)),
                    _ => false,
                }
            }
        }
    }

    /// Feeds one frame. Returns true exactly once per episode, on the frame
    /// that pushes confidence over the threshold.
    pub fn observe(&mut self, grid: &PixelGrid) -> bool {
        if self.ended {
            return false;
        }
        if self.matches(grid) {
            self.confidence += 1;
        } else {
            self.confidence = 0;
        }
        if self.confidence > self.config.threshold {
            tracing::info!(confidence = self.confidence, "episode end detected");
            self.ended = true;
            return true;
        }
        false
    }

    pub fn confidence(&self) -> u32 {
        self.confidence
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    /// Compensation for the steps spent confirming the end, each of which was
    /// charged `step_penalty`. Paid once, after the end is signaled.
    pub fn refund(&mut self, step_penalty: f64) -> f64 {
        if !self.ended || self.refunded {
            return 0.0;
        }
        self.refunded = true;
        f64::from(self.config.threshold + 1) * step_penalty.abs()
    }

    pub fn reset(&mut self) {
        self.confidence = 0;
        self.ended = false;
        self.refunded = false;
    }
}
