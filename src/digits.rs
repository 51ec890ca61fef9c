//! Template matching for the on-screen damage readout (`0%` .. `999%`).
//!
//! The readout region and every glyph are reduced to ink masks with the same
//! adaptive threshold, then glyphs are slid horizontally over the region and
//! scored by intersection-over-union. The `%` sign anchors the search; digits
//! are read right to left from there.

use anyhow::{Context, Result, ensure};
use std::path::Path;
use thiserror::Error;

use crate::frame::{PixelGrid, Region, Rgb};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum DigitReadError {
    #[error("couldn't find %")]
    PercentUndetected,
    #[error("couldn't find first digit after %")]
    DigitAfterPercentUndetected,
    #[error("zero has the wrong color")]
    ZeroNotRightColor,
}

/// Outcome of reading one readout.
pub type DamageReading = Result<u16, DigitReadError>;

// =============================================================================
// Ink Masks
// =============================================================================

/// Offset subtracted from the local mean; pixels at or below it are ink.
const THRESHOLD_C: f32 = 2.0;

/// Binary image, `true` = ink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InkMask {
    width: u32,
    height: u32,
    bits: Vec<bool>,
}

impl InkMask {
    /// Adaptive threshold on BT.601 luma against a 3x3 Gaussian local mean
    /// (replicated borders), followed by a 2x2 dilation of the ink.
    pub fn from_grid(grid: &PixelGrid) -> Self {
        let (w, h) = (grid.width() as usize, grid.height() as usize);
        let gray: Vec<f32> = grid
            .as_bytes()
            .chunks_exact(3)
            .map(|p| Rgb::new(p[0], p[1], p[2]).luma())
            .collect();
        let at = |x: isize, y: isize| {
            let x = x.clamp(0, w as isize - 1) as usize;
            let y = y.clamp(0, h as isize - 1) as usize;
            gray[y * w + x]
        };

        const KERNEL: [f32; 3] = [1.0, 2.0, 1.0];
        let mut ink = vec![false; w * h];
        for y in 0..h {
            for x in 0..w {
                let mut mean = 0.0;
                for (ky, wy) in KERNEL.iter().enumerate() {
                    for (kx, wx) in KERNEL.iter().enumerate() {
                        mean += wy * wx * at(x as isize + kx as isize - 1, y as isize + ky as isize - 1);
                    }
                }
                mean /= 16.0;
                ink[y * w + x] = gray[y * w + x] <= mean - THRESHOLD_C;
            }
        }

        let mut bits = vec![false; w * h];
        for y in 0..h {
            for x in 0..w {
                bits[y * w + x] = (0..=1).any(|dy| {
                    (0..=1).any(|dx| x >= dx && y >= dy && ink[(y - dy) * w + (x - dx)])
                });
            }
        }

        Self {
            width: grid.width(),
            height: grid.height(),
            bits,
        }
    }

    /// Text art, `#` = ink, anything else blank. Rows must have equal length.
    pub fn from_rows(rows: &[&str]) -> Result<Self> {
        let width = rows.first().map_or(0, |r| r.chars().count());
        ensure!(
            rows.iter().all(|r| r.chars().count() == width),
            "glyph rows have unequal lengths"
        );
        let bits = rows.iter().flat_map(|r| r.chars().map(|c| c == '#')).collect();
        Ok(Self {
            width: width as u32,
            height: rows.len() as u32,
            bits,
        })
    }

    /// Glyph outline image: dark pixels are ink.
    pub fn load_png(path: &Path) -> Result<Self> {
        let grid = PixelGrid::load_png(path)?;
        let bits = grid
            .as_bytes()
            .chunks_exact(3)
            .map(|p| Rgb::new(p[0], p[1], p[2]).luma() < 128.0)
            .collect();
        Ok(Self {
            width: grid.width(),
            height: grid.height(),
            bits,
        })
    }

    /// Renders the mask black-on-white, the format [`InkMask::load_png`] reads.
    pub fn to_grid(&self) -> PixelGrid {
        let mut grid = PixelGrid::filled(self.width, self.height, Rgb::WHITE);
        for y in 0..self.height {
            for x in 0..self.width {
                if self.get(x, y) {
                    grid.set_pixel(x, y, Rgb::BLACK);
                }
            }
        }
        grid
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn get(&self, x: u32, y: u32) -> bool {
        x < self.width && y < self.height && self.bits[(y * self.width + x) as usize]
    }

    /// First ink pixel in row-major order.
    pub fn first_ink(&self) -> Option<(u32, u32)> {
        let i = self.bits.iter().position(|&b| b)? as u32;
        Some((i % self.width, i / self.width))
    }

    /// Intersection over union of `template` placed at column `x0`, top-aligned.
    fn jaccard_at(&self, template: &InkMask, x0: u32) -> f32 {
        if x0 + template.width > self.width || template.height > self.height {
            return 0.0;
        }
        let (mut both, mut either) = (0u32, 0u32);
        for y in 0..template.height {
            for x in 0..template.width {
                let a = self.get(x0 + x, y);
                let b = template.get(x, y);
                both += (a && b) as u32;
                either += (a || b) as u32;
            }
        }
        if either == 0 {
            0.0
        } else {
            both as f32 / either as f32
        }
    }
}

// =============================================================================
// Glyph Set
// =============================================================================

#[derive(Debug, Clone)]
pub struct GlyphSet {
    percent: InkMask,
    digits: [InkMask; 10],
}

impl GlyphSet {
    pub fn new(percent: InkMask, digits: [InkMask; 10]) -> Result<Self> {
        let height = percent.height();
        ensure!(
            digits.iter().all(|d| d.height() == height),
            "all glyphs must share the % glyph height ({height})"
        );
        ensure!(
            std::iter::once(&percent).chain(&digits).all(|g| g.first_ink().is_some()),
            "every glyph needs at least one ink pixel"
        );
        Ok(Self { percent, digits })
    }

    /// Loads `percent.png` and `0.png` .. `9.png` from `dir`.
    pub fn load_dir(dir: &Path) -> Result<Self> {
        let load = |name: &str| {
            let path = dir.join(name);
            InkMask::load_png(&path).with_context(|| format!("glyph {}", path.display()))
        };
        let percent = load("percent.png")?;
        let mut digits = Vec::with_capacity(10);
        for d in 0..10 {
            digits.push(load(&format!("{d}.png"))?);
        }
        let digits: [InkMask; 10] = digits
            .try_into()
            .map_err(|_| anyhow::anyhow!("expected ten digit glyphs"))?;
        tracing::debug!(dir = %dir.display(), "loaded digit glyphs");
        Self::new(percent, digits)
    }

    /// Builds masks from rendered glyph images, binarized like screen regions.
    pub fn from_grids(percent: &PixelGrid, digits: &[PixelGrid; 10]) -> Result<Self> {
        Self::new(
            InkMask::from_grid(percent),
            std::array::from_fn(|d| InkMask::from_grid(&digits[d])),
        )
    }

    pub fn percent(&self) -> &InkMask {
        &self.percent
    }

    pub fn digit(&self, d: usize) -> Option<&InkMask> {
        self.digits.get(d)
    }
}

// =============================================================================
// Recognizer
// =============================================================================

#[derive(Debug, Clone)]
pub struct RecognizerConfig {
    /// Minimum IoU for a glyph to count as found.
    pub min_score: f32,
    /// Extra columns searched to the left of each expected digit position.
    pub digit_gap: u32,
    pub max_digits: usize,
    /// First column of the `%` search; `None` starts at the region's middle minus 11.
    pub percent_search_start: Option<u32>,
    /// Per-channel tolerance when comparing a zero against the first zero seen.
    pub zero_color_tolerance: u8,
}

impl Default for RecognizerConfig {
    fn default() -> Self {
        Self {
            min_score: 0.35,
            digit_gap: 4,
            max_digits: 3,
            percent_search_start: None,
            zero_color_tolerance: 24,
        }
    }
}

struct Match {
    offset: u32,
    digit: usize,
    score: f32,
}

pub struct DigitRecognizer {
    glyphs: GlyphSet,
    config: RecognizerConfig,
    zero_color: Option<Rgb>,
    candidate_zero_color: Option<Rgb>,
}

impl DigitRecognizer {
    pub fn new(glyphs: GlyphSet, config: RecognizerConfig) -> Self {
        Self {
            glyphs,
            config,
            zero_color: None,
            candidate_zero_color: None,
        }
    }

    pub fn config(&self) -> &RecognizerConfig {
        &self.config
    }

    /// Reference color zeros are checked against, once one was confirmed.
    pub fn zero_color(&self) -> Option<Rgb> {
        self.zero_color
    }

    /// Adopts the color of the latest zero read as the reference. Call it
    /// once debounced readings trust that zero.
    pub fn confirm_zero_color(&mut self) {
        if self.zero_color.is_some() {
            return;
        }
        if let Some(color) = self.candidate_zero_color.take() {
            tracing::debug!(?color, "recorded zero color");
            self.zero_color = Some(color);
        }
    }

    /// Crops `region` out of `screen` and reads it.
    pub fn recognize_in(&mut self, screen: &PixelGrid, region: Region) -> Result<DamageReading> {
        let crop = screen.crop(region).context("damage readout region")?;
        Ok(self.recognize(&crop))
    }

    /// Reads the number left of the `%` sign in `region`.
    pub fn recognize(&mut self, region: &PixelGrid) -> DamageReading {
        let mask = InkMask::from_grid(region);
        let anchor = self.find_percent(&mask)?;

        let mut digits: Vec<Match> = Vec::with_capacity(self.config.max_digits);
        let mut right_edge = anchor;
        for position in 0..self.config.max_digits {
            match self.find_digit(&mask, right_edge, position) {
                Some(found) => {
                    right_edge = found.offset;
                    digits.push(found);
                }
                None if position == 0 => return Err(DigitReadError::DigitAfterPercentUndetected),
                None => break,
            }
        }

        let value = digits
            .iter()
            .rev()
            .fold(0u16, |acc, m| acc * 10 + m.digit as u16);
        tracing::trace!(
            value,
            scores = ?digits.iter().map(|m| m.score).collect::<Vec<_>>(),
            "damage readout"
        );

        if value == 0 {
            self.check_zero_color(region, &digits[0])?;
        }
        Ok(value)
    }

    fn find_percent(&self, mask: &InkMask) -> Result<u32, DigitReadError> {
        let template = &self.glyphs.percent;
        let start = self
            .config
            .percent_search_start
            .unwrap_or_else(|| (mask.width() / 2).saturating_sub(11));
        let end = mask.width().saturating_sub(template.width());

        let mut best: Option<(u32, f32)> = None;
        for x in start..end {
            let score = mask.jaccard_at(template, x);
            if best.is_none_or(|(_, s)| score > s) {
                best = Some((x, score));
            }
        }
        match best {
            Some((x, score)) if score > self.config.min_score => Ok(x),
            _ => Err(DigitReadError::PercentUndetected),
        }
    }

    fn find_digit(&self, mask: &InkMask, right_edge: u32, position: usize) -> Option<Match> {
        let mut best: Option<Match> = None;
        for (digit, template) in self.glyphs.digits.iter().enumerate() {
            // Leading zeros are never drawn in the hundreds place.
            if position == 2 && digit == 0 {
                continue;
            }
            let Some(nearest) = right_edge.checked_sub(template.width()) else {
                continue;
            };
            for shift in 0..=self.config.digit_gap {
                let Some(offset) = nearest.checked_sub(shift) else {
                    break;
                };
                let score = mask.jaccard_at(template, offset);
                if best.as_ref().is_none_or(|b| score > b.score) {
                    best = Some(Match {
                        offset,
                        digit,
                        score,
                    });
                }
            }
        }
        best.filter(|m| m.score > self.config.min_score)
    }

    fn check_zero_color(&mut self, region: &PixelGrid, zero: &Match) -> Result<(), DigitReadError> {
        let Some((x, y)) = self.glyphs.digits[0].first_ink() else {
            return Ok(());
        };
        let Some(color) = region.pixel(zero.offset + x, y) else {
            return Ok(());
        };
        match self.zero_color {
            None => {
                self.candidate_zero_color = Some(color);
                Ok(())
            }
            Some(reference) if reference.close_to(color, self.config.zero_color_tolerance) => Ok(()),
            Some(reference) => {
                tracing::debug!(?color, ?reference, "zero color mismatch");
                Err(DigitReadError::ZeroNotRightColor)
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Synthetic 3x5 font used by recognizer and tracker tests.

    use super::*;

    pub const SCALE: u32 = 2;

    const FONT: [[&str; 5]; 10] = [
        ["###", "#.#", "#.#", "#.#", "###"],
        [".#.", "##.", ".#.", ".#.", "###"],
        ["###", "..#", "###", "#..", "###"],
        ["###", "..#", "###", "..#", "###"],
        ["#.#", "#.#", "###", "..#", "..#"],
        ["###", "#..", "###", "..#", "###"],
        ["###", "#..", "###", "#.#", "###"],
        ["###", "..#", "..#", "..#", "..#"],
        ["###", "#.#", "###", "#.#", "###"],
        ["###", "#.#", "###", "..#", "###"],
    ];
    const PERCENT: [&str; 5] = ["#...#", "...#.", "..#..", ".#...", "#...#"];

    /// Draws `rows` scaled up, with two blank columns each side and one blank row
    /// above and below.
    pub fn render(rows: &[&str], ink: Rgb) -> PixelGrid {
        let cols = rows[0].len() as u32;
        let mut grid = PixelGrid::filled(cols * SCALE + 4, rows.len() as u32 * SCALE + 2, Rgb::WHITE);
        for (y, row) in rows.iter().enumerate() {
            for (x, c) in row.chars().enumerate() {
                if c != '#' {
                    continue;
                }
                for sy in 0..SCALE {
                    for sx in 0..SCALE {
                        grid.set_pixel(2 + x as u32 * SCALE + sx, 1 + y as u32 * SCALE + sy, ink);
                    }
                }
            }
        }
        grid
    }

    pub fn digit(d: usize, ink: Rgb) -> PixelGrid {
        render(&FONT[d], ink)
    }

    pub fn percent(ink: Rgb) -> PixelGrid {
        render(&PERCENT, ink)
    }

    pub fn glyphs() -> GlyphSet {
        let digits: [PixelGrid; 10] = std::array::from_fn(|d| digit(d, Rgb::BLACK));
        GlyphSet::from_grids(&percent(Rgb::BLACK), &digits).unwrap()
    }

    /// A readout region showing `text` (digits followed by `%`), right-aligned
    /// with some blank space on either side.
    pub fn readout(text: &str, ink: Rgb) -> PixelGrid {
        let parts: Vec<PixelGrid> = text
            .chars()
            .map(|c| match c.to_digit(10) {
                Some(d) => digit(d as usize, ink),
                None => percent(ink),
            })
            .collect();
        let height = percent(ink).height();
        let mut region = PixelGrid::filled(64, height, Rgb::WHITE);
        let total: u32 = parts.iter().map(|p| p.width()).sum();
        let mut x = 64 - 6 - total;
        for part in &parts {
            region.paste(part, x, 0);
            x += part.width();
        }
        region
    }

    pub fn config() -> RecognizerConfig {
        RecognizerConfig {
            percent_search_start: Some(0),
            ..RecognizerConfig::default()
        }
    }

    pub fn recognizer() -> DigitRecognizer {
        DigitRecognizer::new(glyphs(), config())
    }
}
