use anyhow::{Context, Result, bail, ensure};
use std::path::{Path, PathBuf};

// =============================================================================
// Pixels
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const BLACK: Rgb = Rgb::new(0, 0, 0);
    pub const WHITE: Rgb = Rgb::new(255, 255, 255);

    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// True when every channel differs by at most `tolerance`.
    pub fn close_to(self, other: Rgb, tolerance: u8) -> bool {
        self.r.abs_diff(other.r) <= tolerance
            && self.g.abs_diff(other.g) <= tolerance
            && self.b.abs_diff(other.b) <= tolerance
    }

    /// BT.601 luma.
    pub fn luma(self) -> f32 {
        0.299 * self.r as f32 + 0.587 * self.g as f32 + 0.114 * self.b as f32
    }
}

/// Axis-aligned rectangle in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Region spanning x in `x_start..x_end` and y in `y_start..y_end`.
    pub const fn span(x_start: u32, x_end: u32, y_start: u32, y_end: u32) -> Self {
        Self::new(x_start, y_start, x_end - x_start, y_end - y_start)
    }
}

/// Row-major RGB snapshot of (part of) the screen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelGrid {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl PixelGrid {
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Result<Self> {
        let expected = width as usize * height as usize * 3;
        ensure!(
            data.len() == expected,
            "pixel buffer has {} bytes, {}x{} RGB needs {}",
            data.len(),
            width,
            height,
            expected
        );
        Ok(Self {
            width,
            height,
            data,
        })
    }

    pub fn filled(width: u32, height: u32, color: Rgb) -> Self {
        let data = [color.r, color.g, color.b].repeat(width as usize * height as usize);
        Self {
            width,
            height,
            data,
        }
    }

    pub fn from_image(image: image::RgbImage) -> Self {
        let (width, height) = image.dimensions();
        Self {
            width,
            height,
            data: image.into_raw(),
        }
    }

    pub fn load_png(path: &Path) -> Result<Self> {
        let image = image::open(path)
            .with_context(|| format!("failed to load {}", path.display()))?
            .to_rgb8();
        Ok(Self::from_image(image))
    }

    pub fn save_png(&self, path: &Path) -> Result<()> {
        image::RgbImage::from_raw(self.width, self.height, self.data.clone())
            .context("pixel buffer does not match its dimensions")?
            .save(path)
            .with_context(|| format!("failed to write {}", path.display()))
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    fn offset(&self, x: u32, y: u32) -> Option<usize> {
        (x < self.width && y < self.height)
            .then(|| (y as usize * self.width as usize + x as usize) * 3)
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<Rgb> {
        let i = self.offset(x, y)?;
        Some(Rgb::new(self.data[i], self.data[i + 1], self.data[i + 2]))
    }

    pub fn set_pixel(&mut self, x: u32, y: u32, color: Rgb) {
        if let Some(i) = self.offset(x, y) {
            self.data[i..i + 3].copy_from_slice(&[color.r, color.g, color.b]);
        }
    }

    pub fn contains(&self, region: Region) -> bool {
        region.x as u64 + region.width as u64 <= self.width as u64
            && region.y as u64 + region.height as u64 <= self.height as u64
    }

    pub fn crop(&self, region: Region) -> Result<PixelGrid> {
        ensure!(
            self.contains(region),
            "region {:?} exceeds {}x{} grid",
            region,
            self.width,
            self.height
        );
        let row_bytes = region.width as usize * 3;
        let mut data = Vec::with_capacity(row_bytes * region.height as usize);
        for y in region.y..region.y + region.height {
            let start = (y as usize * self.width as usize + region.x as usize) * 3;
            data.extend_from_slice(&self.data[start..start + row_bytes]);
        }
        Ok(PixelGrid {
            width: region.width,
            height: region.height,
            data,
        })
    }

    /// Copies `other` with its top-left corner at (x, y), clipping at the edges.
    pub fn paste(&mut self, other: &PixelGrid, x: u32, y: u32) {
        for oy in 0..other.height {
            for ox in 0..other.width {
                if let Some(color) = other.pixel(ox, oy) {
                    self.set_pixel(x + ox, y + oy, color);
                }
            }
        }
    }
}

// =============================================================================
// Frame Sources
// =============================================================================

/// Screen capture backend.
pub trait FrameSource {
    /// Captures `region` of the emulator window.
    fn grab(&mut self, region: Region) -> Result<PixelGrid>;
}

impl<F: FrameSource + ?Sized> FrameSource for Box<F> {
    fn grab(&mut self, region: Region) -> Result<PixelGrid> {
        (**self).grab(region)
    }
}

/// Replays prerecorded screens, repeating the last one once exhausted.
///
/// Recorded frames are already in window coordinates, so the region origin is
/// ignored when the frame has exactly the region's size.
pub struct ReplaySource {
    frames: Vec<PixelGrid>,
    cursor: usize,
}

impl ReplaySource {
    pub fn from_grids(frames: Vec<PixelGrid>) -> Result<Self> {
        ensure!(!frames.is_empty(), "replay source needs at least one frame");
        Ok(Self { frames, cursor: 0 })
    }

    /// Loads every `.png` in `dir`, sorted by file name.
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
            .with_context(|| format!("failed to read {}", dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("png")))
            .collect();
        paths.sort();
        let frames = paths
            .iter()
            .map(|p| PixelGrid::load_png(p))
            .collect::<Result<Vec<_>>>()?;
        tracing::info!(count = frames.len(), dir = %dir.display(), "loaded replay frames");
        Self::from_grids(frames)
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

impl FrameSource for ReplaySource {
    fn grab(&mut self, region: Region) -> Result<PixelGrid> {
        let index = self.cursor.min(self.frames.len() - 1);
        self.cursor += 1;
        let frame = &self.frames[index];
        if frame.width() == region.width && frame.height() == region.height {
            return Ok(frame.clone());
        }
        if frame.contains(region) {
            return frame.crop(region);
        }
        bail!(
            "replay frame {} is {}x{}, cannot serve {:?}",
            index,
            frame.width(),
            frame.height(),
            region
        )
    }
}

// =============================================================================
// Observer
// =============================================================================

/// Grabs the emulator window and keeps the latest snapshot for lookups.
pub struct FrameObserver<F> {
    source: F,
    screen: Region,
    latest: Option<PixelGrid>,
}

impl<F: FrameSource> FrameObserver<F> {
    pub fn new(source: F, screen: Region) -> Self {
        Self {
            source,
            screen,
            latest: None,
        }
    }

    pub fn screen(&self) -> Region {
        self.screen
    }

    /// Captures a fresh frame and returns it.
    pub fn observe(&mut self) -> Result<&PixelGrid> {
        let grid = self
            .source
            .grab(self.screen)
            .context("screen capture failed")?;
        ensure!(
            grid.width() == self.screen.width && grid.height() == self.screen.height,
            "capture returned {}x{}, expected {}x{}",
            grid.width(),
            grid.height(),
            self.screen.width,
            self.screen.height
        );
        Ok(&*self.latest.insert(grid))
    }

    pub fn latest(&self) -> Option<&PixelGrid> {
        self.latest.as_ref()
    }

    /// Color at (x, y) of the latest frame.
    pub fn pixel(&self, x: u32, y: u32) -> Option<Rgb> {
        self.latest.as_ref()?.pixel(x, y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crop_copies_the_right_rows() {
        let mut grid = PixelGrid::filled(6, 4, Rgb::WHITE);
        grid.set_pixel(2, 1, Rgb::new(1, 2, 3));
        grid.set_pixel(4, 2, Rgb::new(4, 5, 6));

        let sub = grid.crop(Region::span(2, 5, 1, 3)).unwrap();
        assert_eq!((sub.width(), sub.height()), (3, 2));
        assert_eq!(sub.pixel(0, 0), Some(Rgb::new(1, 2, 3)));
        assert_eq!(sub.pixel(2, 1), Some(Rgb::new(4, 5, 6)));
        assert_eq!(sub.pixel(3, 0), None);

        assert!(grid.crop(Region::new(4, 0, 3, 1)).is_err());
    }

    #[test]
    fn new_checks_buffer_length() {
        assert!(PixelGrid::new(2, 2, vec![0; 12]).is_ok());
        assert!(PixelGrid::new(2, 2, vec![0; 11]).is_err());
    }

    #[test]
    fn replay_repeats_last_frame_and_crops() {
        let a = PixelGrid::filled(4, 4, Rgb::BLACK);
        let b = PixelGrid::filled(4, 4, Rgb::WHITE);
        let mut source = ReplaySource::from_grids(vec![a.clone(), b.clone()]).unwrap();
        let full = Region::new(100, 100, 4, 4);
        assert_eq!(source.grab(full).unwrap(), a);
        assert_eq!(source.grab(full).unwrap(), b);
        assert_eq!(source.grab(full).unwrap(), b);
        assert_eq!(source.grab(Region::new(1, 1, 2, 2)).unwrap().width(), 2);
        assert!(source.grab(Region::new(0, 0, 8, 8)).is_err());
    }

    #[test]
    fn png_round_trip_through_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut grid = PixelGrid::filled(3, 2, Rgb::new(10, 20, 30));
        grid.set_pixel(1, 1, Rgb::new(255, 0, 0));
        grid.save_png(&dir.path().join("000.png")).unwrap();

        let mut source = ReplaySource::from_dir(dir.path()).unwrap();
        assert_eq!(source.len(), 1);
        assert_eq!(source.grab(Region::new(0, 0, 3, 2)).unwrap(), grid);
    }

    #[test]
    fn observer_keeps_latest_frame() {
        let source = ReplaySource::from_grids(vec![PixelGrid::filled(8, 8, Rgb::BLACK)]).unwrap();
        let mut observer = FrameObserver::new(source, Region::new(0, 0, 4, 4));
        assert_eq!(observer.observe().unwrap().width(), 4);
        assert_eq!(observer.pixel(0, 0), Some(Rgb::BLACK));
    }
}
