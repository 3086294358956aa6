//! Drawing surface abstraction and a CPU implementation.

use kurbo::{BezPath, PathEl, Point, Rect, Stroke};
use peniko::Color;
use thiserror::Error;

/// Maximum deviation allowed when flattening curves into line segments.
const FLATTEN_TOLERANCE: f64 = 0.25;

/// Raster errors.
#[derive(Debug, Error)]
pub enum RasterError {
    #[error("Invalid surface size: {0}x{1}")]
    InvalidSize(u32, u32),
    #[error("PNG encoding failed: {0}")]
    Encode(String),
}

/// Result type for raster operations.
pub type RasterResult<T> = Result<T, RasterError>;

/// Something curves can be drawn onto.
pub trait Surface {
    /// Reset every pixel to transparent.
    fn clear(&mut self);

    /// Fill a disc.
    fn fill_circle(&mut self, center: Point, radius: f64, color: Color);

    /// Stroke a path. Joins and caps are round.
    fn stroke_path(&mut self, path: &BezPath, stroke: &Stroke, color: Color);
}

/// RGBA8 pixel buffer, row-major, straight alpha.
#[derive(Debug, Clone, PartialEq)]
pub struct Pixmap {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl Pixmap {
    /// Create a transparent pixmap.
    pub fn new(width: u32, height: u32) -> RasterResult<Self> {
        if width == 0 || height == 0 {
            return Err(RasterError::InvalidSize(width, height));
        }
        Ok(Self {
            width,
            height,
            data: vec![0; width as usize * height as usize * 4],
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Raw RGBA bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// RGBA value at a pixel, if in bounds.
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let i = (y as usize * self.width as usize + x as usize) * 4;
        Some([self.data[i], self.data[i + 1], self.data[i + 2], self.data[i + 3]])
    }

    /// True if nothing has been drawn.
    pub fn is_blank(&self) -> bool {
        self.data.iter().all(|&b| b == 0)
    }

    /// Change dimensions. Contents are cleared.
    pub fn resize(&mut self, width: u32, height: u32) -> RasterResult<()> {
        *self = Self::new(width, height)?;
        Ok(())
    }

    /// Encode as PNG.
    pub fn encode_png(&self) -> RasterResult<Vec<u8>> {
        let mut png_data = Vec::new();
        {
            let mut encoder = png::Encoder::new(&mut png_data, self.width, self.height);
            encoder.set_color(png::ColorType::Rgba);
            encoder.set_depth(png::BitDepth::Eight);

            let mut writer = encoder
                .write_header()
                .map_err(|e| RasterError::Encode(e.to_string()))?;
            writer
                .write_image_data(&self.data)
                .map_err(|e| RasterError::Encode(e.to_string()))?;
            writer
                .finish()
                .map_err(|e| RasterError::Encode(e.to_string()))?;
        }
        Ok(png_data)
    }

    /// Write `color` to every pixel in `bounds` whose center satisfies `inside`.
    fn paint_where(&mut self, bounds: Rect, color: [u8; 4], inside: impl Fn(Point) -> bool) {
        let x0 = bounds.x0.floor().max(0.0) as u32;
        let y0 = bounds.y0.floor().max(0.0) as u32;
        let x1 = (bounds.x1.ceil().max(0.0) as u32).min(self.width);
        let y1 = (bounds.y1.ceil().max(0.0) as u32).min(self.height);

        for y in y0..y1 {
            for x in x0..x1 {
                let center = Point::new(x as f64 + 0.5, y as f64 + 0.5);
                if inside(center) {
                    let i = (y as usize * self.width as usize + x as usize) * 4;
                    self.data[i..i + 4].copy_from_slice(&color);
                }
            }
        }
    }

    /// Paint a capsule: every pixel within `radius` of segment a→b.
    fn paint_capsule(&mut self, a: Point, b: Point, radius: f64, color: [u8; 4]) {
        let bounds = Rect::from_points(a, b).inflate(radius, radius);
        self.paint_where(bounds, color, |p| segment_distance(p, a, b) <= radius);
    }
}

impl Surface for Pixmap {
    fn clear(&mut self) {
        self.data.fill(0);
    }

    fn fill_circle(&mut self, center: Point, radius: f64, color: Color) {
        self.paint_capsule(center, center, radius, rgba(color));
    }

    fn stroke_path(&mut self, path: &BezPath, stroke: &Stroke, color: Color) {
        let radius = stroke.width / 2.0;
        let color = rgba(color);

        for polyline in flatten_polylines(path) {
            if let [only] = polyline.as_slice() {
                self.paint_capsule(*only, *only, radius, color);
                continue;
            }
            for pair in polyline.windows(2) {
                self.paint_capsule(pair[0], pair[1], radius, color);
            }
        }
    }
}

/// Flatten a path into polylines, one per subpath.
pub fn flatten_polylines(path: &BezPath) -> Vec<Vec<Point>> {
    let mut polylines: Vec<Vec<Point>> = Vec::new();
    kurbo::flatten(path.iter(), FLATTEN_TOLERANCE, |el| match el {
        PathEl::MoveTo(p) => polylines.push(vec![p]),
        PathEl::LineTo(p) => {
            if let Some(current) = polylines.last_mut() {
                current.push(p);
            }
        }
        PathEl::ClosePath => {
            if let Some(current) = polylines.last_mut() {
                if let Some(&first) = current.first() {
                    current.push(first);
                }
            }
        }
        // flatten only emits lines
        PathEl::QuadTo(..) | PathEl::CurveTo(..) => {}
    });
    polylines
}

/// Distance from a point to a line segment (a→b).
fn segment_distance(point: Point, a: Point, b: Point) -> f64 {
    let seg = b - a;
    let pv = point - a;
    let len_sq = seg.hypot2();
    if len_sq < f64::EPSILON {
        return pv.hypot();
    }
    let t = (pv.dot(seg) / len_sq).clamp(0.0, 1.0);
    (point - (a + seg * t)).hypot()
}

fn rgba(color: Color) -> [u8; 4] {
    let c = color.to_rgba8();
    [c.r, c.g, c.b, c.a]
}
