//! Freehand curve capture and rendering.
//!
//! Pointer strokes are recorded as point sequences and drawn as smoothed
//! quadratic paths onto the interactive drawing surface. The surface is only
//! redrawn when something changed since the last frame.

use crate::mask::MaskSnapshot;
use crate::raster::{Pixmap, RasterResult, Surface};
use crate::session::SessionContext;
use kurbo::{BezPath, Cap, Join, Point, Stroke};
use peniko::Color;
use serde::{Deserialize, Serialize};

/// Default brush diameter in image pixels.
pub const DEFAULT_BRUSH_RADIUS: f64 = 4.0;

/// Brush palette.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrushColor {
    Red,
    Yellow,
    #[default]
    Green,
    Blue,
    Purple,
}

impl BrushColor {
    /// Every palette entry, in toolbar order.
    pub const ALL: [BrushColor; 5] = [
        BrushColor::Red,
        BrushColor::Yellow,
        BrushColor::Green,
        BrushColor::Blue,
        BrushColor::Purple,
    ];

    pub fn color(self) -> Color {
        match self {
            BrushColor::Red => Color::from_rgba8(0xea, 0x5d, 0x56, 255),
            BrushColor::Yellow => Color::from_rgba8(0xf3, 0xd1, 0x35, 255),
            BrushColor::Green => Color::from_rgba8(0x6c, 0xbe, 0x47, 255),
            BrushColor::Blue => Color::from_rgba8(0x53, 0xa7, 0xf5, 255),
            BrushColor::Purple => Color::from_rgba8(0xb3, 0x6a, 0xde, 255),
        }
    }
}

/// One freehand stroke.
#[derive(Debug, Clone, PartialEq)]
pub struct Curve {
    color: BrushColor,
    points: Vec<Point>,
}

impl Curve {
    fn new(color: BrushColor, start: Point) -> Self {
        Self {
            color,
            points: vec![start],
        }
    }

    pub fn color(&self) -> BrushColor {
        self.color
    }

    pub fn points(&self) -> &[Point] {
        &self.points
    }

    /// Smoothed path through the recorded points.
    pub fn to_path(&self) -> BezPath {
        smoothed_path(&self.points)
    }
}

/// Build a smoothed path through `points`.
///
/// Each interior point is used as the control point of a quadratic segment
/// ending at the midpoint between it and the next point, which removes the
/// corners a polyline would have. A final line reaches the last point.
pub fn smoothed_path(points: &[Point]) -> BezPath {
    let mut path = BezPath::new();
    let Some((&first, rest)) = points.split_first() else {
        return path;
    };
    path.move_to(first);

    for pair in rest.windows(2) {
        path.quad_to(pair[0], pair[0].midpoint(pair[1]));
    }
    if let Some(&last) = rest.last() {
        path.line_to(last);
    }
    path
}

/// Draw `curves` onto `surface`, replacing its contents.
pub fn draw_curves(curves: &[Curve], brush_radius: f64, surface: &mut dyn Surface) {
    surface.clear();

    let stroke = Stroke::new(brush_radius)
        .with_join(Join::Round)
        .with_caps(Cap::Round);

    for curve in curves {
        let Some(&first) = curve.points.first() else {
            continue;
        };
        let color = curve.color.color();
        // A quadratic path leaves a gap at its start; the dot closes it and
        // is all a single-point curve renders as.
        surface.fill_circle(first, brush_radius / 2.0, color);
        if curve.points.len() > 1 {
            surface.stroke_path(&curve.to_path(), &stroke, color);
        }
    }
}

/// Stroke capture state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StrokeState {
    #[default]
    Idle,
    Drawing,
}

/// Records strokes and keeps the interactive drawing surface up to date.
#[derive(Debug, Clone)]
pub struct CurveRenderer {
    curves: Vec<Curve>,
    state: StrokeState,
    color: BrushColor,
    brush_radius: f64,
    /// Whether the surface is out of date.
    dirty: bool,
    surface: Pixmap,
}

impl CurveRenderer {
    /// Create a renderer with an empty surface of the given size.
    pub fn new(width: u32, height: u32, brush_radius: f64) -> RasterResult<Self> {
        Ok(Self {
            curves: Vec::new(),
            state: StrokeState::Idle,
            color: BrushColor::default(),
            brush_radius,
            dirty: false,
            surface: Pixmap::new(width, height)?,
        })
    }

    pub fn state(&self) -> StrokeState {
        self.state
    }

    /// All recorded curves, oldest first.
    pub fn curves(&self) -> &[Curve] {
        &self.curves
    }

    pub fn brush_radius(&self) -> f64 {
        self.brush_radius
    }

    pub fn color(&self) -> BrushColor {
        self.color
    }

    /// Set the color used by the next stroke.
    pub fn set_color(&mut self, color: BrushColor) {
        self.color = color;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// The interactive drawing surface as of the last rendered frame.
    pub fn surface(&self) -> &Pixmap {
        &self.surface
    }

    /// Start a stroke. Ignored unless the context is in drawing mode.
    pub fn begin_stroke(&mut self, ctx: &SessionContext, point: Point) -> bool {
        if !ctx.drawing_enabled() || self.state == StrokeState::Drawing {
            return false;
        }
        self.curves.push(Curve::new(self.color, point));
        self.state = StrokeState::Drawing;
        self.dirty = true;
        true
    }

    /// Append a point to the stroke in progress.
    pub fn extend_stroke(&mut self, point: Point) -> bool {
        if self.state != StrokeState::Drawing {
            return false;
        }
        let Some(curve) = self.curves.last_mut() else {
            return false;
        };
        curve.points.push(point);
        self.dirty = true;
        true
    }

    /// Finish the stroke in progress. Returns true if one was open.
    pub fn end_stroke(&mut self) -> bool {
        if self.state != StrokeState::Drawing {
            return false;
        }
        self.state = StrokeState::Idle;
        true
    }

    /// Per-frame hook: redraw the surface if anything changed.
    ///
    /// Returns true if a redraw happened.
    pub fn render_frame(&mut self) -> bool {
        if !self.dirty {
            return false;
        }
        draw_curves(&self.curves, self.brush_radius, &mut self.surface);
        self.dirty = false;
        true
    }

    /// Rasterize the current drawing state for a mask push.
    pub fn snapshot(&mut self) -> RasterResult<MaskSnapshot> {
        self.render_frame();
        Ok(MaskSnapshot {
            bytes: self.surface.encode_png()?,
            width: self.surface.width(),
            height: self.surface.height(),
        })
    }

    /// Drop every curve and blank the surface.
    pub fn clear(&mut self) {
        self.curves.clear();
        self.state = StrokeState::Idle;
        self.surface.clear();
        self.dirty = false;
    }

    /// Match the surface to the image size. Curves are kept and redrawn.
    pub fn resize(&mut self, width: u32, height: u32) -> RasterResult<()> {
        self.surface.resize(width, height)?;
        self.dirty = true;
        Ok(())
    }
}
