/// Shared whiteboard
///
/// Strokes are sent as independent line segments; the canvas pixels are
/// the only state. There is no history, so a peer that joins late starts
/// from a blank board, and clearing is local to the peer that clears.
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const DEFAULT_WIDTH: u32 = 800;
pub const DEFAULT_HEIGHT: u32 = 400;

pub const MIN_LINE_WIDTH: f64 = 1.0;
pub const MAX_LINE_WIDTH: f64 = 20.0;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid color {0:?}, expected #rrggbb")]
pub struct ColorParseError(String);

/// RGB color, written as `#rrggbb` on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Color {
    pub const BLACK: Color = Color::rgb(0, 0, 0);
    pub const WHITE: Color = Color::rgb(255, 255, 255);

    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }
}

/// Fill color of a blank board; the eraser paints with it
pub const BACKGROUND: Color = Color::WHITE;

impl FromStr for Color {
    type Err = ColorParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ColorParseError(s.to_string());
        let hex = s.strip_prefix('#').ok_or_else(err)?;
        if hex.len() != 6 || !hex.is_ascii() {
            return Err(err());
        }
        let channel = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).map_err(|_| err());
        Ok(Color::rgb(channel(0)?, channel(2)?, channel(4)?))
    }
}

impl TryFrom<String> for Color {
    type Error = ColorParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Color> for String {
    fn from(color: Color) -> Self {
        color.to_string()
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }
}

/// One stroke segment in canvas-local coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DrawEvent {
    pub x0: f64,
    pub y0: f64,
    pub x1: f64,
    pub y1: f64,
    pub color: Color,
    #[serde(rename = "lineWidth")]
    pub line_width: f64,
}

impl DrawEvent {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    fn is_finite(&self) -> bool {
        [self.x0, self.y0, self.x1, self.y1, self.line_width]
            .iter()
            .all(|v| v.is_finite())
    }
}

/// Raster canvas
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Canvas {
    width: u32,
    height: u32,
    pixels: Vec<Color>,
}

impl Canvas {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pixels: vec![BACKGROUND; width as usize * height as usize],
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<Color> {
        if x >= self.width || y >= self.height {
            return None;
        }
        Some(self.pixels[(y * self.width + x) as usize])
    }

    pub fn pixels(&self) -> &[Color] {
        &self.pixels
    }

    pub fn clear(&mut self) {
        self.pixels.fill(BACKGROUND);
    }

    /// Stroke a segment with round caps.
    ///
    /// A pixel is painted when its center lies within `line_width / 2` of
    /// the segment. Returns the number of pixels touched; segments with
    /// non-finite coordinates are ignored.
    pub fn draw(&mut self, event: &DrawEvent) -> usize {
        if !event.is_finite() || self.width == 0 || self.height == 0 {
            return 0;
        }

        let radius = (event.line_width / 2.0).max(0.5);
        let min_x = (event.x0.min(event.x1) - radius).floor().max(0.0);
        let max_x = (event.x0.max(event.x1) + radius)
            .ceil()
            .min(f64::from(self.width - 1));
        let min_y = (event.y0.min(event.y1) - radius).floor().max(0.0);
        let max_y = (event.y0.max(event.y1) + radius)
            .ceil()
            .min(f64::from(self.height - 1));
        if min_x > max_x || min_y > max_y {
            return 0;
        }

        let (dx, dy) = (event.x1 - event.x0, event.y1 - event.y0);
        let length_sq = dx * dx + dy * dy;
        let radius_sq = radius * radius;
        let mut painted = 0;

        for py in (min_y as u32)..=(max_y as u32) {
            for px in (min_x as u32)..=(max_x as u32) {
                let cx = f64::from(px) + 0.5;
                let cy = f64::from(py) + 0.5;
                let t = if length_sq == 0.0 {
                    0.0
                } else {
                    (((cx - event.x0) * dx + (cy - event.y0) * dy) / length_sq).clamp(0.0, 1.0)
                };
                let nx = event.x0 + t * dx - cx;
                let ny = event.y0 + t * dy - cy;
                if nx * nx + ny * ny <= radius_sq {
                    self.pixels[(py * self.width + px) as usize] = event.color;
                    painted += 1;
                }
            }
        }
        painted
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tool {
    Pen,
    Eraser,
}

/// Local drawing surface driven by pointer input
#[derive(Debug, Clone)]
pub struct Whiteboard {
    canvas: Canvas,
    tool: Tool,
    color: Color,
    line_width: f64,
    last_point: Option<(f64, f64)>,
}

impl Default for Whiteboard {
    fn default() -> Self {
        Self::new(DEFAULT_WIDTH, DEFAULT_HEIGHT)
    }
}

impl Whiteboard {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            canvas: Canvas::new(width, height),
            tool: Tool::Pen,
            color: Color::BLACK,
            line_width: 2.0,
            last_point: None,
        }
    }

    pub fn canvas(&self) -> &Canvas {
        &self.canvas
    }

    pub fn tool(&self) -> Tool {
        self.tool
    }

    pub fn set_tool(&mut self, tool: Tool) {
        self.tool = tool;
    }

    pub fn color(&self) -> Color {
        self.color
    }

    pub fn set_color(&mut self, color: Color) {
        self.color = color;
    }

    pub fn line_width(&self) -> f64 {
        self.line_width
    }

    pub fn set_line_width(&mut self, width: f64) {
        if width.is_finite() {
            self.line_width = width.clamp(MIN_LINE_WIDTH, MAX_LINE_WIDTH);
        }
    }

    pub fn is_drawing(&self) -> bool {
        self.last_point.is_some()
    }

    pub fn pointer_down(&mut self, x: f64, y: f64) {
        self.last_point = Some((x, y));
    }

    /// Draw from the last point to `(x, y)` and return the segment to
    /// broadcast, or `None` when no stroke is in progress.
    pub fn pointer_move(&mut self, x: f64, y: f64) -> Option<DrawEvent> {
        let (x0, y0) = self.last_point?;
        let color = match self.tool {
            Tool::Pen => self.color,
            Tool::Eraser => BACKGROUND,
        };
        let event = DrawEvent {
            x0,
            y0,
            x1: x,
            y1: y,
            color,
            line_width: self.line_width,
        };
        self.canvas.draw(&event);
        self.last_point = Some((x, y));
        Some(event)
    }

    /// Pointer released or left the canvas
    pub fn pointer_up(&mut self) {
        self.last_point = None;
    }

    /// Draw a segment received from a peer. Never re-broadcast.
    pub fn apply_remote(&mut self, event: &DrawEvent) -> usize {
        self.canvas.draw(event)
    }

    pub fn clear(&mut self) {
        self.canvas.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(x0: f64, y0: f64, x1: f64, y1: f64, color: Color, w: f64) -> DrawEvent {
        DrawEvent {
            x0,
            y0,
            x1,
            y1,
            color,
            line_width: w,
        }
    }

    #[test]
    fn test_color_parse_and_display() {
        let c: Color = "#FF8000".parse().unwrap();
        assert_eq!(c, Color::rgb(255, 128, 0));
        assert_eq!(c.to_string(), "#ff8000");
        assert!("ff8000".parse::<Color>().is_err());
        assert!("#ff80".parse::<Color>().is_err());
        assert!("#gg0000".parse::<Color>().is_err());
    }

    #[test]
    fn test_draw_event_wire_format() {
        let event = DrawEvent::from_json(
            r##"{"x0":1,"y0":2,"x1":3.5,"y1":4,"color":"#000000","lineWidth":2}"##,
        )
        .unwrap();
        assert_eq!(event, segment(1.0, 2.0, 3.5, 4.0, Color::BLACK, 2.0));

        let value: serde_json::Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();
        assert_eq!(value["lineWidth"], 2.0);
        assert_eq!(value["color"], "#000000");
    }

    #[test]
    fn test_draw_paints_along_segment() {
        let mut canvas = Canvas::new(20, 10);
        let painted = canvas.draw(&segment(2.0, 5.0, 17.0, 5.0, Color::BLACK, 2.0));

        assert!(painted > 0);
        assert_eq!(canvas.pixel(10, 4), Some(Color::BLACK));
        assert_eq!(canvas.pixel(10, 0), Some(BACKGROUND));
    }

    #[test]
    fn test_zero_length_segment_draws_dot() {
        let mut canvas = Canvas::new(10, 10);
        assert!(canvas.draw(&segment(5.0, 5.0, 5.0, 5.0, Color::BLACK, 4.0)) > 0);
        assert_eq!(canvas.pixel(5, 5), Some(Color::BLACK));
    }

    #[test]
    fn test_out_of_bounds_and_non_finite_are_clipped() {
        let mut canvas = Canvas::new(10, 10);
        assert_eq!(canvas.draw(&segment(100.0, 100.0, 200.0, 200.0, Color::BLACK, 2.0)), 0);
        assert_eq!(canvas.draw(&segment(f64::NAN, 0.0, 5.0, 5.0, Color::BLACK, 2.0)), 0);
        assert!(canvas.draw(&segment(-5.0, 5.0, 5.0, 5.0, Color::BLACK, 2.0)) > 0);
    }

    #[test]
    fn test_replay_is_pixel_identical() {
        let events = vec![
            segment(10.0, 10.0, 200.0, 150.0, Color::rgb(200, 10, 10), 3.0),
            segment(200.0, 150.0, 50.0, 300.0, Color::rgb(0, 0, 255), 7.5),
            segment(50.0, 300.0, 52.0, 301.0, BACKGROUND, 12.0),
        ];
        let mut first = Canvas::new(DEFAULT_WIDTH, DEFAULT_HEIGHT);
        let mut second = Canvas::new(DEFAULT_WIDTH, DEFAULT_HEIGHT);

        for e in &events {
            first.draw(e);
        }
        for e in &events {
            second.draw(e);
        }

        assert_eq!(first, second);
    }

    #[test]
    fn test_pointer_drag_emits_connected_segments() {
        let mut board = Whiteboard::new(100, 100);
        assert!(board.pointer_move(5.0, 5.0).is_none());

        board.pointer_down(10.0, 10.0);
        let a = board.pointer_move(20.0, 10.0).unwrap();
        let b = board.pointer_move(20.0, 30.0).unwrap();
        board.pointer_up();

        assert_eq!((a.x0, a.y0, a.x1, a.y1), (10.0, 10.0, 20.0, 10.0));
        assert_eq!((b.x0, b.y0), (a.x1, a.y1));
        assert!(board.pointer_move(40.0, 40.0).is_none());
        assert!(!board.is_drawing());
    }

    #[test]
    fn test_eraser_paints_background() {
        let mut board = Whiteboard::new(50, 50);
        board.set_color(Color::rgb(255, 0, 0));
        board.pointer_down(10.0, 10.0);
        board.pointer_move(40.0, 10.0);
        assert_eq!(board.canvas().pixel(25, 10), Some(Color::rgb(255, 0, 0)));

        board.set_tool(Tool::Eraser);
        board.pointer_down(10.0, 10.0);
        let event = board.pointer_move(40.0, 10.0).unwrap();

        assert_eq!(event.color, BACKGROUND);
        assert_eq!(board.canvas().pixel(25, 10), Some(BACKGROUND));
    }

    #[test]
    fn test_remote_strokes_match_local_rendering() {
        let mut local = Whiteboard::new(120, 80);
        let mut remote = Whiteboard::new(120, 80);
        local.set_line_width(5.0);

        local.pointer_down(5.0, 5.0);
        let events: Vec<DrawEvent> = [(30.0, 20.0), (60.0, 70.0), (110.0, 10.0)]
            .iter()
            .filter_map(|&(x, y)| local.pointer_move(x, y))
            .collect();
        for e in &events {
            let wire = e.to_json().unwrap();
            remote.apply_remote(&DrawEvent::from_json(&wire).unwrap());
        }

        assert_eq!(local.canvas(), remote.canvas());
    }

    #[test]
    fn test_line_width_is_clamped() {
        let mut board = Whiteboard::default();
        board.set_line_width(0.0);
        assert_eq!(board.line_width(), MIN_LINE_WIDTH);
        board.set_line_width(99.0);
        assert_eq!(board.line_width(), MAX_LINE_WIDTH);
        board.set_line_width(f64::NAN);
        assert_eq!(board.line_width(), MAX_LINE_WIDTH);
    }

    #[test]
    fn test_clear_resets_pixels() {
        let mut board = Whiteboard::new(30, 30);
        board.pointer_down(0.0, 0.0);
        board.pointer_move(29.0, 29.0);
        board.clear();
        assert!(board.canvas().pixels().iter().all(|p| *p == BACKGROUND));
    }
}
