use serde::{Deserialize, Serialize};

/// Axis-aligned region in frame pixel coordinates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Region {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

/// One detected region.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Detection {
    pub region: Region,
    /// 0..=1
    pub confidence: f32,
}
