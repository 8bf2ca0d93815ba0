// Copyright 2025 HEM Sp. z o.o.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Where the player's on-screen controls are, per viewport width.
//!
//! The table holds measured positions for a few reference widths. A live viewport uses the
//! nearest reference and scales both axes by `live / reference`.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

pub const FALLBACK_VIEWPORT_WIDTH: u32 = 1920;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Point {
    pub x: i64,
    pub y: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionCoordinates {
    pub play: Point,
    pub fullscreen: Point,
}

/// Reference viewport width to control positions.
pub type CoordinateTable = BTreeMap<u32, ActionCoordinates>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClickAction {
    /// The play/pause toggle.
    Play,
    Fullscreen,
}

impl fmt::Display for ClickAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ClickAction::Play => "play",
            ClickAction::Fullscreen => "fullscreen",
        })
    }
}

impl ActionCoordinates {
    pub fn get(&self, action: ClickAction) -> Point {
        match action {
            ClickAction::Play => self.play,
            ClickAction::Fullscreen => self.fullscreen,
        }
    }
}

pub fn default_table() -> CoordinateTable {
    let entry = |play: (i64, i64), fullscreen: (i64, i64)| ActionCoordinates {
        play: Point { x: play.0, y: play.1 },
        fullscreen: Point { x: fullscreen.0, y: fullscreen.1 },
    };
    BTreeMap::from([
        (1280, entry((63, 681), (1136, 678))),
        (1920, entry((87, 1032), (1771, 1032))),
        (3840, entry((114, 2124), (3643, 2122))),
    ])
}

/// Position of `action` for a viewport `live_width` pixels wide. `None` for an empty table.
///
/// Equally near references resolve to the smaller width.
pub fn resolve(table: &CoordinateTable, action: ClickAction, live_width: u32) -> Option<Point> {
    let live_width = if live_width == 0 { FALLBACK_VIEWPORT_WIDTH } else { live_width };
    let (reference, coordinates) = table
        .iter()
        .filter(|(width, _)| **width > 0)
        .min_by_key(|(width, _)| width.abs_diff(live_width))?;

    let scale = f64::from(live_width) / f64::from(*reference);
    let point = coordinates.get(action);
    Some(Point {
        x: (point.x as f64 * scale).round() as i64,
        y: (point.y as f64 * scale).round() as i64,
    })
}
