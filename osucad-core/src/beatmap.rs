//! Beatmap entities: hit objects, timing points, metadata and difficulty.

use serde::{Deserialize, Serialize};
use std::ops::{Add, Sub};
use uuid::Uuid;

/// Generate a fresh object id for a hit object or timing point.
pub fn new_object_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// 2D position in osu! pixels (playfield is 512x384).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec2 {
    pub x: f64,
    pub y: f64,
}

impl Vec2 {
    pub const ZERO: Vec2 = Vec2 { x: 0.0, y: 0.0 };

    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn length(&self) -> f64 {
        (self.x * self.x + self.y * self.y).sqrt()
    }

    /// Round both components to `digits` decimal places.
    pub fn rounded(&self, digits: i32) -> Self {
        let factor = 10f64.powi(digits);
        Self {
            x: (self.x * factor).round() / factor,
            y: (self.y * factor).round() / factor,
        }
    }
}

impl Add for Vec2 {
    type Output = Vec2;

    fn add(self, rhs: Vec2) -> Vec2 {
        Vec2::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl Sub for Vec2 {
    type Output = Vec2;

    fn sub(self, rhs: Vec2) -> Vec2 {
        Vec2::new(self.x - rhs.x, self.y - rhs.y)
    }
}

/// Slider path type, encoded as a single letter in `.osu` files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CurveType {
    Bezier,
    Catmull,
    Linear,
    PerfectCurve,
}

impl CurveType {
    pub fn code(&self) -> char {
        match self {
            CurveType::Bezier => 'B',
            CurveType::Catmull => 'C',
            CurveType::Linear => 'L',
            CurveType::PerfectCurve => 'P',
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "B" => Some(CurveType::Bezier),
            "C" => Some(CurveType::Catmull),
            "L" => Some(CurveType::Linear),
            "P" => Some(CurveType::PerfectCurve),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HitObjectKind {
    Circle,
    Slider {
        curve_type: CurveType,
        /// Control points relative to the playfield, excluding the head.
        control_points: Vec<Vec2>,
        repeats: u32,
        expected_distance: f64,
    },
    Spinner {
        end_time: f64,
    },
}

impl HitObjectKind {
    pub fn name(&self) -> &'static str {
        match self {
            HitObjectKind::Circle => "circle",
            HitObjectKind::Slider { .. } => "slider",
            HitObjectKind::Spinner { .. } => "spinner",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HitObject {
    pub id: String,
    pub start_time: f64,
    pub position: Vec2,
    pub new_combo: bool,
    pub combo_offset: u32,
    pub hit_sound: u8,
    pub kind: HitObjectKind,
}

impl HitObject {
    pub fn circle(start_time: f64, position: Vec2) -> Self {
        Self {
            id: new_object_id(),
            start_time,
            position,
            new_combo: false,
            combo_offset: 0,
            hit_sound: 0,
            kind: HitObjectKind::Circle,
        }
    }

    pub fn end_time(&self) -> f64 {
        match &self.kind {
            HitObjectKind::Spinner { end_time } => *end_time,
            _ => self.start_time,
        }
    }
}

/// A timing point. Uninherited points carry a beat length in milliseconds,
/// inherited points a negative slider velocity multiplier (`-100 / sv`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingPoint {
    pub id: String,
    pub time: f64,
    pub beat_length: f64,
    pub meter: u32,
    pub sample_set: u8,
    pub sample_index: u32,
    pub volume: u32,
    pub uninherited: bool,
    pub kiai: bool,
}

impl TimingPoint {
    pub fn timing(time: f64, beat_length: f64) -> Self {
        Self {
            id: new_object_id(),
            time,
            beat_length,
            meter: 4,
            sample_set: 0,
            sample_index: 0,
            volume: 100,
            uninherited: true,
            kiai: false,
        }
    }

    pub fn bpm(&self) -> Option<f64> {
        (self.uninherited && self.beat_length > 0.0).then(|| 60_000.0 / self.beat_length)
    }

    pub fn slider_velocity(&self) -> f64 {
        if self.uninherited || self.beat_length >= 0.0 {
            1.0
        } else {
            -100.0 / self.beat_length
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeatmapGeneral {
    pub audio_filename: String,
    pub audio_lead_in: i64,
    pub preview_time: i64,
    pub stack_leniency: f64,
}

impl Default for BeatmapGeneral {
    fn default() -> Self {
        Self {
            audio_filename: String::new(),
            audio_lead_in: 0,
            preview_time: -1,
            stack_leniency: 0.7,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BeatmapMetadata {
    pub title: String,
    pub title_unicode: String,
    pub artist: String,
    pub artist_unicode: String,
    pub creator: String,
    pub version: String,
    pub source: String,
    pub tags: String,
    pub beatmap_id: i64,
    pub beatmap_set_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeatmapDifficulty {
    pub hp_drain_rate: f64,
    pub circle_size: f64,
    pub overall_difficulty: f64,
    pub approach_rate: f64,
    pub slider_multiplier: f64,
    pub slider_tick_rate: f64,
}

impl Default for BeatmapDifficulty {
    fn default() -> Self {
        Self {
            hp_drain_rate: 5.0,
            circle_size: 4.0,
            overall_difficulty: 5.0,
            approach_rate: 5.0,
            slider_multiplier: 1.4,
            slider_tick_rate: 1.0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Beatmap {
    pub general: BeatmapGeneral,
    pub metadata: BeatmapMetadata,
    pub difficulty: BeatmapDifficulty,
    pub timing_points: Vec<TimingPoint>,
    pub hit_objects: Vec<HitObject>,
}

impl Beatmap {
    /// Sort hit objects by start time and timing points by time.
    /// Ties keep their relative order.
    pub fn sort(&mut self) {
        self.hit_objects
            .sort_by(|a, b| a.start_time.total_cmp(&b.start_time));
        self.timing_points.sort_by(|a, b| a.time.total_cmp(&b.time));
    }

    /// The uninherited timing point in effect at `time`.
    pub fn timing_point_at(&self, time: f64) -> Option<&TimingPoint> {
        let mut current = None;
        for point in self.timing_points.iter().filter(|p| p.uninherited) {
            if point.time > time && current.is_some() {
                break;
            }
            current = Some(point);
        }
        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vec2_rounding() {
        let v = Vec2::new(100.12345, -0.0004);
        let r = v.rounded(3);
        assert_eq!(r.x, 100.123);
        assert_eq!(r.y, -0.0);
    }

    #[test]
    fn test_vec2_arithmetic() {
        let a = Vec2::new(100.0, 200.0);
        let b = Vec2::new(10.0, 10.0);
        assert_eq!(a + b, Vec2::new(110.0, 210.0));
        assert_eq!((a + b) - b, a);
    }

    #[test]
    fn test_timing_point_bpm_and_velocity() {
        let red = TimingPoint::timing(0.0, 500.0);
        assert_eq!(red.bpm(), Some(120.0));
        assert_eq!(red.slider_velocity(), 1.0);

        let green = TimingPoint {
            uninherited: false,
            beat_length: -50.0,
            ..TimingPoint::timing(1000.0, 0.0)
        };
        assert_eq!(green.bpm(), None);
        assert_eq!(green.slider_velocity(), 2.0);
    }

    #[test]
    fn test_timing_point_at() {
        let mut beatmap = Beatmap::default();
        beatmap.timing_points.push(TimingPoint::timing(0.0, 500.0));
        beatmap.timing_points.push(TimingPoint::timing(10_000.0, 400.0));
        beatmap.sort();

        assert_eq!(beatmap.timing_point_at(5_000.0).map(|p| p.beat_length), Some(500.0));
        assert_eq!(beatmap.timing_point_at(12_000.0).map(|p| p.beat_length), Some(400.0));
        assert_eq!(beatmap.timing_point_at(-100.0).map(|p| p.beat_length), Some(500.0));
    }

    #[test]
    fn test_object_ids_unique() {
        let a = HitObject::circle(0.0, Vec2::ZERO);
        let b = HitObject::circle(0.0, Vec2::ZERO);
        assert_ne!(a.id, b.id);
        assert_eq!(a.id.len(), 32);
    }
}
