//! Codec for the stable `.osu` text format (v14).
//!
//! Only the sections the editor document carries are handled:
//! `[General]`, `[Metadata]`, `[Difficulty]`, `[TimingPoints]` and
//! `[HitObjects]`. Everything else is skipped on parse and omitted on
//! serialize.

use std::fmt::Write as _;

use crate::beatmap::{
    new_object_id, Beatmap, CurveType, HitObject, HitObjectKind, TimingPoint, Vec2,
};

const HEADER: &str = "osu file format v14";

const TYPE_CIRCLE: u32 = 1;
const TYPE_SLIDER: u32 = 1 << 1;
const TYPE_NEW_COMBO: u32 = 1 << 2;
const TYPE_SPINNER: u32 = 1 << 3;
const COMBO_OFFSET_SHIFT: u32 = 4;
const COMBO_OFFSET_MASK: u32 = 0b111;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParseError {
    #[error("line {line}: {message}")]
    Invalid { line: usize, message: String },
    #[error("unsupported game mode {0}")]
    UnsupportedMode(i64),
}

impl ParseError {
    fn invalid(line: usize, message: impl Into<String>) -> Self {
        ParseError::Invalid {
            line,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    None,
    General,
    Metadata,
    Difficulty,
    TimingPoints,
    HitObjects,
    Other,
}

impl Section {
    fn from_header(name: &str) -> Self {
        match name {
            "General" => Section::General,
            "Metadata" => Section::Metadata,
            "Difficulty" => Section::Difficulty,
            "TimingPoints" => Section::TimingPoints,
            "HitObjects" => Section::HitObjects,
            _ => Section::Other,
        }
    }
}

/// Parse `.osu` text into a [`Beatmap`]. Object ids are freshly generated.
pub fn parse(text: &str) -> Result<Beatmap, ParseError> {
    let mut beatmap = Beatmap::default();
    let mut section = Section::None;

    for (index, raw) in text.lines().enumerate() {
        let line_no = index + 1;
        let line = raw.trim_start_matches('\u{feff}').trim();
        if line.is_empty() || line.starts_with("//") || line.starts_with("osu file format") {
            continue;
        }

        if line.starts_with('[') && line.ends_with(']') {
            section = Section::from_header(&line[1..line.len() - 1]);
            continue;
        }

        match section {
            Section::General => parse_general(&mut beatmap, line, line_no)?,
            Section::Metadata => parse_metadata(&mut beatmap, line, line_no)?,
            Section::Difficulty => parse_difficulty(&mut beatmap, line, line_no)?,
            Section::TimingPoints => beatmap.timing_points.push(parse_timing_point(line, line_no)?),
            Section::HitObjects => beatmap.hit_objects.push(parse_hit_object(line, line_no)?),
            Section::None | Section::Other => {}
        }
    }

    beatmap.sort();
    log::debug!(
        "Parsed beatmap with {} hit objects and {} timing points",
        beatmap.hit_objects.len(),
        beatmap.timing_points.len()
    );
    Ok(beatmap)
}

fn key_value(line: &str, line_no: usize) -> Result<(&str, &str), ParseError> {
    line.split_once(':')
        .map(|(k, v)| (k.trim(), v.trim()))
        .ok_or_else(|| ParseError::invalid(line_no, format!("expected `key: value`, got `{line}`")))
}

fn number<T: std::str::FromStr>(value: &str, line_no: usize, what: &str) -> Result<T, ParseError> {
    value
        .trim()
        .parse()
        .map_err(|_| ParseError::invalid(line_no, format!("invalid {what} `{value}`")))
}

fn parse_general(beatmap: &mut Beatmap, line: &str, line_no: usize) -> Result<(), ParseError> {
    let (key, value) = key_value(line, line_no)?;
    let general = &mut beatmap.general;
    match key {
        "AudioFilename" => general.audio_filename = value.to_string(),
        "AudioLeadIn" => general.audio_lead_in = number(value, line_no, key)?,
        "PreviewTime" => general.preview_time = number(value, line_no, key)?,
        "StackLeniency" => general.stack_leniency = number(value, line_no, key)?,
        "Mode" => {
            let mode: i64 = number(value, line_no, key)?;
            if mode != 0 {
                return Err(ParseError::UnsupportedMode(mode));
            }
        }
        _ => {}
    }
    Ok(())
}

fn parse_metadata(beatmap: &mut Beatmap, line: &str, line_no: usize) -> Result<(), ParseError> {
    let (key, value) = key_value(line, line_no)?;
    let metadata = &mut beatmap.metadata;
    match key {
        "Title" => metadata.title = value.to_string(),
        "TitleUnicode" => metadata.title_unicode = value.to_string(),
        "Artist" => metadata.artist = value.to_string(),
        "ArtistUnicode" => metadata.artist_unicode = value.to_string(),
        "Creator" => metadata.creator = value.to_string(),
        "Version" => metadata.version = value.to_string(),
        "Source" => metadata.source = value.to_string(),
        "Tags" => metadata.tags = value.to_string(),
        "BeatmapID" => metadata.beatmap_id = number(value, line_no, key)?,
        "BeatmapSetID" => metadata.beatmap_set_id = number(value, line_no, key)?,
        _ => {}
    }
    Ok(())
}

fn parse_difficulty(beatmap: &mut Beatmap, line: &str, line_no: usize) -> Result<(), ParseError> {
    let (key, value) = key_value(line, line_no)?;
    let difficulty = &mut beatmap.difficulty;
    match key {
        "HPDrainRate" => difficulty.hp_drain_rate = number(value, line_no, key)?,
        "CircleSize" => difficulty.circle_size = number(value, line_no, key)?,
        "OverallDifficulty" => difficulty.overall_difficulty = number(value, line_no, key)?,
        "ApproachRate" => difficulty.approach_rate = number(value, line_no, key)?,
        "SliderMultiplier" => difficulty.slider_multiplier = number(value, line_no, key)?,
        "SliderTickRate" => difficulty.slider_tick_rate = number(value, line_no, key)?,
        _ => {}
    }
    Ok(())
}

fn parse_timing_point(line: &str, line_no: usize) -> Result<TimingPoint, ParseError> {
    let fields: Vec<&str> = line.split(',').collect();
    if fields.len() < 2 {
        return Err(ParseError::invalid(line_no, "timing point needs at least time and beat length"));
    }

    let field = |index: usize, default: &'static str| fields.get(index).copied().unwrap_or(default);
    let effects: u32 = number(field(7, "0"), line_no, "effects")?;
    let uninherited: u8 = number(field(6, "1"), line_no, "uninherited flag")?;

    Ok(TimingPoint {
        id: new_object_id(),
        time: number(fields[0], line_no, "time")?,
        beat_length: number(fields[1], line_no, "beat length")?,
        meter: number(field(2, "4"), line_no, "meter")?,
        sample_set: number(field(3, "0"), line_no, "sample set")?,
        sample_index: number(field(4, "0"), line_no, "sample index")?,
        volume: number(field(5, "100"), line_no, "volume")?,
        uninherited: uninherited != 0,
        kiai: effects & 1 != 0,
    })
}

fn parse_point(value: &str, line_no: usize) -> Result<Vec2, ParseError> {
    let (x, y) = value
        .split_once(':')
        .ok_or_else(|| ParseError::invalid(line_no, format!("invalid curve point `{value}`")))?;
    Ok(Vec2::new(number(x, line_no, "x")?, number(y, line_no, "y")?))
}

fn parse_hit_object(line: &str, line_no: usize) -> Result<HitObject, ParseError> {
    let fields: Vec<&str> = line.split(',').collect();
    if fields.len() < 5 {
        return Err(ParseError::invalid(line_no, "hit object needs at least 5 fields"));
    }

    let position = Vec2::new(number(fields[0], line_no, "x")?, number(fields[1], line_no, "y")?);
    let start_time: f64 = number(fields[2], line_no, "time")?;
    let type_bits: u32 = number(fields[3], line_no, "type")?;
    let hit_sound: u8 = number(fields[4], line_no, "hit sound")?;

    let kind = if type_bits & TYPE_SLIDER != 0 {
        let params = fields
            .get(5)
            .ok_or_else(|| ParseError::invalid(line_no, "slider without curve"))?;
        let mut parts = params.split('|');
        let curve_type = parts
            .next()
            .and_then(CurveType::from_code)
            .ok_or_else(|| ParseError::invalid(line_no, format!("invalid curve `{params}`")))?;
        let control_points = parts
            .map(|p| parse_point(p, line_no))
            .collect::<Result<Vec<_>, _>>()?;
        HitObjectKind::Slider {
            curve_type,
            control_points,
            repeats: number(fields.get(6).copied().unwrap_or("1"), line_no, "slides")?,
            expected_distance: number(fields.get(7).copied().unwrap_or("0"), line_no, "length")?,
        }
    } else if type_bits & TYPE_SPINNER != 0 {
        let end_time = fields
            .get(5)
            .ok_or_else(|| ParseError::invalid(line_no, "spinner without end time"))?;
        HitObjectKind::Spinner {
            end_time: number(end_time, line_no, "end time")?,
        }
    } else if type_bits & TYPE_CIRCLE != 0 {
        HitObjectKind::Circle
    } else {
        return Err(ParseError::invalid(line_no, format!("unsupported hit object type {type_bits}")));
    };

    Ok(HitObject {
        id: new_object_id(),
        start_time,
        position,
        new_combo: type_bits & TYPE_NEW_COMBO != 0,
        combo_offset: (type_bits >> COMBO_OFFSET_SHIFT) & COMBO_OFFSET_MASK,
        hit_sound,
        kind,
    })
}

/// Serialize a [`Beatmap`] to `.osu` text.
pub fn serialize(beatmap: &Beatmap) -> String {
    let mut out = String::new();
    // Writing into a String cannot fail.
    let _ = write_beatmap(&mut out, beatmap);
    out
}

fn write_beatmap(out: &mut String, beatmap: &Beatmap) -> std::fmt::Result {
    writeln!(out, "{HEADER}")?;
    writeln!(out)?;

    let general = &beatmap.general;
    writeln!(out, "[General]")?;
    writeln!(out, "AudioFilename: {}", general.audio_filename)?;
    writeln!(out, "AudioLeadIn: {}", general.audio_lead_in)?;
    writeln!(out, "PreviewTime: {}", general.preview_time)?;
    writeln!(out, "StackLeniency: {}", general.stack_leniency)?;
    writeln!(out, "Mode: 0")?;
    writeln!(out)?;

    let metadata = &beatmap.metadata;
    writeln!(out, "[Metadata]")?;
    writeln!(out, "Title:{}", metadata.title)?;
    writeln!(out, "TitleUnicode:{}", metadata.title_unicode)?;
    writeln!(out, "Artist:{}", metadata.artist)?;
    writeln!(out, "ArtistUnicode:{}", metadata.artist_unicode)?;
    writeln!(out, "Creator:{}", metadata.creator)?;
    writeln!(out, "Version:{}", metadata.version)?;
    writeln!(out, "Source:{}", metadata.source)?;
    writeln!(out, "Tags:{}", metadata.tags)?;
    writeln!(out, "BeatmapID:{}", metadata.beatmap_id)?;
    writeln!(out, "BeatmapSetID:{}", metadata.beatmap_set_id)?;
    writeln!(out)?;

    let difficulty = &beatmap.difficulty;
    writeln!(out, "[Difficulty]")?;
    writeln!(out, "HPDrainRate:{}", difficulty.hp_drain_rate)?;
    writeln!(out, "CircleSize:{}", difficulty.circle_size)?;
    writeln!(out, "OverallDifficulty:{}", difficulty.overall_difficulty)?;
    writeln!(out, "ApproachRate:{}", difficulty.approach_rate)?;
    writeln!(out, "SliderMultiplier:{}", difficulty.slider_multiplier)?;
    writeln!(out, "SliderTickRate:{}", difficulty.slider_tick_rate)?;
    writeln!(out)?;

    writeln!(out, "[TimingPoints]")?;
    for point in &beatmap.timing_points {
        writeln!(
            out,
            "{},{},{},{},{},{},{},{}",
            point.time,
            point.beat_length,
            point.meter,
            point.sample_set,
            point.sample_index,
            point.volume,
            u8::from(point.uninherited),
            u8::from(point.kiai),
        )?;
    }
    writeln!(out)?;

    writeln!(out, "[HitObjects]")?;
    for object in &beatmap.hit_objects {
        write_hit_object(out, object)?;
    }
    Ok(())
}

fn write_hit_object(out: &mut String, object: &HitObject) -> std::fmt::Result {
    let mut type_bits = match object.kind {
        HitObjectKind::Circle => TYPE_CIRCLE,
        HitObjectKind::Slider { .. } => TYPE_SLIDER,
        HitObjectKind::Spinner { .. } => TYPE_SPINNER,
    };
    if object.new_combo {
        type_bits |= TYPE_NEW_COMBO;
    }
    type_bits |= (object.combo_offset & COMBO_OFFSET_MASK) << COMBO_OFFSET_SHIFT;

    write!(
        out,
        "{},{},{},{},{}",
        object.position.x, object.position.y, object.start_time, type_bits, object.hit_sound
    )?;

    match &object.kind {
        HitObjectKind::Circle => writeln!(out, ",0:0:0:0:"),
        HitObjectKind::Slider {
            curve_type,
            control_points,
            repeats,
            expected_distance,
        } => {
            write!(out, ",{}", curve_type.code())?;
            for point in control_points {
                write!(out, "|{}:{}", point.x, point.y)?;
            }
            writeln!(out, ",{repeats},{expected_distance}")
        }
        HitObjectKind::Spinner { end_time } => writeln!(out, ",{end_time},0:0:0:0:"),
    }
}
