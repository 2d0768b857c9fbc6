//! Beatmap document schema on top of the runtime.
//!
//! ```text
//! root            map         { formatVersion }
//! general         map         audio file, lead-in, preview time, ...
//! metadata        map         title, artist, creator, version, ...
//! difficulty      map         HP, CS, OD, AR, slider multiplier, tick rate
//! hitObjects      sortedList  children: hitObject maps, by startTime
//! controlPoints   sortedList  children: controlPoint maps, by time
//! ```
//!
//! [`initialize`] turns a parsed [`Beatmap`] into a fresh document and
//! [`export`] reads one back, so `.osu` files only matter at creation and
//! export time.

use std::collections::BTreeMap;

use osucad_core::{
    Beatmap, BeatmapDifficulty, BeatmapGeneral, BeatmapMetadata, CurveType, HitObject,
    HitObjectKind, TimingPoint, Vec2,
};
use uuid::Uuid;

use crate::object::registry::TypeRegistry;
use crate::object::{MutationPayload, ObjectId, ObjectSnapshot, SharedMap, SharedSortedList};
use crate::op::DocumentId;
use crate::runtime::{DocumentRuntime, RuntimeConfig, RuntimeError};
use crate::summary::SummaryTree;
use crate::value::Value;

pub const ROOT: &str = "root";
pub const GENERAL: &str = "general";
pub const METADATA: &str = "metadata";
pub const DIFFICULTY: &str = "difficulty";
pub const HIT_OBJECTS: &str = "hitObjects";
pub const CONTROL_POINTS: &str = "controlPoints";

pub const ROOT_TYPE: &str = "beatmap";
pub const GENERAL_TYPE: &str = "general";
pub const METADATA_TYPE: &str = "metadata";
pub const DIFFICULTY_TYPE: &str = "difficulty";
pub const HIT_OBJECT_LIST_TYPE: &str = "hitObjects";
pub const CONTROL_POINT_LIST_TYPE: &str = "controlPoints";
pub const HIT_OBJECT_TYPE: &str = "hitObject";
pub const CONTROL_POINT_TYPE: &str = "controlPoint";

pub const FORMAT_VERSION: i64 = 1;

#[derive(Debug, thiserror::Error)]
pub enum BeatmapError {
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error("document has no {0} object")]
    MissingObject(String),
    #[error("{object}: missing or invalid field `{field}`")]
    InvalidField { object: ObjectId, field: &'static str },
}

/// Registry with every type a beatmap document uses, plus the generic
/// builtin types.
pub fn registry() -> TypeRegistry {
    TypeRegistry::with_builtin_types()
        .with(ROOT_TYPE, |id| {
            Box::new(SharedMap::new(id, ROOT_TYPE).with_initializer(|| {
                BTreeMap::from([("formatVersion".to_string(), Value::Int(FORMAT_VERSION))])
            }))
        })
        .with(GENERAL_TYPE, |id| {
            Box::new(
                SharedMap::new(id, GENERAL_TYPE)
                    .with_initializer(|| general_entries(&BeatmapGeneral::default())),
            )
        })
        .with(METADATA_TYPE, |id| {
            Box::new(
                SharedMap::new(id, METADATA_TYPE)
                    .with_initializer(|| metadata_entries(&BeatmapMetadata::default())),
            )
        })
        .with(DIFFICULTY_TYPE, |id| {
            Box::new(
                SharedMap::new(id, DIFFICULTY_TYPE)
                    .with_initializer(|| difficulty_entries(&BeatmapDifficulty::default())),
            )
        })
        .with(HIT_OBJECT_LIST_TYPE, |id| {
            Box::new(SharedSortedList::new(id, HIT_OBJECT_LIST_TYPE, "startTime"))
        })
        .with(CONTROL_POINT_LIST_TYPE, |id| {
            Box::new(SharedSortedList::new(id, CONTROL_POINT_LIST_TYPE, "time"))
        })
        .with(HIT_OBJECT_TYPE, |id| Box::new(SharedMap::new(id, HIT_OBJECT_TYPE)))
        .with(CONTROL_POINT_TYPE, |id| {
            Box::new(SharedMap::new(id, CONTROL_POINT_TYPE))
        })
}

/// Build the objects of a new document from `beatmap`. The runtime must be
/// detached and empty.
pub fn initialize(runtime: &mut DocumentRuntime, beatmap: &Beatmap) -> Result<(), BeatmapError> {
    let root = ObjectId::new(ROOT);
    runtime.create_object(root, ROOT_TYPE)?;
    for (id, type_name) in [
        (GENERAL, GENERAL_TYPE),
        (METADATA, METADATA_TYPE),
        (DIFFICULTY, DIFFICULTY_TYPE),
        (HIT_OBJECTS, HIT_OBJECT_LIST_TYPE),
        (CONTROL_POINTS, CONTROL_POINT_LIST_TYPE),
    ] {
        runtime.create_object(ObjectId::new(id), type_name)?;
    }

    runtime.seed(
        &ObjectId::new(GENERAL),
        MutationPayload::MapReplace {
            entries: general_entries(&beatmap.general),
        },
    )?;
    runtime.seed(
        &ObjectId::new(METADATA),
        MutationPayload::MapReplace {
            entries: metadata_entries(&beatmap.metadata),
        },
    )?;
    runtime.seed(
        &ObjectId::new(DIFFICULTY),
        MutationPayload::MapReplace {
            entries: difficulty_entries(&beatmap.difficulty),
        },
    )?;

    let hit_objects = ObjectId::new(HIT_OBJECTS);
    for hit_object in &beatmap.hit_objects {
        runtime.seed(
            &hit_objects,
            MutationPayload::ListInsert {
                item: hit_object_snapshot(hit_object),
            },
        )?;
    }
    let control_points = ObjectId::new(CONTROL_POINTS);
    for point in &beatmap.timing_points {
        runtime.seed(
            &control_points,
            MutationPayload::ListInsert {
                item: timing_point_snapshot(point),
            },
        )?;
    }
    Ok(())
}

/// Summary of a brand new document holding `beatmap`, ready for
/// `StorageBackend::create_document`.
pub fn new_document(document_id: DocumentId, beatmap: &Beatmap) -> Result<SummaryTree, BeatmapError> {
    let mut runtime = DocumentRuntime::new(
        document_id,
        Uuid::nil(),
        registry(),
        RuntimeConfig::default(),
    );
    initialize(&mut runtime, beatmap)?;
    Ok(runtime.summarize()?)
}

/// Read the current document state back into a [`Beatmap`].
pub fn export(runtime: &DocumentRuntime) -> Result<Beatmap, BeatmapError> {
    let general = map_entries(runtime, GENERAL)?;
    let metadata = map_entries(runtime, METADATA)?;
    let difficulty = map_entries(runtime, DIFFICULTY)?;

    let hit_objects = hit_object_ids(runtime)
        .iter()
        .map(|id| {
            let entries = runtime
                .map(id)
                .ok_or_else(|| BeatmapError::MissingObject(id.to_string()))?
                .entries();
            hit_object_from_entries(id, entries)
        })
        .collect::<Result<Vec<_>, _>>()?;

    let timing_points = control_point_ids(runtime)
        .iter()
        .map(|id| {
            let entries = runtime
                .map(id)
                .ok_or_else(|| BeatmapError::MissingObject(id.to_string()))?
                .entries();
            timing_point_from_entries(id, entries)
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Beatmap {
        general: BeatmapGeneral {
            audio_filename: string(&general, "audioFilename"),
            audio_lead_in: int(&general, "audioLeadIn", 0),
            preview_time: int(&general, "previewTime", -1),
            stack_leniency: float(&general, "stackLeniency", 0.7),
        },
        metadata: BeatmapMetadata {
            title: string(&metadata, "title"),
            title_unicode: string(&metadata, "titleUnicode"),
            artist: string(&metadata, "artist"),
            artist_unicode: string(&metadata, "artistUnicode"),
            creator: string(&metadata, "creator"),
            version: string(&metadata, "version"),
            source: string(&metadata, "source"),
            tags: string(&metadata, "tags"),
            beatmap_id: int(&metadata, "beatmapId", 0),
            beatmap_set_id: int(&metadata, "beatmapSetId", 0),
        },
        difficulty: BeatmapDifficulty {
            hp_drain_rate: float(&difficulty, "hpDrainRate", 5.0),
            circle_size: float(&difficulty, "circleSize", 4.0),
            overall_difficulty: float(&difficulty, "overallDifficulty", 5.0),
            approach_rate: float(&difficulty, "approachRate", 5.0),
            slider_multiplier: float(&difficulty, "sliderMultiplier", 1.4),
            slider_tick_rate: float(&difficulty, "sliderTickRate", 1.0),
        },
        timing_points,
        hit_objects,
    })
}

// ─── Editing helpers ──────────────────────────────────────────────────

pub fn add_hit_object(runtime: &mut DocumentRuntime, hit_object: &HitObject) -> Result<ObjectId, RuntimeError> {
    runtime.insert_item(&ObjectId::new(HIT_OBJECTS), hit_object_snapshot(hit_object))
}

pub fn remove_hit_object(runtime: &mut DocumentRuntime, id: &ObjectId) -> Result<(), RuntimeError> {
    runtime.remove_item(&ObjectId::new(HIT_OBJECTS), id)
}

pub fn move_hit_object(runtime: &mut DocumentRuntime, id: &ObjectId, position: Vec2) -> Result<(), RuntimeError> {
    runtime.set(id, "position", position)
}

pub fn set_start_time(runtime: &mut DocumentRuntime, id: &ObjectId, start_time: f64) -> Result<(), RuntimeError> {
    runtime.set(id, "startTime", start_time)
}

pub fn add_timing_point(runtime: &mut DocumentRuntime, point: &TimingPoint) -> Result<ObjectId, RuntimeError> {
    runtime.insert_item(&ObjectId::new(CONTROL_POINTS), timing_point_snapshot(point))
}

pub fn remove_timing_point(runtime: &mut DocumentRuntime, id: &ObjectId) -> Result<(), RuntimeError> {
    runtime.remove_item(&ObjectId::new(CONTROL_POINTS), id)
}

/// Set one `[Metadata]` field, such as `title` or `creator`.
pub fn set_metadata(runtime: &mut DocumentRuntime, key: &str, value: impl Into<Value>) -> Result<(), RuntimeError> {
    runtime.set(&ObjectId::new(METADATA), key, value)
}

/// Hit object ids in time order.
pub fn hit_object_ids(runtime: &DocumentRuntime) -> Vec<ObjectId> {
    list_ids(runtime, HIT_OBJECTS)
}

/// Control point ids in time order.
pub fn control_point_ids(runtime: &DocumentRuntime) -> Vec<ObjectId> {
    list_ids(runtime, CONTROL_POINTS)
}

pub fn hit_object_position(runtime: &DocumentRuntime, id: &ObjectId) -> Option<Vec2> {
    runtime.map(id)?.get("position")?.as_vec2()
}

fn list_ids(runtime: &DocumentRuntime, list: &str) -> Vec<ObjectId> {
    runtime
        .sorted_list(&ObjectId::new(list))
        .map(|l| l.ids().cloned().collect())
        .unwrap_or_default()
}

fn map_entries(runtime: &DocumentRuntime, id: &str) -> Result<BTreeMap<String, Value>, BeatmapError> {
    runtime
        .map(&ObjectId::new(id))
        .map(|m| m.entries().clone())
        .ok_or_else(|| BeatmapError::MissingObject(id.to_string()))
}

// ─── Entity ↔ entries ─────────────────────────────────────────────────

fn entries<const N: usize>(pairs: [(&str, Value); N]) -> BTreeMap<String, Value> {
    pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}

fn general_entries(general: &BeatmapGeneral) -> BTreeMap<String, Value> {
    entries([
        ("audioFilename", general.audio_filename.clone().into()),
        ("audioLeadIn", general.audio_lead_in.into()),
        ("previewTime", general.preview_time.into()),
        ("stackLeniency", general.stack_leniency.into()),
    ])
}

fn metadata_entries(metadata: &BeatmapMetadata) -> BTreeMap<String, Value> {
    entries([
        ("title", metadata.title.clone().into()),
        ("titleUnicode", metadata.title_unicode.clone().into()),
        ("artist", metadata.artist.clone().into()),
        ("artistUnicode", metadata.artist_unicode.clone().into()),
        ("creator", metadata.creator.clone().into()),
        ("version", metadata.version.clone().into()),
        ("source", metadata.source.clone().into()),
        ("tags", metadata.tags.clone().into()),
        ("beatmapId", metadata.beatmap_id.into()),
        ("beatmapSetId", metadata.beatmap_set_id.into()),
    ])
}

fn difficulty_entries(difficulty: &BeatmapDifficulty) -> BTreeMap<String, Value> {
    entries([
        ("hpDrainRate", difficulty.hp_drain_rate.into()),
        ("circleSize", difficulty.circle_size.into()),
        ("overallDifficulty", difficulty.overall_difficulty.into()),
        ("approachRate", difficulty.approach_rate.into()),
        ("sliderMultiplier", difficulty.slider_multiplier.into()),
        ("sliderTickRate", difficulty.slider_tick_rate.into()),
    ])
}

pub fn hit_object_snapshot(hit_object: &HitObject) -> ObjectSnapshot {
    let mut map = entries([
        ("startTime", hit_object.start_time.into()),
        ("position", hit_object.position.into()),
        ("newCombo", hit_object.new_combo.into()),
        ("comboOffset", hit_object.combo_offset.into()),
        ("hitSound", Value::Int(i64::from(hit_object.hit_sound))),
        ("type", hit_object.kind.name().into()),
    ]);
    match &hit_object.kind {
        HitObjectKind::Circle => {}
        HitObjectKind::Slider {
            curve_type,
            control_points,
            repeats,
            expected_distance,
        } => {
            map.insert("curveType".into(), curve_type.code().to_string().into());
            map.insert(
                "controlPoints".into(),
                Value::List(control_points.iter().map(|p| Value::Vec2(*p)).collect()),
            );
            map.insert("repeats".into(), (*repeats).into());
            map.insert("expectedDistance".into(), (*expected_distance).into());
        }
        HitObjectKind::Spinner { end_time } => {
            map.insert("endTime".into(), (*end_time).into());
        }
    }
    ObjectSnapshot::map(ObjectId::new(hit_object.id.clone()), HIT_OBJECT_TYPE, map).normalized()
}

pub fn timing_point_snapshot(point: &TimingPoint) -> ObjectSnapshot {
    let map = entries([
        ("time", point.time.into()),
        ("beatLength", point.beat_length.into()),
        ("meter", point.meter.into()),
        ("sampleSet", Value::Int(i64::from(point.sample_set))),
        ("sampleIndex", point.sample_index.into()),
        ("volume", point.volume.into()),
        ("uninherited", point.uninherited.into()),
        ("kiai", point.kiai.into()),
    ]);
    ObjectSnapshot::map(ObjectId::new(point.id.clone()), CONTROL_POINT_TYPE, map).normalized()
}

fn hit_object_from_entries(id: &ObjectId, map: &BTreeMap<String, Value>) -> Result<HitObject, BeatmapError> {
    let invalid = |field| BeatmapError::InvalidField {
        object: id.clone(),
        field,
    };
    let start_time = map.get("startTime").and_then(Value::as_f64).ok_or_else(|| invalid("startTime"))?;
    let kind = match map.get("type").and_then(Value::as_str).unwrap_or("circle") {
        "circle" => HitObjectKind::Circle,
        "slider" => HitObjectKind::Slider {
            curve_type: map
                .get("curveType")
                .and_then(Value::as_str)
                .and_then(CurveType::from_code)
                .ok_or_else(|| invalid("curveType"))?,
            control_points: map
                .get("controlPoints")
                .and_then(Value::as_list)
                .map(|points| points.iter().filter_map(Value::as_vec2).collect())
                .ok_or_else(|| invalid("controlPoints"))?,
            repeats: uint(map, "repeats", 1),
            expected_distance: float(map, "expectedDistance", 0.0),
        },
        "spinner" => HitObjectKind::Spinner {
            end_time: map.get("endTime").and_then(Value::as_f64).ok_or_else(|| invalid("endTime"))?,
        },
        _ => return Err(invalid("type")),
    };
    Ok(HitObject {
        id: id.as_str().to_string(),
        start_time,
        position: map.get("position").and_then(Value::as_vec2).unwrap_or(Vec2::ZERO),
        new_combo: map.get("newCombo").and_then(Value::as_bool).unwrap_or(false),
        combo_offset: uint(map, "comboOffset", 0),
        hit_sound: map
            .get("hitSound")
            .and_then(Value::as_i64)
            .and_then(|v| u8::try_from(v).ok())
            .unwrap_or(0),
        kind,
    })
}

fn timing_point_from_entries(id: &ObjectId, map: &BTreeMap<String, Value>) -> Result<TimingPoint, BeatmapError> {
    let invalid = |field| BeatmapError::InvalidField {
        object: id.clone(),
        field,
    };
    Ok(TimingPoint {
        id: id.as_str().to_string(),
        time: map.get("time").and_then(Value::as_f64).ok_or_else(|| invalid("time"))?,
        beat_length: map
            .get("beatLength")
            .and_then(Value::as_f64)
            .ok_or_else(|| invalid("beatLength"))?,
        meter: uint(map, "meter", 4),
        sample_set: map
            .get("sampleSet")
            .and_then(Value::as_i64)
            .and_then(|v| u8::try_from(v).ok())
            .unwrap_or(0),
        sample_index: uint(map, "sampleIndex", 0),
        volume: uint(map, "volume", 100),
        uninherited: map.get("uninherited").and_then(Value::as_bool).unwrap_or(true),
        kiai: map.get("kiai").and_then(Value::as_bool).unwrap_or(false),
    })
}

fn string(map: &BTreeMap<String, Value>, key: &str) -> String {
    map.get(key).and_then(Value::as_str).unwrap_or_default().to_string()
}

fn int(map: &BTreeMap<String, Value>, key: &str, default: i64) -> i64 {
    map.get(key).and_then(Value::as_i64).unwrap_or(default)
}

fn uint(map: &BTreeMap<String, Value>, key: &str, default: u32) -> u32 {
    map.get(key)
        .and_then(Value::as_i64)
        .and_then(|v| u32::try_from(v).ok())
        .unwrap_or(default)
}

fn float(map: &BTreeMap<String, Value>, key: &str, default: f64) -> f64 {
    map.get(key).and_then(Value::as_f64).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::InitialDocument;

    fn beatmap() -> Beatmap {
        let mut beatmap = Beatmap::default();
        beatmap.metadata.title = "Blue Zenith".into();
        beatmap.metadata.creator = "Asphyxia".into();
        beatmap.timing_points.push(TimingPoint::timing(1_000.0, 300.0));
        beatmap.hit_objects.push(HitObject::circle(2_000.0, Vec2::new(256.0, 192.0)));
        beatmap.hit_objects.push(HitObject {
            id: "slider".into(),
            start_time: 1_500.0,
            position: Vec2::new(100.0, 100.0),
            new_combo: true,
            combo_offset: 0,
            hit_sound: 2,
            kind: HitObjectKind::Slider {
                curve_type: CurveType::Bezier,
                control_points: vec![Vec2::new(150.0, 120.0), Vec2::new(200.0, 100.0)],
                repeats: 2,
                expected_distance: 140.0,
            },
        });
        beatmap.hit_objects.push(HitObject {
            id: "spinner".into(),
            start_time: 3_000.0,
            position: Vec2::new(256.0, 192.0),
            new_combo: true,
            combo_offset: 0,
            hit_sound: 0,
            kind: HitObjectKind::Spinner { end_time: 4_000.0 },
        });
        beatmap
    }

    fn attached(document_id: DocumentId, summary: SummaryTree) -> DocumentRuntime {
        let mut runtime = DocumentRuntime::new(
            document_id,
            Uuid::new_v4(),
            registry(),
            RuntimeConfig::for_testing(),
        );
        runtime.begin_attach().unwrap();
        runtime
            .complete_attach(InitialDocument {
                summary: Some(summary),
                operations: Vec::new(),
            })
            .unwrap();
        runtime
    }

    #[test]
    fn test_new_document_exports_same_beatmap() {
        let id = Uuid::new_v4();
        let source = beatmap();
        let runtime = attached(id, new_document(id, &source).unwrap());

        let mut expected = source.clone();
        expected.sort();
        let exported = export(&runtime).unwrap();
        assert_eq!(exported, expected);
    }

    #[test]
    fn test_hit_objects_are_time_ordered() {
        let id = Uuid::new_v4();
        let mut runtime = attached(id, new_document(id, &beatmap()).unwrap());
        let ids = hit_object_ids(&runtime);
        assert_eq!(ids[0], ObjectId::new("slider"));
        assert_eq!(ids[2], ObjectId::new("spinner"));

        set_start_time(&mut runtime, &ObjectId::new("spinner"), 500.0).unwrap();
        assert_eq!(hit_object_ids(&runtime)[0], ObjectId::new("spinner"));
    }

    #[test]
    fn test_edit_helpers() {
        let id = Uuid::new_v4();
        let mut runtime = attached(id, new_document(id, &Beatmap::default()).unwrap());

        let circle = HitObject::circle(100.0, Vec2::new(10.0, 10.0));
        let circle_id = add_hit_object(&mut runtime, &circle).unwrap();
        move_hit_object(&mut runtime, &circle_id, Vec2::new(20.123456, 30.0)).unwrap();
        assert_eq!(
            hit_object_position(&runtime, &circle_id),
            Some(Vec2::new(20.123, 30.0))
        );

        let point = add_timing_point(&mut runtime, &TimingPoint::timing(0.0, 500.0)).unwrap();
        assert_eq!(control_point_ids(&runtime), vec![point.clone()]);
        set_metadata(&mut runtime, "title", "new title").unwrap();

        let exported = export(&runtime).unwrap();
        assert_eq!(exported.metadata.title, "new title");
        assert_eq!(exported.timing_points[0].bpm(), Some(120.0));

        remove_hit_object(&mut runtime, &circle_id).unwrap();
        remove_timing_point(&mut runtime, &point).unwrap();
        assert!(hit_object_ids(&runtime).is_empty());
        assert!(control_point_ids(&runtime).is_empty());
        assert_eq!(runtime.outbound_len(), 6);
    }

    #[test]
    fn test_defaults_from_initializers() {
        let mut runtime = DocumentRuntime::new(
            Uuid::new_v4(),
            Uuid::nil(),
            registry(),
            RuntimeConfig::for_testing(),
        );
        runtime.create_object(ObjectId::new(ROOT), ROOT_TYPE).unwrap();
        runtime.create_object(ObjectId::new(DIFFICULTY), DIFFICULTY_TYPE).unwrap();
        let difficulty = runtime.map(&ObjectId::new(DIFFICULTY)).unwrap();
        assert_eq!(difficulty.get_f64("sliderMultiplier"), Some(1.4));
        let root = runtime.map(&ObjectId::new(ROOT)).unwrap();
        assert_eq!(root.get("formatVersion"), Some(&Value::Int(FORMAT_VERSION)));
    }

    #[test]
    fn test_invalid_hit_object_is_reported() {
        let entries = entries([("type", "slider".into()), ("startTime", 1.0.into())]);
        let err = hit_object_from_entries(&ObjectId::new("h"), &entries).unwrap_err();
        assert!(matches!(err, BeatmapError::InvalidField { field: "curveType", .. }));
    }
}
