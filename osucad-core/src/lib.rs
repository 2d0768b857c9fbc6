//! # osucad-core: Beatmap domain model
//!
//! Plain data types for an osu! standard beatmap plus the codec for the
//! stable `.osu` text format. The collaborative layer (`osucad-collab`)
//! wraps these types at document creation and export time; nothing here
//! knows about synchronization.
//!
//! ```text
//! .osu text ──parse──► Beatmap ──► shared document (osucad-collab)
//!     ▲                                   │
//!     └────────────serialize──────────────┘
//! ```

pub mod beatmap;
pub mod codec;

pub use beatmap::{
    new_object_id, Beatmap, BeatmapDifficulty, BeatmapGeneral, BeatmapMetadata, CurveType,
    HitObject, HitObjectKind, TimingPoint, Vec2,
};
pub use codec::{parse, serialize, ParseError};
