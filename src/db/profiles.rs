use rusqlite::{OptionalExtension, Row, params};

use super::{Database, map_constraint};
use crate::domain::{
    AudioStrategy, Container, Profile, ProfileDraft, SubtitleStrategy, VideoCodec,
};
use crate::error::{StorageError, StorageResult};

const PROFILE_COLUMNS: &str = "id, name, codec, encoder, quality, container, resolution, \
     framerate, audio_strategy, audio_codec, subtitle_strategy, enable_filters, \
     chapter_markers, hw_accel_enabled, preset, two_pass, custom_args, is_default";

fn profile_from_row(row: &Row<'_>) -> rusqlite::Result<RawProfile> {
    Ok(RawProfile {
        id: row.get(0)?,
        name: row.get(1)?,
        codec: row.get(2)?,
        encoder: row.get(3)?,
        quality: row.get(4)?,
        container: row.get(5)?,
        resolution: row.get(6)?,
        framerate: row.get(7)?,
        audio_strategy: row.get(8)?,
        audio_codec: row.get(9)?,
        subtitle_strategy: row.get(10)?,
        enable_filters: row.get(11)?,
        chapter_markers: row.get(12)?,
        hw_accel_enabled: row.get(13)?,
        preset: row.get(14)?,
        two_pass: row.get(15)?,
        custom_args: row.get(16)?,
        is_default: row.get(17)?,
    })
}

struct RawProfile {
    id: i64,
    name: String,
    codec: String,
    encoder: String,
    quality: i64,
    container: String,
    resolution: Option<String>,
    framerate: Option<f64>,
    audio_strategy: String,
    audio_codec: String,
    subtitle_strategy: String,
    enable_filters: bool,
    chapter_markers: bool,
    hw_accel_enabled: bool,
    preset: Option<String>,
    two_pass: bool,
    custom_args: Option<String>,
    is_default: bool,
}

impl TryFrom<RawProfile> for Profile {
    type Error = StorageError;

    fn try_from(raw: RawProfile) -> Result<Self, StorageError> {
        Ok(Profile {
            id: raw.id,
            name: raw.name,
            codec: VideoCodec::parse(&raw.codec)?,
            encoder: raw.encoder,
            quality: u8::try_from(raw.quality.clamp(0, 51)).unwrap_or(28),
            container: Container::parse(&raw.container)?,
            resolution: raw.resolution.filter(|r| !r.is_empty()),
            framerate: raw.framerate,
            audio_strategy: AudioStrategy::parse(&raw.audio_strategy)?,
            audio_codec: raw.audio_codec,
            subtitle_strategy: SubtitleStrategy::parse(&raw.subtitle_strategy)?,
            enable_filters: raw.enable_filters,
            chapter_markers: raw.chapter_markers,
            hw_accel_enabled: raw.hw_accel_enabled,
            preset: raw.preset.filter(|p| !p.is_empty()),
            two_pass: raw.two_pass,
            custom_args: raw.custom_args.filter(|a| !a.is_empty()),
            is_default: raw.is_default,
        })
    }
}

impl Database {
    pub fn create_profile(&self, draft: &ProfileDraft) -> StorageResult<i64> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO profiles (name, codec, encoder, quality, container, resolution, \
                 framerate, audio_strategy, audio_codec, subtitle_strategy, enable_filters, \
                 chapter_markers, hw_accel_enabled, preset, two_pass, custom_args) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                params![
                    draft.name,
                    draft.codec.as_str(),
                    draft.encoder,
                    i64::from(draft.quality),
                    draft.container.as_str(),
                    draft.resolution,
                    draft.framerate,
                    draft.audio_strategy.as_str(),
                    draft.audio_codec,
                    draft.subtitle_strategy.as_str(),
                    draft.enable_filters,
                    draft.chapter_markers,
                    draft.hw_accel_enabled,
                    draft.preset,
                    draft.two_pass,
                    draft.custom_args,
                ],
            )
            .map_err(|e| map_constraint(e, "profile name must be unique"))?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn update_profile(&self, id: i64, draft: &ProfileDraft) -> StorageResult<()> {
        self.with_conn(|conn| {
            let changed = conn
                .execute(
                    "UPDATE profiles SET name = ?1, codec = ?2, encoder = ?3, quality = ?4, \
                     container = ?5, resolution = ?6, framerate = ?7, audio_strategy = ?8, \
                     audio_codec = ?9, subtitle_strategy = ?10, enable_filters = ?11, \
                     chapter_markers = ?12, hw_accel_enabled = ?13, preset = ?14, \
                     two_pass = ?15, custom_args = ?16 WHERE id = ?17",
                    params![
                        draft.name,
                        draft.codec.as_str(),
                        draft.encoder,
                        i64::from(draft.quality),
                        draft.container.as_str(),
                        draft.resolution,
                        draft.framerate,
                        draft.audio_strategy.as_str(),
                        draft.audio_codec,
                        draft.subtitle_strategy.as_str(),
                        draft.enable_filters,
                        draft.chapter_markers,
                        draft.hw_accel_enabled,
                        draft.preset,
                        draft.two_pass,
                        draft.custom_args,
                        id,
                    ],
                )
                .map_err(|e| map_constraint(e, "profile name must be unique"))?;
            if changed == 0 {
                return Err(StorageError::NotFound {
                    entity: "profile",
                    id,
                });
            }
            Ok(())
        })
    }

    /// Delete a profile. Refused while any queue item still references
    /// it, so queued work never silently loses its recipe.
    pub fn delete_profile(&self, id: i64) -> StorageResult<()> {
        self.with_tx(|tx| {
            let referencing: i64 = tx.query_row(
                "SELECT COUNT(*) FROM queue WHERE profile_id = ?1",
                params![id],
                |r| r.get(0),
            )?;
            if referencing > 0 {
                return Err(StorageError::ConstraintViolation(format!(
                    "profile {id} is referenced by {referencing} queue item(s); \
                     clear or re-profile them first"
                )));
            }
            let deleted = tx.execute("DELETE FROM profiles WHERE id = ?1", params![id])?;
            if deleted == 0 {
                return Err(StorageError::NotFound {
                    entity: "profile",
                    id,
                });
            }
            Ok(())
        })
    }

    /// Make `id` the default profile, atomically clearing any previous
    /// default in the same transaction.
    pub fn set_default_profile(&self, id: i64) -> StorageResult<()> {
        self.with_tx(|tx| {
            tx.execute("UPDATE profiles SET is_default = 0 WHERE is_default = 1", [])?;
            let changed =
                tx.execute("UPDATE profiles SET is_default = 1 WHERE id = ?1", params![id])?;
            if changed == 0 {
                return Err(StorageError::NotFound {
                    entity: "profile",
                    id,
                });
            }
            Ok(())
        })
    }

    pub fn profiles(&self) -> StorageResult<Vec<Profile>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!("SELECT {PROFILE_COLUMNS} FROM profiles ORDER BY name"))?;
            let raw: Vec<RawProfile> = stmt
                .query_map([], profile_from_row)?
                .collect::<Result<_, _>>()?;
            raw.into_iter().map(Profile::try_from).collect()
        })
    }

    pub fn profile(&self, id: i64) -> StorageResult<Option<Profile>> {
        self.with_conn(|conn| {
            let raw = conn
                .query_row(
                    &format!("SELECT {PROFILE_COLUMNS} FROM profiles WHERE id = ?1"),
                    params![id],
                    profile_from_row,
                )
                .optional()?;
            raw.map(Profile::try_from).transpose()
        })
    }

    pub fn default_profile(&self) -> StorageResult<Option<Profile>> {
        self.with_conn(|conn| {
            let raw = conn
                .query_row(
                    &format!("SELECT {PROFILE_COLUMNS} FROM profiles WHERE is_default = 1 LIMIT 1"),
                    [],
                    profile_from_row,
                )
                .optional()?;
            raw.map(Profile::try_from).transpose()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db_with_profiles() -> (Database, i64, i64) {
        let db = Database::open_in_memory().unwrap();
        let a = db.create_profile(&ProfileDraft::av1_default("movies")).unwrap();
        let b = db.create_profile(&ProfileDraft::av1_default("tv")).unwrap();
        (db, a, b)
    }

    #[test]
    fn profile_round_trips() {
        let (db, a, _) = db_with_profiles();
        let profile = db.profile(a).unwrap().unwrap();
        assert_eq!(profile.name, "movies");
        assert_eq!(profile.codec, VideoCodec::Av1);
        assert_eq!(profile.container, Container::Mkv);
        assert!(!profile.is_default);
    }

    #[test]
    fn duplicate_name_is_a_constraint_violation() {
        let (db, _, _) = db_with_profiles();
        let err = db
            .create_profile(&ProfileDraft::av1_default("movies"))
            .unwrap_err();
        assert!(matches!(err, StorageError::ConstraintViolation(_)));
    }

    #[test]
    fn at_most_one_default_profile() {
        let (db, a, b) = db_with_profiles();
        db.set_default_profile(a).unwrap();
        db.set_default_profile(b).unwrap();
        let defaults: Vec<_> = db
            .profiles()
            .unwrap()
            .into_iter()
            .filter(|p| p.is_default)
            .collect();
        assert_eq!(defaults.len(), 1);
        assert_eq!(defaults[0].id, b);
        assert_eq!(db.default_profile().unwrap().unwrap().id, b);
    }

    #[test]
    fn default_stays_single_under_concurrent_writers() {
        use std::sync::Arc;

        let db = Arc::new(Database::open_in_memory().unwrap());
        let mut ids = Vec::new();
        for i in 0..4 {
            ids.push(
                db.create_profile(&ProfileDraft::av1_default(&format!("p{i}")))
                    .unwrap(),
            );
        }

        let handles: Vec<_> = ids
            .iter()
            .map(|id| {
                let db = db.clone();
                let id = *id;
                std::thread::spawn(move || db.set_default_profile(id).unwrap())
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let defaults = db
            .profiles()
            .unwrap()
            .into_iter()
            .filter(|p| p.is_default)
            .count();
        assert_eq!(defaults, 1);
    }

    #[test]
    fn missing_profile_is_none_not_error() {
        let (db, _, _) = db_with_profiles();
        assert!(db.profile(9999).unwrap().is_none());
    }
}
