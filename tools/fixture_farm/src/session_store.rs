//! The recording session as it survives between processes: a single JSON file
//! holding the name prefix and the records created so far.

use crate::errors::FixtureFarmError;
use crate::logging::append_run_log;
use crate::model::{DataStore, RecordKey, RecordRef};
use crate::runtime::{Clock, FileSystem};
use crate::session::{NamePrefix, RecordingSession};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::{Path, PathBuf};

pub const RESET_ERROR: &str = "database was externally modified/reset";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionFile {
    pub fixture_name_prefix: Option<NamePrefix>,
    #[serde(default)]
    pub new_models: Vec<(String, RecordKey)>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fixture_names: Vec<(String, RecordKey, String)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    Absent,
    Active,
    Error(String),
}

pub struct SessionStore<'a> {
    fs: &'a dyn FileSystem,
    path: PathBuf,
}

impl<'a> SessionStore<'a> {
    pub fn new(fs: &'a dyn FileSystem, path: impl Into<PathBuf>) -> Self {
        Self {
            fs,
            path: path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Begin a session, replacing whatever was there.
    pub fn start(&self, prefix: Option<NamePrefix>) -> Result<(), FixtureFarmError> {
        self.write(&SessionFile {
            fixture_name_prefix: prefix,
            ..SessionFile::default()
        })?;
        append_run_log(
            "info",
            "session_store.started",
            json!({"path": self.path.display().to_string()}),
        );
        Ok(())
    }

    pub fn stop(&self) -> Result<(), FixtureFarmError> {
        if self.fs.exists(&self.path) {
            self.fs.remove_file(&self.path)?;
            append_run_log(
                "info",
                "session_store.stopped",
                json!({"path": self.path.display().to_string()}),
            );
        }
        Ok(())
    }

    pub fn load(&self) -> Result<Option<SessionFile>, FixtureFarmError> {
        if !self.fs.exists(&self.path) {
            return Ok(None);
        }
        let text = self.fs.read_to_string(&self.path)?;
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| FixtureFarmError::SessionParse(e.to_string()))
    }

    pub fn status(&self) -> Result<SessionStatus, FixtureFarmError> {
        Ok(match self.load()? {
            None => SessionStatus::Absent,
            Some(SessionFile {
                error: Some(error), ..
            }) => SessionStatus::Error(error),
            Some(_) => SessionStatus::Active,
        })
    }

    pub fn in_progress(&self) -> Result<bool, FixtureFarmError> {
        Ok(self.status()? == SessionStatus::Active)
    }

    pub fn last_error(&self) -> Result<Option<String>, FixtureFarmError> {
        Ok(self.load()?.and_then(|session| session.error))
    }

    /// Pick up the session, starting one without a prefix when none exists.
    /// `None` for a failed session, and once any recorded record has gone
    /// missing; the session is then marked failed and stays so until restarted.
    pub fn resume(
        &self,
        store: &dyn DataStore,
        clock: &dyn Clock,
    ) -> Result<Option<RecordingSession>, FixtureFarmError> {
        let mut session = match self.load()? {
            Some(session) if session.error.is_some() => return Ok(None),
            Some(session) => session,
            None => {
                self.start(None)?;
                SessionFile::default()
            }
        };

        let mut new_records = Vec::with_capacity(session.new_models.len());
        for (entity_type, key) in &session.new_models {
            match store.find(entity_type, *key, false) {
                Ok(snapshot) => new_records.push(snapshot.record),
                Err(err) if err.is_not_found() => {
                    append_run_log(
                        "warn",
                        "session_store.reset_detected",
                        json!({"missing": RecordRef::new(entity_type.clone(), *key).to_string()}),
                    );
                    session.error = Some(RESET_ERROR.to_string());
                    self.write(&session)?;
                    return Ok(None);
                }
                Err(err) => return Err(err),
            }
        }

        let fixture_names = session
            .fixture_names
            .into_iter()
            .map(|(entity_type, key, name)| (RecordRef::new(entity_type, key), name))
            .collect();
        Ok(Some(RecordingSession::resumed(
            session.fixture_name_prefix,
            new_records,
            fixture_names,
            clock.now(),
        )))
    }

    /// Persist the session's progress unless recording was stopped or failed
    /// in the meantime.
    pub fn save(&self, session: &RecordingSession) -> Result<bool, FixtureFarmError> {
        if !self.in_progress()? {
            return Ok(false);
        }
        self.write(&SessionFile {
            fixture_name_prefix: session.prefix().cloned(),
            new_models: session
                .new_records()
                .iter()
                .map(|record| (record.entity_type.clone(), record.key))
                .collect(),
            fixture_names: session
                .fixture_names()
                .iter()
                .map(|(record, name)| (record.entity_type.clone(), record.key, name.clone()))
                .collect(),
            error: None,
        })?;
        Ok(true)
    }

    fn write(&self, session: &SessionFile) -> Result<(), FixtureFarmError> {
        if let Some(parent) = self.path.parent() {
            self.fs.create_dir_all(parent)?;
        }
        let text = serde_json::to_string(session)
            .map_err(|e| FixtureFarmError::SessionParse(e.to_string()))?;
        self.fs.write_string(&self.path, &text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BelongsTo, RecordSnapshot, Value};
    use crate::runtime::{FakeClock, FakeFileSystem};
    use chrono::NaiveDate;

    const PATH: &str = "/app/tmp/fixture_farm_store.json";

    struct KnownKeys(Vec<RecordRef>);

    impl DataStore for KnownKeys {
        fn type_hierarchy(&self, entity_type: &str) -> Vec<String> {
            vec![entity_type.to_string()]
        }

        fn belongs_to(&self, _entity_type: &str) -> Vec<BelongsTo> {
            vec![]
        }

        fn find(&self, entity_type: &str, key: i64, _unscoped: bool) -> Result<RecordSnapshot, FixtureFarmError> {
            let record = RecordRef::new(entity_type, key);
            if self.0.contains(&record) {
                Ok(RecordSnapshot {
                    record,
                    attributes: vec![],
                })
            } else {
                Err(FixtureFarmError::not_found(entity_type, key))
            }
        }

        fn update_attribute(&self, _record: &RecordRef, _name: &str, _value: Value) -> Result<(), FixtureFarmError> {
            Ok(())
        }
    }

    fn clock() -> FakeClock {
        FakeClock::new(
            NaiveDate::from_ymd_opt(2024, 5, 1)
                .and_then(|d| d.and_hms_opt(9, 0, 0))
                .expect("valid time"),
        )
    }

    #[test]
    fn start_status_stop_lifecycle() {
        let fs = FakeFileSystem::default();
        let store = SessionStore::new(&fs, PATH);
        assert_eq!(store.status().expect("status"), SessionStatus::Absent);
        assert!(!store.in_progress().expect("status"));

        store.start(Some("test_prefix".into())).expect("start");
        assert!(store.in_progress().expect("status"));
        assert_eq!(
            fs.file(PATH).as_deref(),
            Some("{\"fixture_name_prefix\":\"test_prefix\",\"new_models\":[]}")
        );

        store.stop().expect("stop");
        store.stop().expect("second stop");
        assert_eq!(store.status().expect("status"), SessionStatus::Absent);
    }

    #[test]
    fn error_field_means_not_in_progress() {
        let fs = FakeFileSystem::with_file(
            PATH,
            "{\"fixture_name_prefix\":\"test_prefix\",\"new_models\":[],\"error\":\"database was externally modified/reset\"}",
        );
        let store = SessionStore::new(&fs, PATH);
        assert!(!store.in_progress().expect("status"));
        assert_eq!(store.last_error().expect("error").as_deref(), Some(RESET_ERROR));
    }

    #[test]
    fn resume_starts_a_session_when_none_exists() {
        let fs = FakeFileSystem::default();
        let store = SessionStore::new(&fs, PATH);
        let session = store
            .resume(&KnownKeys(vec![]), &clock())
            .expect("resume")
            .expect("session");
        assert!(session.prefix().is_none());
        assert!(session.new_records().is_empty());
        assert!(store.in_progress().expect("status"));
    }

    #[test]
    fn resume_fails_closed_when_a_record_is_missing() {
        let fs = FakeFileSystem::with_file(
            PATH,
            "{\"fixture_name_prefix\":\"test_prefix\",\"new_models\":[[\"User\",99999]]}",
        );
        let store = SessionStore::new(&fs, PATH);
        assert!(store
            .resume(&KnownKeys(vec![]), &clock())
            .expect("resume")
            .is_none());
        assert!(!store.in_progress().expect("status"));
        assert_eq!(store.last_error().expect("error").as_deref(), Some(RESET_ERROR));

        let saved = store.load().expect("load").expect("file");
        assert_eq!(saved.new_models, vec![("User".to_string(), 99999)]);
    }

    #[test]
    fn failed_session_is_not_resumed() {
        let body = "{\"fixture_name_prefix\":\"p\",\"new_models\":[[\"User\",3]],\"error\":\"database was externally modified/reset\"}";
        let fs = FakeFileSystem::with_file(PATH, body);
        let store = SessionStore::new(&fs, PATH);
        let known = KnownKeys(vec![RecordRef::new("User", 3)]);
        assert!(store.resume(&known, &clock()).expect("resume").is_none());
        assert!(!store.in_progress().expect("status"));
        assert_eq!(fs.file(PATH).as_deref(), Some(body));
    }

    #[test]
    fn save_round_trips_records_and_names_but_not_after_stop() {
        let fs = FakeFileSystem::with_file(
            PATH,
            "{\"fixture_name_prefix\":\"p\",\"new_models\":[[\"User\",3]],\"fixture_names\":[[\"User\",3,\"p_user_1\"]]}",
        );
        let store = SessionStore::new(&fs, PATH);
        let known = KnownKeys(vec![RecordRef::new("User", 3)]);
        let session = store.resume(&known, &clock()).expect("resume").expect("session");
        assert_eq!(
            session.fixture_names(),
            &[(RecordRef::new("User", 3), "p_user_1".to_string())]
        );

        assert!(store.save(&session).expect("save"));
        let saved = store.load().expect("load").expect("file");
        assert_eq!(saved.fixture_name_prefix, Some(NamePrefix::Text("p".to_string())));
        assert_eq!(saved.new_models, vec![("User".to_string(), 3)]);
        assert_eq!(
            saved.fixture_names,
            vec![("User".to_string(), 3, "p_user_1".to_string())]
        );

        store.stop().expect("stop");
        assert!(!store.save(&session).expect("save"));
        assert!(!fs.exists(Path::new(PATH)));
    }

    #[test]
    fn corrupt_session_file_is_reported() {
        let fs = FakeFileSystem::with_file(PATH, "not json");
        let store = SessionStore::new(&fs, PATH);
        assert!(matches!(store.status(), Err(FixtureFarmError::SessionParse(_))));
    }
}
