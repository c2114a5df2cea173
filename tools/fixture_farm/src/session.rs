//! One recording pass: trace a block of work, then name and write what it
//! created and remove what it destroyed.

use crate::blob_rename::rename_blobs;
use crate::config::AppConfig;
use crate::errors::FixtureFarmError;
use crate::fixture_file::FixtureIndex;
use crate::fixture_writer::{delete_fixtures, write_fixtures};
use crate::logging::append_run_log;
use crate::model::{DataStore, NotificationBus, RecordRef, RecordSnapshot};
use crate::naming::NameResolver;
use crate::runtime::{Clock, FileSystem};
use crate::tracer::{TraceLog, Tracer};
use crate::value_serializer::ValueSerializer;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

/// Either a leading name segment, or `{new_name: generated_name}` renames
/// applied after naming.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NamePrefix {
    Text(String),
    Rename(BTreeMap<String, String>),
}

impl NamePrefix {
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Rename(_) => None,
        }
    }

    pub fn renames(&self) -> Option<&BTreeMap<String, String>> {
        match self {
            Self::Text(_) => None,
            Self::Rename(renames) => Some(renames),
        }
    }
}

impl From<&str> for NamePrefix {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

/// Everything a recording pass reads from or writes to.
#[derive(Clone, Copy)]
pub struct RecordingContext<'a> {
    pub store: &'a dyn DataStore,
    pub bus: &'a dyn NotificationBus,
    pub fs: &'a dyn FileSystem,
    pub clock: &'a dyn Clock,
    pub config: &'a AppConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Tracing,
    Stopped,
}

/// Outcome of the last completed pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub written: usize,
    pub deleted: usize,
    pub renamed_blobs: Vec<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct RecordingSession {
    prefix: Option<NamePrefix>,
    new_records: Vec<RecordRef>,
    fixture_names: Vec<(RecordRef, String)>,
    initial_now: NaiveDateTime,
    state: SessionState,
    last_pass: Option<PassSummary>,
}

impl RecordingSession {
    pub fn new(prefix: Option<NamePrefix>, initial_now: NaiveDateTime) -> Self {
        Self::resumed(prefix, Vec::new(), Vec::new(), initial_now)
    }

    /// Continue a session whose earlier passes created `new_records`.
    pub fn resumed(
        prefix: Option<NamePrefix>,
        new_records: Vec<RecordRef>,
        fixture_names: Vec<(RecordRef, String)>,
        initial_now: NaiveDateTime,
    ) -> Self {
        Self {
            prefix,
            new_records,
            fixture_names,
            initial_now,
            state: SessionState::Idle,
            last_pass: None,
        }
    }

    pub fn prefix(&self) -> Option<&NamePrefix> {
        self.prefix.as_ref()
    }

    /// Records created by this session that still existed at the last stop.
    pub fn new_records(&self) -> &[RecordRef] {
        &self.new_records
    }

    pub fn fixture_names(&self) -> &[(RecordRef, String)] {
        &self.fixture_names
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn last_pass(&self) -> Option<&PassSummary> {
        self.last_pass.as_ref()
    }

    /// Trace `work`, then write fixtures. `work` may stop early through the
    /// handle; anything after that is not recorded.
    pub fn record_new_fixtures<T>(
        &mut self,
        ctx: &RecordingContext<'_>,
        work: impl FnOnce(&mut StopHandle<'_>) -> T,
    ) -> Result<T, FixtureFarmError> {
        self.state = SessionState::Tracing;
        append_run_log(
            "info",
            "recording.started",
            json!({"prefix": self.prefix, "pending": self.new_records.len()}),
        );
        let tracer = Tracer::start(ctx.bus);
        let mut handle = StopHandle {
            session: self,
            ctx,
            tracer,
        };
        let output = work(&mut handle);
        handle.stop()?;
        Ok(output)
    }

    fn finish(&mut self, ctx: &RecordingContext<'_>, log: TraceLog) -> Result<(), FixtureFarmError> {
        self.state = SessionState::Stopped;
        let snapshots = self.reload_new_records(ctx.store, &log)?;

        let index = FixtureIndex::new(ctx.fs, ctx.config.paths.fixtures_dir.clone());
        let prefix = self
            .prefix
            .as_ref()
            .and_then(NamePrefix::text)
            .map(str::to_string);
        let mut resolver = NameResolver::new(ctx.store, index, prefix)
            .with_low_priority_types(ctx.config.naming.low_priority_parent_types.clone());
        for (record, name) in &self.fixture_names {
            resolver.seed(record.clone(), name.clone());
        }
        for record in &log.destroyed {
            if let Some(name) = resolver.name_of(record)? {
                resolver.mark_deleted(name, record.clone());
            }
        }

        for snapshot in &snapshots {
            resolver.ensure_name(snapshot)?;
        }
        if let Some(renames) = self.prefix.as_ref().and_then(NamePrefix::renames) {
            for (to, from) in renames {
                resolver.rename(from, to)?;
            }
        }

        let renamed_blobs = rename_blobs(
            ctx.store,
            ctx.fs,
            &ctx.config.blobs,
            &ctx.config.paths.storage_dir,
            resolver.named_fixtures_mut(),
        )?;
        let deleted = delete_fixtures(&mut resolver)?;
        let serializer = ValueSerializer::new(self.initial_now, ctx.clock.now());
        let written = write_fixtures(&mut resolver, &serializer)?;

        let gone = resolver
            .deleted()
            .iter()
            .map(|deleted| deleted.record.clone())
            .collect::<HashSet<_>>();
        let mut names = resolver
            .assigned_names()
            .iter()
            .filter(|(record, _)| !gone.contains(*record))
            .map(|(record, name)| (record.clone(), name.clone()))
            .collect::<Vec<_>>();
        names.sort();
        self.fixture_names = names;

        append_run_log(
            "info",
            "recording.stopped",
            json!({"written": written, "deleted": deleted, "new_records": self.new_records.len()}),
        );
        self.last_pass = Some(PassSummary {
            written,
            deleted,
            renamed_blobs,
        });
        Ok(())
    }

    /// Pending and newly created records as they are now. Records removed
    /// since their creation are dropped.
    fn reload_new_records(
        &mut self,
        store: &dyn DataStore,
        log: &TraceLog,
    ) -> Result<Vec<RecordSnapshot>, FixtureFarmError> {
        let mut seen = HashSet::new();
        let mut snapshots = Vec::new();
        for record in self.new_records.iter().chain(log.created.iter()) {
            if !seen.insert(record.clone()) {
                continue;
            }
            match store.reload(record) {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(err) if err.is_not_found() => {
                    append_run_log(
                        "debug",
                        "recording.vanished",
                        json!({"record": record.to_string()}),
                    );
                }
                Err(err) => return Err(err),
            }
        }
        self.new_records = snapshots
            .iter()
            .map(|snapshot| snapshot.record.clone())
            .collect();
        Ok(snapshots)
    }
}

/// Given to the traced block; stops tracing and writes fixtures at once.
pub struct StopHandle<'s> {
    session: &'s mut RecordingSession,
    ctx: &'s RecordingContext<'s>,
    tracer: Tracer<'s>,
}

impl StopHandle<'_> {
    /// Calling this more than once, or letting the block finish afterwards,
    /// does nothing further.
    pub fn stop(&mut self) -> Result<(), FixtureFarmError> {
        if self.session.state == SessionState::Stopped {
            return Ok(());
        }
        self.tracer.stop();
        let log = self.tracer.snapshot();
        self.session.finish(self.ctx, log)
    }

    pub fn is_stopped(&self) -> bool {
        self.session.state == SessionState::Stopped
    }
}

/// Record fixtures for `work` in a fresh session not tied to the session file.
pub fn record_fixtures<T>(
    ctx: &RecordingContext<'_>,
    prefix: Option<NamePrefix>,
    work: impl FnOnce(&mut StopHandle<'_>) -> T,
) -> Result<T, FixtureFarmError> {
    let mut session = RecordingSession::new(prefix, ctx.clock.now());
    session.record_new_fixtures(ctx, work)
}
