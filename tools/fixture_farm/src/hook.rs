//! Glue for request and job wrappers: record while a session is in progress,
//! otherwise stay out of the way.

use crate::errors::FixtureFarmError;
use crate::logging::append_run_log;
use crate::session::{RecordingContext, StopHandle};
use crate::session_store::SessionStore;
use serde_json::json;

/// Run `work`, tracing it into the active session if there is one.
///
/// `work` receives `None` when nothing is being recorded. The session is
/// saved after the pass whether or not writing fixtures succeeded; the first
/// error is returned.
pub fn record_if_in_progress<T>(
    ctx: &RecordingContext<'_>,
    sessions: &SessionStore<'_>,
    work: impl FnOnce(Option<&mut StopHandle<'_>>) -> T,
) -> Result<T, FixtureFarmError> {
    if !sessions.in_progress()? {
        return Ok(work(None));
    }
    let Some(mut session) = sessions.resume(ctx.store, ctx.clock)? else {
        append_run_log(
            "warn",
            "recording.resume_failed",
            json!({"path": sessions.path().display().to_string()}),
        );
        return Ok(work(None));
    };

    let recorded = session.record_new_fixtures(ctx, |handle| work(Some(handle)));
    let saved = sessions.save(&session);
    let output = recorded?;
    saved?;
    Ok(output)
}
