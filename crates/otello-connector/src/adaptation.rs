//! The adaptation workflow.
//!
//! [`run`] drives one complete over-the-air adaptation towards an end node:
//! it opens the adaptation window, deletes the paths the new application no
//! longer ships, transfers every source file, and commits. Any failure past
//! the opened window triggers a rollback, whose outcome is logged while the
//! original failure is surfaced to the caller.

use std::sync::Arc;

use otello::ota::OtaAction;
use otello::source::{AppSource, ENTRYPOINT};
use otello::state::NodeState;
use tracing::{info, warn};

use crate::controller::ControllerInner;
use crate::error::{Error, ErrorKind, Result};
use crate::session::{AdaptationSession, OperationKind, OperationReply};

/// Knobs of one adaptation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdaptationOptions {
    preempt: bool,
    model_url: Option<String>,
}

impl AdaptationOptions {
    /// Creates [`AdaptationOptions`] with every knob at its default.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Aborts any adaptation session already running instead of failing.
    #[must_use]
    pub const fn preempt(mut self) -> Self {
        self.preempt = true;
        self
    }

    /// Sets the URL of a model the node should fetch while adapting.
    #[must_use]
    pub fn model_url(mut self, url: impl Into<String>) -> Self {
        self.model_url = Some(url.into());
        self
    }
}

/// What an adaptation changed on the end node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdaptationOutcome {
    /// Paths written, in transfer order.
    pub written: Vec<String>,
    /// Paths deleted, in removal order.
    pub deleted: Vec<String>,
}

/// Runs one adaptation towards the node managed by `inner`.
pub(crate) async fn run(
    inner: &ControllerInner,
    source: AppSource,
    options: AdaptationOptions,
) -> Result<AdaptationOutcome> {
    if !source.has_entrypoint() {
        return Err(Error::new(
            ErrorKind::MissingEntrypoint,
            format!(
                "the application for `{}` ships no `{ENTRYPOINT}`",
                inner.node.id
            ),
        ));
    }

    let (session, needs_init) = open_session(inner, &options).await?;

    let result = match perform(inner, &session, &source, &options, needs_init).await {
        Ok(outcome) => {
            info!(
                "Adaptation of `{}` completed, {} written, {} deleted",
                inner.node.id,
                outcome.written.len(),
                outcome.deleted.len()
            );
            Ok(outcome)
        }
        // An aborted session belongs to whoever aborted it, the node is not
        // rolled back from here.
        Err(error) if session.is_aborted().await => Err(error),
        Err(error) => {
            warn!("Adaptation of `{}` failed, rolling back", inner.node.id);
            match roll_back(inner, &session).await {
                Ok(()) => info!("Rollback of `{}` completed", inner.node.id),
                Err(rollback_error) => warn!(
                    "Rollback of `{}` failed: {rollback_error}",
                    inner.node.id
                ),
            }
            Err(error)
        }
    };

    release_session(inner, &session, result.is_err()).await;

    result
}

/// Guards the lifecycle state, claims the session slot, and reports whether
/// the adaptation window still has to be opened.
async fn open_session(
    inner: &ControllerInner,
    options: &AdaptationOptions,
) -> Result<(Arc<AdaptationSession>, bool)> {
    let mut runtime = inner.runtime.lock().await;

    if let Some(active) = runtime.session.clone() {
        if options.preempt {
            warn!("Preempting the active adaptation session of `{}`", inner.node.id);
            active.abort("preempted by a newer adaptation").await;
        } else {
            return Err(Error::new(
                ErrorKind::SessionInProgress,
                format!("`{}` is already being adapted", inner.node.id),
            ));
        }
    }

    let needs_init = match runtime.fsm.current() {
        state @ (NodeState::Unknown | NodeState::Restarting) => {
            return Err(Error::new(
                ErrorKind::InvalidState,
                format!("`{}` cannot be adapted while `{state}`", inner.node.id),
            ));
        }
        NodeState::Application => {
            runtime.fsm.transition(NodeState::AdaptationPrep)?;
            true
        }
        NodeState::AdaptationPrep => true,
        NodeState::Adaptation => false,
    };

    let session = Arc::new(AdaptationSession::new(inner.timeouts.clone()));
    runtime.session = Some(session.clone());

    Ok((session, needs_init))
}

async fn perform(
    inner: &ControllerInner,
    session: &Arc<AdaptationSession>,
    source: &AppSource,
    options: &AdaptationOptions,
    needs_init: bool,
) -> Result<AdaptationOutcome> {
    if needs_init {
        let pending = session.arm(OperationKind::Init).await?;
        inner
            .publish_action(OtaAction::init(options.model_url.clone()))
            .await?;
        let _ = pending.wait().await?;
    }

    // Paths written by earlier adaptations which the new application no
    // longer ships are removed first.
    let stale = { inner.runtime.lock().await.replace_set.stale_paths(source) };
    let mut deleted = Vec::with_capacity(stale.len());
    for path in stale {
        let pending = session.arm(OperationKind::Delete).await?;
        inner
            .publish_action(OtaAction::delete(path.as_str(), false))
            .await?;
        let reply = pending.wait().await?;

        let OperationReply::Deleted(paths) = reply else {
            return Err(Error::new(
                ErrorKind::ProtocolViolation,
                format!("`delete` of `{path}` settled with a mismatched reply"),
            ));
        };

        {
            let mut runtime = inner.runtime.lock().await;
            for removed in &paths {
                let _ = runtime.replace_set.forget(removed);
            }
        }
        deleted.extend(paths);
    }

    let mut written = Vec::with_capacity(source.files.len());
    for file in source.files.iter() {
        let pending = session.arm(OperationKind::Write).await?;
        inner
            .publish_action(OtaAction::write(file.path.as_str(), &file.content, false))
            .await?;
        let reply = pending.wait().await?;

        let OperationReply::Written(reported) = reply else {
            return Err(Error::new(
                ErrorKind::ProtocolViolation,
                format!("`write` of `{}` settled with a mismatched reply", file.path),
            ));
        };

        if reported != file.path {
            return Err(Error::new(
                ErrorKind::MismatchedWritePath,
                format!("requested `{}`, the node wrote `{reported}`", file.path),
            ));
        }

        {
            let mut runtime = inner.runtime.lock().await;
            let _ = runtime.replace_set.record(file.path.as_str());
        }
        written.push(reported);
    }

    let pending = session.arm(OperationKind::Commit).await?;
    inner.publish_action(OtaAction::finish()).await?;
    let _ = pending.wait().await?;

    Ok(AdaptationOutcome { written, deleted })
}

async fn roll_back(inner: &ControllerInner, session: &Arc<AdaptationSession>) -> Result<()> {
    let pending = session.arm(OperationKind::Rollback).await?;
    inner.publish_action(OtaAction::rollback()).await?;
    let _ = pending.wait().await?;
    Ok(())
}

/// Clears the session slot, provided a preempting adaptation has not already
/// replaced it. A failed adaptation which never left the preparation state
/// returns the lifecycle to the running application.
async fn release_session(
    inner: &ControllerInner,
    session: &Arc<AdaptationSession>,
    failed: bool,
) {
    let mut runtime = inner.runtime.lock().await;

    if runtime
        .session
        .as_ref()
        .is_some_and(|active| Arc::ptr_eq(active, session))
    {
        runtime.session = None;

        if failed && runtime.fsm.is(NodeState::AdaptationPrep) {
            let _ = runtime.fsm.transition(NodeState::Application);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use otello::ota::ReportResult;
    use otello::state::NodeState;

    use crate::error::ErrorKind;
    use crate::session::SessionTimeouts;
    use crate::tests::{TestBed, action_name, app_source, next_action, report, status};

    use super::AdaptationOptions;

    #[tokio::test]
    async fn adaptation_transfers_deletes_and_commits() {
        let bed = Arc::new(TestBed::new("thermo-1"));
        bed.deliver(status("thermo-1", NodeState::Application)).await.unwrap();
        bed.seed_replace(&["lib/extra.py", "lib/util.py"]).await;

        let source = app_source(&[
            ("main.py", b"import lib.util".as_slice()),
            ("lib/util.py", b"TARGET = 21.5".as_slice()),
        ]);

        let worker = {
            let bed = bed.clone();
            tokio::spawn(async move {
                bed.controller
                    .start_adaptation(source, AdaptationOptions::new())
                    .await
            })
        };

        let (topic, _) = next_action(&bed.outbox).await;
        assert_eq!(action_name(&topic), "OTAInit");
        bed.deliver(status("thermo-1", NodeState::Adaptation)).await.unwrap();

        // `lib/extra.py` is stale; `lib/util.py` ships again and stays.
        let (topic, body) = next_action(&bed.outbox).await;
        assert_eq!(action_name(&topic), "OTADelete");
        assert_eq!(body["path"], "lib/extra.py");
        assert_eq!(body["recursive"], false);
        bed.deliver(report(
            "thermo-1",
            ReportResult::deleted(vec!["lib/extra.py".into()]),
        ))
        .await
        .unwrap();

        for path in ["main.py", "lib/util.py"] {
            let (topic, body) = next_action(&bed.outbox).await;
            assert_eq!(action_name(&topic), "OTAWrite");
            assert_eq!(body["path"], path);
            assert_eq!(body["payload"]["algo"], "crc32");
            bed.deliver(report("thermo-1", ReportResult::written(path)))
                .await
                .unwrap();
        }

        let (topic, _) = next_action(&bed.outbox).await;
        assert_eq!(action_name(&topic), "OTAFinish");
        bed.deliver(status("thermo-1", NodeState::Restarting)).await.unwrap();

        let outcome = worker.await.unwrap().unwrap();
        assert_eq!(outcome.written, vec!["main.py", "lib/util.py"]);
        assert_eq!(outcome.deleted, vec!["lib/extra.py"]);

        assert_eq!(bed.controller.state().await, NodeState::Restarting);
        assert!(!bed.session_active().await);
        // The entrypoint is never tracked for replacement, library code is.
        assert!(!bed.replace_set_contains("main.py").await);
        assert!(bed.replace_set_contains("lib/util.py").await);
        assert!(!bed.replace_set_contains("lib/extra.py").await);

        // The node comes back after its restart.
        bed.deliver(status("thermo-1", NodeState::Application)).await.unwrap();
        assert_eq!(bed.controller.state().await, NodeState::Application);
    }

    #[tokio::test]
    async fn source_without_an_entrypoint_is_refused_before_any_action() {
        let bed = TestBed::new("thermo-1");
        bed.deliver(status("thermo-1", NodeState::Application)).await.unwrap();

        let error = bed
            .controller
            .start_adaptation(
                app_source(&[("lib/util.py", b"TARGET = 21.5")]),
                AdaptationOptions::new(),
            )
            .await
            .unwrap_err();

        assert_eq!(error.kind(), ErrorKind::MissingEntrypoint);
        assert!(bed.outbox.is_empty());
        assert_eq!(bed.controller.state().await, NodeState::Application);
    }

    #[tokio::test]
    async fn uncontacted_node_cannot_be_adapted() {
        let bed = TestBed::new("thermo-1");

        let error = bed
            .controller
            .start_adaptation(
                app_source(&[("main.py", b"pass")]),
                AdaptationOptions::new(),
            )
            .await
            .unwrap_err();

        assert_eq!(error.kind(), ErrorKind::InvalidState);
        assert!(bed.outbox.is_empty());
        assert!(!bed.session_active().await);
    }

    #[tokio::test]
    async fn mismatched_write_path_rolls_back() {
        let bed = Arc::new(TestBed::new("thermo-1"));
        bed.deliver(status("thermo-1", NodeState::Application)).await.unwrap();

        let worker = {
            let bed = bed.clone();
            tokio::spawn(async move {
                bed.controller
                    .start_adaptation(
                        app_source(&[("main.py", b"pass".as_slice())]),
                        AdaptationOptions::new(),
                    )
                    .await
            })
        };

        let (topic, _) = next_action(&bed.outbox).await;
        assert_eq!(action_name(&topic), "OTAInit");
        bed.deliver(status("thermo-1", NodeState::Adaptation)).await.unwrap();

        let (topic, _) = next_action(&bed.outbox).await;
        assert_eq!(action_name(&topic), "OTAWrite");
        bed.deliver(report("thermo-1", ReportResult::written("somewhere/else.py")))
            .await
            .unwrap();

        let (topic, _) = next_action(&bed.outbox).await;
        assert_eq!(action_name(&topic), "OTARollback");
        bed.deliver(status("thermo-1", NodeState::Application)).await.unwrap();

        let error = worker.await.unwrap().unwrap_err();
        assert_eq!(error.kind(), ErrorKind::MismatchedWritePath);

        assert_eq!(bed.controller.state().await, NodeState::Application);
        assert!(!bed.session_active().await);
        assert!(!bed.replace_set_contains("main.py").await);
    }

    #[tokio::test]
    async fn node_reported_failure_rolls_back_and_surfaces() {
        let bed = Arc::new(TestBed::new("thermo-1"));
        bed.deliver(status("thermo-1", NodeState::Application)).await.unwrap();

        let worker = {
            let bed = bed.clone();
            tokio::spawn(async move {
                bed.controller
                    .start_adaptation(
                        app_source(&[("main.py", b"pass".as_slice())]),
                        AdaptationOptions::new(),
                    )
                    .await
            })
        };

        let (topic, _) = next_action(&bed.outbox).await;
        assert_eq!(action_name(&topic), "OTAInit");
        bed.deliver(status("thermo-1", NodeState::Adaptation)).await.unwrap();

        let (topic, _) = next_action(&bed.outbox).await;
        assert_eq!(action_name(&topic), "OTAWrite");
        bed.deliver(report("thermo-1", ReportResult::failed("storage full")))
            .await
            .unwrap();

        let (topic, _) = next_action(&bed.outbox).await;
        assert_eq!(action_name(&topic), "OTARollback");
        bed.deliver(status("thermo-1", NodeState::Application)).await.unwrap();

        let error = worker.await.unwrap().unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Operation);
        assert!(error.to_string().contains("storage full"));
    }

    #[tokio::test]
    async fn unresponsive_node_times_out_and_recovers_locally() {
        let timeouts = SessionTimeouts::new()
            .init(Duration::from_millis(20))
            .rollback(Duration::from_millis(20));
        let bed = TestBed::with_timeouts("thermo-1", timeouts);
        bed.deliver(status("thermo-1", NodeState::Application)).await.unwrap();

        let error = bed
            .controller
            .start_adaptation(
                app_source(&[("main.py", b"pass")]),
                AdaptationOptions::new(),
            )
            .await
            .unwrap_err();

        // The window never opened and the rollback also timed out; the
        // original failure wins.
        assert_eq!(error.kind(), ErrorKind::Timeout);
        assert!(error.to_string().contains("`init`"));

        assert_eq!(bed.controller.state().await, NodeState::Application);
        assert!(!bed.session_active().await);
    }

    #[tokio::test]
    async fn concurrent_adaptation_is_refused_without_preempt() {
        let bed = Arc::new(TestBed::new("thermo-1"));
        bed.deliver(status("thermo-1", NodeState::Application)).await.unwrap();

        let worker = {
            let bed = bed.clone();
            tokio::spawn(async move {
                bed.controller
                    .start_adaptation(
                        app_source(&[("main.py", b"pass".as_slice())]),
                        AdaptationOptions::new(),
                    )
                    .await
            })
        };

        let (topic, _) = next_action(&bed.outbox).await;
        assert_eq!(action_name(&topic), "OTAInit");

        let error = bed
            .controller
            .start_adaptation(
                app_source(&[("main.py", b"pass")]),
                AdaptationOptions::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::SessionInProgress);

        // The first adaptation is untouched and completes.
        bed.deliver(status("thermo-1", NodeState::Adaptation)).await.unwrap();

        let (topic, _) = next_action(&bed.outbox).await;
        assert_eq!(action_name(&topic), "OTAWrite");
        bed.deliver(report("thermo-1", ReportResult::written("main.py")))
            .await
            .unwrap();

        let (topic, _) = next_action(&bed.outbox).await;
        assert_eq!(action_name(&topic), "OTAFinish");
        bed.deliver(status("thermo-1", NodeState::Restarting)).await.unwrap();

        assert!(worker.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn preemption_aborts_the_running_session() {
        let bed = Arc::new(TestBed::new("thermo-1"));
        bed.deliver(status("thermo-1", NodeState::Application)).await.unwrap();

        let first = {
            let bed = bed.clone();
            tokio::spawn(async move {
                bed.controller
                    .start_adaptation(
                        app_source(&[("main.py", b"version = 1".as_slice())]),
                        AdaptationOptions::new(),
                    )
                    .await
            })
        };

        let (topic, _) = next_action(&bed.outbox).await;
        assert_eq!(action_name(&topic), "OTAInit");

        let second = {
            let bed = bed.clone();
            tokio::spawn(async move {
                bed.controller
                    .start_adaptation(
                        app_source(&[("main.py", b"version = 2".as_slice())]),
                        AdaptationOptions::new().preempt(),
                    )
                    .await
            })
        };

        // The preempted worker surfaces the abort and does not roll back.
        let error = first.await.unwrap().unwrap_err();
        assert_eq!(error.kind(), ErrorKind::SessionAborted);

        // The second session re-opens the window.
        let (topic, _) = next_action(&bed.outbox).await;
        assert_eq!(action_name(&topic), "OTAInit");
        bed.deliver(status("thermo-1", NodeState::Adaptation)).await.unwrap();

        let (topic, body) = next_action(&bed.outbox).await;
        assert_eq!(action_name(&topic), "OTAWrite");
        assert_eq!(body["path"], "main.py");
        bed.deliver(report("thermo-1", ReportResult::written("main.py")))
            .await
            .unwrap();

        let (topic, _) = next_action(&bed.outbox).await;
        assert_eq!(action_name(&topic), "OTAFinish");
        bed.deliver(status("thermo-1", NodeState::Restarting)).await.unwrap();

        assert!(second.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn adaptation_resumes_from_an_open_window() {
        let bed = Arc::new(TestBed::new("thermo-1"));
        bed.force_state(NodeState::Adaptation).await;

        let worker = {
            let bed = bed.clone();
            tokio::spawn(async move {
                bed.controller
                    .start_adaptation(
                        app_source(&[("main.py", b"pass".as_slice())]),
                        AdaptationOptions::new(),
                    )
                    .await
            })
        };

        // No init action: the window is already open.
        let (topic, _) = next_action(&bed.outbox).await;
        assert_eq!(action_name(&topic), "OTAWrite");
        bed.deliver(report("thermo-1", ReportResult::written("main.py")))
            .await
            .unwrap();

        let (topic, _) = next_action(&bed.outbox).await;
        assert_eq!(action_name(&topic), "OTAFinish");
        bed.deliver(status("thermo-1", NodeState::Restarting)).await.unwrap();

        assert!(worker.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn model_url_rides_in_the_init_action() {
        let bed = Arc::new(TestBed::new("thermo-1"));
        bed.deliver(status("thermo-1", NodeState::Application)).await.unwrap();

        let worker = {
            let bed = bed.clone();
            tokio::spawn(async move {
                bed.controller
                    .start_adaptation(
                        app_source(&[("main.py", b"pass".as_slice())]),
                        AdaptationOptions::new().model_url("http://models.local/v2.bin"),
                    )
                    .await
            })
        };

        let (topic, body) = next_action(&bed.outbox).await;
        assert_eq!(action_name(&topic), "OTAInit");
        assert_eq!(body["model"], "http://models.local/v2.bin");

        bed.controller.stop().await;
        let error = worker.await.unwrap().unwrap_err();
        assert_eq!(error.kind(), ErrorKind::SessionAborted);
    }
}
