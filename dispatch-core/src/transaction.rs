/*
 * vSMTP mail transfer agent
 * Copyright (C) 2022 viridIT SAS
 *
 * This program is free software: you can redistribute it and/or modify it under
 * the terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or any later version.
 *
 * This program is distributed in the hope that it will be useful, but WITHOUT
 * ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
 * FOR A PARTICULAR PURPOSE.  See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * this program. If not, see https://www.gnu.org/licenses/.
 *
*/

//! The delivery orchestrator (spec §4.7): drives one transaction through
//! `Init → Opening → Open → Bodying → Committed | Aborted`.

use std::collections::HashMap;
use std::sync::Arc;

use dispatch_common::{Body, Header};

use crate::backend::BackendMultiplexer;
use crate::capability::StatusCollector;
use crate::checks::{CheckRunner, Verdict};
use crate::error::DispatchError;
use crate::matcher::{self, MatchKind};
use crate::meta::MsgMeta;
use crate::modifiers::ModifierStack;
use crate::routing::{Dispatcher, RcptBlock, SourceBlock};
use crate::status_collector::OriginalRcptCollector;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Open,
    Committed,
    Aborted,
}

/// One in-flight transaction (spec §6: `Delivery`). Created by
/// [`Dispatcher::start`], driven by `add_rcpt`/`body`/`body_non_atomic`,
/// and finalized by exactly one of `commit`/`abort`.
pub struct Delivery {
    dispatcher: Arc<Dispatcher>,
    meta: MsgMeta,
    state: State,
    source_addr: String,
    source_block: Arc<SourceBlock>,
    checks: CheckRunner,
    global_modifiers: ModifierStack,
    source_modifiers: ModifierStack,
    rcpt_modifiers: HashMap<usize, ModifierStack>,
    backends: BackendMultiplexer,
}

fn rcpt_block_id(block: &Arc<RcptBlock>) -> usize {
    Arc::as_ptr(block).cast::<()>() as usize
}

impl Dispatcher {
    /// `Start(msg_meta, mail_from)` (spec §4.7, §6): `Init → Opening →
    /// Open`. On any failure, every session opened so far is closed before
    /// the error is returned; no backend has been started yet, so there is
    /// nothing to abort.
    ///
    /// # Errors
    ///
    /// See spec §7's error table for `Start`.
    #[tracing::instrument(level = "debug", skip(self, meta))]
    pub async fn start(self: &Arc<Self>, meta: MsgMeta, mail_from: &str) -> Result<Delivery, DispatchError> {
        if meta.cancel.is_cancelled() {
            return Err(DispatchError::Cancelled);
        }

        let mut checks = CheckRunner::new();

        checks.check_conn_sender(&self.global_checks, &meta, mail_from).await?;

        let mut global_modifiers = ModifierStack::open(&self.global_modifiers, &meta).await?;

        let mail_from = match global_modifiers.rewrite_sender(mail_from).await {
            Ok(v) => v,
            Err(err) => {
                global_modifiers.close().await;
                return Err(err);
            }
        };

        let (source_block, kind): (&Arc<SourceBlock>, MatchKind) =
            match matcher::match_entry(&mail_from, &self.per_source, &self.default_source, true) {
                Ok(v) => v,
                Err(err) => {
                    global_modifiers.close().await;
                    return Err(err);
                }
            };
        tracing::debug!(%kind, "source matched");
        let source_block = source_block.clone();

        if let Some(status) = &source_block.reject_error {
            let status = status.clone();
            global_modifiers.close().await;
            return Err(DispatchError::BlockRejected(status));
        }

        if let Err(err) = checks.check_conn_sender(&source_block.checks, &meta, &mail_from).await {
            global_modifiers.close().await;
            return Err(err);
        }

        let mut source_modifiers = match ModifierStack::open(&source_block.modifiers, &meta).await {
            Ok(m) => m,
            Err(err) => {
                global_modifiers.close().await;
                return Err(err);
            }
        };

        let source_addr = match source_modifiers.rewrite_sender(&mail_from).await {
            Ok(v) => v,
            Err(err) => {
                source_modifiers.close().await;
                global_modifiers.close().await;
                return Err(err);
            }
        };

        tracing::debug!(%source_addr, "transaction opened");

        Ok(Delivery {
            dispatcher: self.clone(),
            meta,
            state: State::Open,
            source_addr,
            source_block,
            checks,
            global_modifiers,
            source_modifiers,
            rcpt_modifiers: HashMap::new(),
            backends: BackendMultiplexer::new(),
        })
    }
}

impl Delivery {
    fn ensure_open(&self) -> Result<(), DispatchError> {
        if self.state != State::Open {
            return Err(DispatchError::InvalidState("operation requires the transaction to be open"));
        }
        if self.meta.cancel.is_cancelled() {
            return Err(DispatchError::Cancelled);
        }
        Ok(())
    }

    /// `AddRcpt(to)` (spec §4.7): permitted only while the transaction is
    /// open.
    ///
    /// # Errors
    ///
    /// See spec §7's error table for `AddRcpt`.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn add_rcpt(&mut self, to: &str) -> Result<(), DispatchError> {
        self.ensure_open()?;

        self.checks
            .check_rcpt(&self.dispatcher.global_checks, &self.meta, to)
            .await?;
        self.checks
            .check_rcpt(&self.source_block.checks, &self.meta, to)
            .await?;

        let rewritten = self.global_modifiers.rewrite_rcpt(to).await?;
        let rewritten = self.source_modifiers.rewrite_rcpt(&rewritten).await?;

        let (rcpt_block, kind) = matcher::match_entry(
            &rewritten,
            &self.source_block.per_rcpt,
            &self.source_block.default_rcpt,
            false,
        )?;
        tracing::debug!(%kind, rcpt = %rewritten, "rcpt matched");
        let rcpt_block = rcpt_block.clone();

        if let Some(status) = &rcpt_block.reject_error {
            return Err(DispatchError::BlockRejected(status.clone()));
        }

        self.checks
            .check_rcpt(&rcpt_block.checks, &self.meta, &rewritten)
            .await?;

        let block_id = rcpt_block_id(&rcpt_block);
        if let std::collections::hash_map::Entry::Vacant(entry) = self.rcpt_modifiers.entry(block_id) {
            let mut stack = ModifierStack::open(&rcpt_block.modifiers, &self.meta).await?;
            match stack.rewrite_sender(&self.source_addr).await {
                Ok(resender) if resender != self.source_addr => {
                    tracing::warn!(
                        source_addr = %self.source_addr,
                        attempted = %resender,
                        "rcpt-scope modifier attempted to change the envelope sender, discarding",
                    );
                }
                Ok(_) => {}
                Err(err) => {
                    stack.close().await;
                    return Err(err);
                }
            }
            entry.insert(stack);
        }
        #[allow(clippy::unwrap_used)]
        let rcpt_stack = self.rcpt_modifiers.get_mut(&block_id).unwrap();

        let final_rcpt = rcpt_stack.rewrite_rcpt(&rewritten).await?;
        self.meta.record_rewrite(&final_rcpt, to);

        for target in &rcpt_block.targets {
            if self.meta.cancel.is_cancelled() {
                return Err(DispatchError::Cancelled);
            }
            let target_id = self.backends.get_or_start(target, &self.meta, &self.source_addr).await?;
            self.backends.fan_add_rcpt(target_id, &final_rcpt, to).await?;
        }

        Ok(())
    }

    /// `Body(header, body)` (spec §4.7): atomic, `Open → Bodying → Open`
    /// (or fail).
    ///
    /// # Errors
    ///
    /// See spec §7's error table for `Body`.
    #[tracing::instrument(level = "debug", skip(self, header, body))]
    pub async fn body(&mut self, header: &mut dyn Header, body: &mut dyn Body) -> Result<(), DispatchError> {
        self.ensure_open()?;

        self.checks
            .check_body(&self.dispatcher.global_checks, &self.meta, header, body)
            .await?;
        self.checks
            .check_body(&self.source_block.checks, &self.meta, header, body)
            .await?;

        let verdict = self.checks.apply_results(
            &self.dispatcher.hostname,
            header,
            self.dispatcher.reject_score,
            self.dispatcher.quarantine_score,
        )?;
        if verdict == Verdict::Quarantine {
            self.meta.set_quarantined();
        }

        self.global_modifiers.rewrite_body(header, body).await?;
        self.source_modifiers.rewrite_body(header, body).await?;

        self.backends.fan_body_atomic(&self.meta, header, body).await?;
        Ok(())
    }

    /// `BodyNonAtomic(collector, header, body)` (spec §4.7): same prelude
    /// as `body`, but any prelude error is broadcast via `collector` for
    /// every original recipient across all open sessions instead of being
    /// returned. Never raises.
    #[tracing::instrument(level = "debug", skip(self, collector, header, body))]
    pub async fn body_non_atomic(
        &mut self,
        collector: &mut dyn StatusCollector,
        header: &mut dyn Header,
        body: &mut dyn Body,
    ) {
        if let Err(err) = self.ensure_open() {
            self.broadcast_prelude_failure(collector, &err);
            return;
        }

        if let Err(err) = self
            .checks
            .check_body(&self.dispatcher.global_checks, &self.meta, header, body)
            .await
        {
            self.broadcast_prelude_failure(collector, &err);
            return;
        }
        if let Err(err) = self.checks.check_body(&self.source_block.checks, &self.meta, header, body).await {
            self.broadcast_prelude_failure(collector, &err);
            return;
        }

        let verdict = match self.checks.apply_results(
            &self.dispatcher.hostname,
            header,
            self.dispatcher.reject_score,
            self.dispatcher.quarantine_score,
        ) {
            Ok(v) => v,
            Err(err) => {
                self.broadcast_prelude_failure(collector, &err);
                return;
            }
        };
        if verdict == Verdict::Quarantine {
            self.meta.set_quarantined();
        }

        if let Err(err) = self.global_modifiers.rewrite_body(header, body).await {
            self.broadcast_prelude_failure(collector, &err);
            return;
        }
        if let Err(err) = self.source_modifiers.rewrite_body(header, body).await {
            self.broadcast_prelude_failure(collector, &err);
            return;
        }

        let meta = self.meta.clone();
        let mut adapter = OriginalRcptCollector::new(meta, collector);
        self.backends.fan_body_streaming(&self.meta, &mut adapter, header, body).await;
    }

    fn broadcast_prelude_failure(&self, collector: &mut dyn StatusCollector, err: &DispatchError) {
        for rcpt in self.backends.recipients_of_all() {
            collector.set_status(rcpt, Some(err));
        }
    }

    /// `Commit` (spec §4.7): terminal. Closes all modifier sessions and
    /// the check runner, then commits each backend session in order; the
    /// first failure stops further commits and is returned.
    ///
    /// # Errors
    ///
    /// The first backend's `Commit` failure.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn commit(mut self) -> Result<(), DispatchError> {
        self.close_sessions().await;
        self.state = State::Committed;
        self.backends.commit_all().await
    }

    /// `Abort` (spec §4.7): terminal. Closes all modifier sessions and the
    /// check runner, then aborts every backend session regardless of
    /// individual failures, returning the last one observed.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn abort(mut self) -> Result<(), DispatchError> {
        self.close_sessions().await;
        self.state = State::Aborted;
        self.backends.abort_all().await
    }

    async fn close_sessions(&mut self) {
        self.global_modifiers.close().await;
        self.source_modifiers.close().await;
        for stack in self.rcpt_modifiers.values_mut() {
            stack.close().await;
        }
        self.checks.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{
        Check, CheckOutcome, DeliverySession, DeliveryTarget, Modifier, ModifierState, StatusCollector,
        StreamingDelivery,
    };
    use crate::routing::{DispatcherBuilder, RcptBlockBuilder, SourceBlockBuilder};
    use dispatch_common::{InMemoryBody, SimpleHeader};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct RecordingTarget {
        name: String,
        calls: Arc<Mutex<Vec<String>>>,
    }

    struct RecordingSession {
        name: String,
        calls: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait::async_trait]
    impl DeliveryTarget for RecordingTarget {
        fn name(&self) -> &str {
            "recording"
        }
        fn instance_name(&self) -> &str {
            &self.name
        }
        async fn start(&self, _: &MsgMeta, _: &str) -> Result<Box<dyn DeliverySession>, DispatchError> {
            self.calls.lock().unwrap().push(format!("{}.Start", self.name));
            Ok(Box::new(RecordingSession {
                name: self.name.clone(),
                calls: self.calls.clone(),
            }))
        }
    }

    #[async_trait::async_trait]
    impl DeliverySession for RecordingSession {
        async fn add_rcpt(&mut self, to: &str) -> Result<(), DispatchError> {
            self.calls.lock().unwrap().push(format!("{}.AddRcpt({to})", self.name));
            Ok(())
        }
        async fn body(&mut self, _: &mut dyn Header, _: &dyn Body) -> Result<(), DispatchError> {
            self.calls.lock().unwrap().push(format!("{}.Body", self.name));
            Ok(())
        }
        async fn commit(&mut self) -> Result<(), DispatchError> {
            self.calls.lock().unwrap().push(format!("{}.Commit", self.name));
            Ok(())
        }
        async fn abort(&mut self) -> Result<(), DispatchError> {
            self.calls.lock().unwrap().push(format!("{}.Abort", self.name));
            Ok(())
        }
    }

    fn meta() -> MsgMeta {
        MsgMeta::new(tokio_util::sync::CancellationToken::new())
    }

    /// Spec §5: a cancelled token is observed promptly, even before the
    /// first check or match runs.
    #[tokio::test]
    async fn start_fails_fast_on_an_already_cancelled_token() {
        let target: Arc<dyn DeliveryTarget> = Arc::new(RecordingTarget {
            name: "T1".into(),
            calls: Arc::new(Mutex::new(Vec::new())),
        });
        let rcpt_block = Arc::new(RcptBlockBuilder::new().target(target).build().unwrap());
        let source_block = Arc::new(SourceBlockBuilder::new().default_rcpt(rcpt_block).build().unwrap());
        let dispatcher = Arc::new(DispatcherBuilder::new().hostname("mx.example").default_source(source_block).build().unwrap());

        let meta = meta();
        meta.cancel.cancel();
        let err = dispatcher.start(meta, "alice@a.example").await.unwrap_err();
        assert!(matches!(err, DispatchError::Cancelled));
    }

    /// Spec §5: the `AddRcpt` backend fan-out loop re-checks cancellation
    /// before reaching the next target, even once past `ensure_open`'s
    /// entry check — here the first target's `Start` is what cancels the
    /// token, simulating cancellation racing in mid-fan-out.
    #[tokio::test]
    async fn add_rcpt_stops_fanning_out_once_cancelled_mid_loop() {
        struct CancelsOnStart {
            calls: Arc<Mutex<Vec<String>>>,
            cancel: tokio_util::sync::CancellationToken,
        }
        #[async_trait::async_trait]
        impl DeliveryTarget for CancelsOnStart {
            fn name(&self) -> &str {
                "cancels-on-start"
            }
            fn instance_name(&self) -> &str {
                "T1"
            }
            async fn start(&self, _: &MsgMeta, _: &str) -> Result<Box<dyn DeliverySession>, DispatchError> {
                self.calls.lock().unwrap().push("T1.Start".to_owned());
                self.cancel.cancel();
                Ok(Box::new(RecordingSession {
                    name: "T1".into(),
                    calls: self.calls.clone(),
                }))
            }
        }

        let calls = Arc::new(Mutex::new(Vec::new()));
        let meta = meta();
        let t1: Arc<dyn DeliveryTarget> = Arc::new(CancelsOnStart {
            calls: calls.clone(),
            cancel: meta.cancel.clone(),
        });
        let t2: Arc<dyn DeliveryTarget> = Arc::new(RecordingTarget {
            name: "T2".into(),
            calls: calls.clone(),
        });
        let rcpt_block = Arc::new(RcptBlockBuilder::new().target(t1).target(t2).build().unwrap());
        let source_block = Arc::new(SourceBlockBuilder::new().default_rcpt(rcpt_block).build().unwrap());
        let dispatcher = Arc::new(DispatcherBuilder::new().hostname("mx.example").default_source(source_block).build().unwrap());

        let mut delivery = dispatcher.start(meta, "alice@a.example").await.unwrap();
        let err = delivery.add_rcpt("bob@b.example").await.unwrap_err();
        assert!(matches!(err, DispatchError::Cancelled));
        assert_eq!(
            *calls.lock().unwrap(),
            vec!["T1.Start".to_owned(), "T1.AddRcpt(bob@b.example)".to_owned()]
        );
    }

    /// S1 — default routing, single target.
    #[tokio::test]
    async fn default_routing_single_target() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let target: Arc<dyn DeliveryTarget> = Arc::new(RecordingTarget {
            name: "T1".into(),
            calls: calls.clone(),
        });
        let rcpt_block = Arc::new(RcptBlockBuilder::new().target(target).build().unwrap());
        let source_block = Arc::new(SourceBlockBuilder::new().default_rcpt(rcpt_block).build().unwrap());
        let dispatcher = Arc::new(
            DispatcherBuilder::new()
                .hostname("mx.example")
                .reject_score(10)
                .quarantine_score(5)
                .default_source(source_block)
                .build()
                .unwrap(),
        );

        let mut delivery = dispatcher.start(meta(), "alice@a.example").await.unwrap();
        delivery.add_rcpt("bob@b.example").await.unwrap();
        let mut header = SimpleHeader::new();
        let mut body = InMemoryBody::new(b"hi".to_vec());
        delivery.body(&mut header, &mut body).await.unwrap();
        delivery.commit().await.unwrap();

        let calls = calls.lock().unwrap();
        assert_eq!(
            *calls,
            vec![
                "T1.Start".to_owned(),
                "T1.AddRcpt(bob@b.example)".to_owned(),
                "T1.Body".to_owned(),
                "T1.Commit".to_owned(),
            ]
        );
    }

    /// S4 — empty sender is allowed, falls through to default_source.
    #[tokio::test]
    async fn empty_sender_does_not_raise() {
        let target: Arc<dyn DeliveryTarget> = Arc::new(RecordingTarget {
            name: "T1".into(),
            calls: Arc::new(Mutex::new(Vec::new())),
        });
        let rcpt_block = Arc::new(RcptBlockBuilder::new().target(target).build().unwrap());
        let source_block = Arc::new(SourceBlockBuilder::new().default_rcpt(rcpt_block).build().unwrap());
        let dispatcher = Arc::new(
            DispatcherBuilder::new()
                .hostname("mx.example")
                .default_source(source_block)
                .build()
                .unwrap(),
        );

        assert!(dispatcher.start(meta(), "").await.is_ok());
    }

    /// S5 — block-level reject short-circuits Start before source checks or
    /// modifiers run.
    #[tokio::test]
    async fn source_block_reject_error_short_circuits_start() {
        struct PanicsCheck;
        #[async_trait::async_trait]
        impl Check for PanicsCheck {
            async fn check_conn_sender(&self, _: &MsgMeta, _: &str) -> CheckOutcome {
                panic!("source checks must not run after a block-level reject");
            }
            async fn check_rcpt(&self, _: &MsgMeta, _: &str) -> CheckOutcome {
                CheckOutcome::Ok
            }
            async fn check_body(&self, _: &MsgMeta, _: &mut dyn Header, _: &dyn Body) -> CheckOutcome {
                CheckOutcome::Ok
            }
        }

        let target: Arc<dyn DeliveryTarget> = Arc::new(RecordingTarget {
            name: "T1".into(),
            calls: Arc::new(Mutex::new(Vec::new())),
        });
        let rcpt_block = Arc::new(RcptBlockBuilder::new().target(target).build().unwrap());
        let rejecting_status = dispatch_common::EnhancedStatus {
            code: 550,
            enhanced: "5.7.1",
            message: "no thanks".into(),
        };
        let source_block = Arc::new(
            SourceBlockBuilder::new()
                .check(Arc::new(PanicsCheck))
                .reject_error(rejecting_status)
                .default_rcpt(rcpt_block)
                .build()
                .unwrap(),
        );
        let dispatcher = Arc::new(
            DispatcherBuilder::new()
                .hostname("mx.example")
                .default_source(source_block)
                .build()
                .unwrap(),
        );

        let err = dispatcher.start(meta(), "eve@e.example").await.unwrap_err();
        assert!(matches!(err, DispatchError::BlockRejected(_)));
    }

    /// S6 — a commit failure stops remaining commits.
    #[tokio::test]
    async fn commit_failure_stops_remaining_commits() {
        struct FailingSession;
        #[async_trait::async_trait]
        impl DeliverySession for FailingSession {
            async fn add_rcpt(&mut self, _: &str) -> Result<(), DispatchError> {
                Ok(())
            }
            async fn body(&mut self, _: &mut dyn Header, _: &dyn Body) -> Result<(), DispatchError> {
                Ok(())
            }
            async fn commit(&mut self) -> Result<(), DispatchError> {
                Err(DispatchError::Backend {
                    target: "T1".into(),
                    source: "boom".into(),
                })
            }
            async fn abort(&mut self) -> Result<(), DispatchError> {
                Ok(())
            }
        }
        struct FailingTarget;
        #[async_trait::async_trait]
        impl DeliveryTarget for FailingTarget {
            fn name(&self) -> &str {
                "failing"
            }
            fn instance_name(&self) -> &str {
                "T1"
            }
            async fn start(&self, _: &MsgMeta, _: &str) -> Result<Box<dyn DeliverySession>, DispatchError> {
                Ok(Box::new(FailingSession))
            }
        }

        let t2_commits = Arc::new(AtomicUsize::new(0));
        struct CountingSession(Arc<AtomicUsize>);
        #[async_trait::async_trait]
        impl DeliverySession for CountingSession {
            async fn add_rcpt(&mut self, _: &str) -> Result<(), DispatchError> {
                Ok(())
            }
            async fn body(&mut self, _: &mut dyn Header, _: &dyn Body) -> Result<(), DispatchError> {
                Ok(())
            }
            async fn commit(&mut self) -> Result<(), DispatchError> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            async fn abort(&mut self) -> Result<(), DispatchError> {
                Ok(())
            }
        }
        struct CountingTarget(Arc<AtomicUsize>);
        #[async_trait::async_trait]
        impl DeliveryTarget for CountingTarget {
            fn name(&self) -> &str {
                "counting"
            }
            fn instance_name(&self) -> &str {
                "T2"
            }
            async fn start(&self, _: &MsgMeta, _: &str) -> Result<Box<dyn DeliverySession>, DispatchError> {
                Ok(Box::new(CountingSession(self.0.clone())))
            }
        }

        let t1: Arc<dyn DeliveryTarget> = Arc::new(FailingTarget);
        let t2: Arc<dyn DeliveryTarget> = Arc::new(CountingTarget(t2_commits.clone()));
        let rcpt_block = Arc::new(RcptBlockBuilder::new().target(t1).target(t2).build().unwrap());
        let source_block = Arc::new(SourceBlockBuilder::new().default_rcpt(rcpt_block).build().unwrap());
        let dispatcher = Arc::new(DispatcherBuilder::new().hostname("mx.example").default_source(source_block).build().unwrap());

        let mut delivery = dispatcher.start(meta(), "alice@a.example").await.unwrap();
        delivery.add_rcpt("bob@b.example").await.unwrap();
        let mut header = SimpleHeader::new();
        let mut body = InMemoryBody::new(b"hi".to_vec());
        delivery.body(&mut header, &mut body).await.unwrap();

        let err = delivery.commit().await.unwrap_err();
        assert!(matches!(err, DispatchError::Backend { .. }));
        assert_eq!(t2_commits.load(Ordering::SeqCst), 0);
    }

    /// S3 — a source-scope rcpt rewrite is recorded under the original.
    #[tokio::test]
    async fn rcpt_rewrite_is_recorded_under_the_original() {
        struct RewriteOnce;
        #[async_trait::async_trait]
        impl ModifierState for RewriteOnce {
            async fn rewrite_sender(&mut self, mail_from: &str) -> Result<String, DispatchError> {
                Ok(mail_from.to_owned())
            }
            async fn rewrite_rcpt(&mut self, rcpt: &str) -> Result<String, DispatchError> {
                if rcpt == "bob@b.example" {
                    Ok("robert@b.example".to_owned())
                } else {
                    Ok(rcpt.to_owned())
                }
            }
            async fn rewrite_body(&mut self, _: &mut dyn Header, _: &mut dyn Body) -> Result<(), DispatchError> {
                Ok(())
            }
            async fn close(&mut self) {}
        }
        struct RewriteOnceFactory;
        #[async_trait::async_trait]
        impl Modifier for RewriteOnceFactory {
            async fn open(&self, _: &MsgMeta) -> Result<Box<dyn ModifierState>, DispatchError> {
                Ok(Box::new(RewriteOnce))
            }
        }

        let target: Arc<dyn DeliveryTarget> = Arc::new(RecordingTarget {
            name: "T1".into(),
            calls: Arc::new(Mutex::new(Vec::new())),
        });
        let rcpt_block = Arc::new(RcptBlockBuilder::new().target(target).build().unwrap());
        let source_block = Arc::new(
            SourceBlockBuilder::new()
                .modifier(Arc::new(RewriteOnceFactory))
                .default_rcpt(rcpt_block)
                .build()
                .unwrap(),
        );
        let dispatcher = Arc::new(DispatcherBuilder::new().hostname("mx.example").default_source(source_block).build().unwrap());

        let mut delivery = dispatcher.start(meta(), "alice@a.example").await.unwrap();
        delivery.add_rcpt("bob@b.example").await.unwrap();
        assert_eq!(delivery.meta.original_of("robert@b.example"), "bob@b.example");
    }

    /// Property 6: a rcpt-scope modifier that tries to change the envelope
    /// sender is observed (its session still opens and its `rewrite_rcpt`
    /// still runs) but the attempted sender change is discarded —
    /// `source_addr` stays exactly what it was after the source-scope
    /// rewrite.
    #[tokio::test]
    async fn rcpt_scope_sender_rewrite_is_discarded() {
        struct HijackSender;
        #[async_trait::async_trait]
        impl ModifierState for HijackSender {
            async fn rewrite_sender(&mut self, _: &str) -> Result<String, DispatchError> {
                Ok("mallory@evil.example".to_owned())
            }
            async fn rewrite_rcpt(&mut self, rcpt: &str) -> Result<String, DispatchError> {
                Ok(rcpt.to_owned())
            }
            async fn rewrite_body(&mut self, _: &mut dyn Header, _: &mut dyn Body) -> Result<(), DispatchError> {
                Ok(())
            }
            async fn close(&mut self) {}
        }
        struct HijackSenderFactory;
        #[async_trait::async_trait]
        impl Modifier for HijackSenderFactory {
            async fn open(&self, _: &MsgMeta) -> Result<Box<dyn ModifierState>, DispatchError> {
                Ok(Box::new(HijackSender))
            }
        }

        let target: Arc<dyn DeliveryTarget> = Arc::new(RecordingTarget {
            name: "T1".into(),
            calls: Arc::new(Mutex::new(Vec::new())),
        });
        let rcpt_block = Arc::new(
            RcptBlockBuilder::new()
                .modifier(Arc::new(HijackSenderFactory))
                .target(target)
                .build()
                .unwrap(),
        );
        let source_block = Arc::new(SourceBlockBuilder::new().default_rcpt(rcpt_block).build().unwrap());
        let dispatcher = Arc::new(DispatcherBuilder::new().hostname("mx.example").default_source(source_block).build().unwrap());

        let mut delivery = dispatcher.start(meta(), "alice@a.example").await.unwrap();
        assert_eq!(delivery.source_addr, "alice@a.example");
        delivery.add_rcpt("bob@b.example").await.unwrap();
        assert_eq!(delivery.source_addr, "alice@a.example");
    }

    /// Property 5: the empty envelope sender never produces an
    /// invalid-address error, even with a populated per_source table.
    #[tokio::test]
    async fn empty_sender_with_nonempty_source_table_still_falls_back() {
        let target: Arc<dyn DeliveryTarget> = Arc::new(RecordingTarget {
            name: "T1".into(),
            calls: Arc::new(Mutex::new(Vec::new())),
        });
        let rcpt_block = Arc::new(RcptBlockBuilder::new().target(target).build().unwrap());
        let default_source = Arc::new(SourceBlockBuilder::new().default_rcpt(rcpt_block.clone()).build().unwrap());
        let named_source = Arc::new(SourceBlockBuilder::new().default_rcpt(rcpt_block).build().unwrap());
        let dispatcher = Arc::new(
            DispatcherBuilder::new()
                .hostname("mx.example")
                .source("a.example", named_source)
                .default_source(default_source)
                .build()
                .unwrap(),
        );

        assert!(dispatcher.start(meta(), "").await.is_ok());
    }

    /// Unlike the sender case, an empty or unsplittable recipient is always
    /// an invalid-address error (spec §4.7 `AddRcpt` step 3).
    #[tokio::test]
    async fn empty_rcpt_is_an_invalid_address_error() {
        let target: Arc<dyn DeliveryTarget> = Arc::new(RecordingTarget {
            name: "T1".into(),
            calls: Arc::new(Mutex::new(Vec::new())),
        });
        let rcpt_block = Arc::new(RcptBlockBuilder::new().target(target).build().unwrap());
        let source_block = Arc::new(SourceBlockBuilder::new().default_rcpt(rcpt_block).build().unwrap());
        let dispatcher = Arc::new(DispatcherBuilder::new().hostname("mx.example").default_source(source_block).build().unwrap());

        let mut delivery = dispatcher.start(meta(), "alice@a.example").await.unwrap();
        let err = delivery.add_rcpt("").await.unwrap_err();
        assert!(matches!(err, DispatchError::InvalidAddress(_)));
    }

    #[derive(Default)]
    struct RecordingCollector {
        reports: Vec<(String, bool)>,
    }

    impl StatusCollector for RecordingCollector {
        fn set_status(&mut self, rcpt: &str, err: Option<&DispatchError>) {
            self.reports.push((rcpt.to_owned(), err.is_some()));
        }
    }

    /// A non-streaming backend: `body_non_atomic` fan-out falls back to its
    /// atomic `body`, which fails here.
    struct PlainFailingSession;
    #[async_trait::async_trait]
    impl DeliverySession for PlainFailingSession {
        async fn add_rcpt(&mut self, _: &str) -> Result<(), DispatchError> {
            Ok(())
        }
        async fn body(&mut self, _: &mut dyn Header, _: &dyn Body) -> Result<(), DispatchError> {
            Err(DispatchError::Backend {
                target: "plain".into(),
                source: "disk full".into(),
            })
        }
        async fn commit(&mut self) -> Result<(), DispatchError> {
            Ok(())
        }
        async fn abort(&mut self) -> Result<(), DispatchError> {
            Ok(())
        }
    }
    struct PlainFailingTarget;
    #[async_trait::async_trait]
    impl DeliveryTarget for PlainFailingTarget {
        fn name(&self) -> &str {
            "plain"
        }
        fn instance_name(&self) -> &str {
            "T_plain"
        }
        async fn start(&self, _: &MsgMeta, _: &str) -> Result<Box<dyn DeliverySession>, DispatchError> {
            Ok(Box::new(PlainFailingSession))
        }
    }

    /// A streaming backend: reports its own per-recipient status through the
    /// wrapped collector instead of being driven atomically.
    struct StreamingSession {
        reported: Arc<Mutex<Vec<String>>>,
    }
    #[async_trait::async_trait]
    impl DeliverySession for StreamingSession {
        async fn add_rcpt(&mut self, _: &str) -> Result<(), DispatchError> {
            Ok(())
        }
        async fn body(&mut self, _: &mut dyn Header, _: &dyn Body) -> Result<(), DispatchError> {
            panic!("a streaming session must be driven via body_non_atomic, not atomic body");
        }
        async fn commit(&mut self) -> Result<(), DispatchError> {
            Ok(())
        }
        async fn abort(&mut self) -> Result<(), DispatchError> {
            Ok(())
        }
        fn as_streaming(&mut self) -> Option<&mut dyn StreamingDelivery> {
            Some(self)
        }
    }
    #[async_trait::async_trait]
    impl StreamingDelivery for StreamingSession {
        async fn body_non_atomic(
            &mut self,
            collector: &mut dyn StatusCollector,
            _: &mut dyn Header,
            _: &dyn Body,
        ) -> Result<(), DispatchError> {
            self.reported.lock().unwrap().push("carol@c.example".to_owned());
            collector.set_status("carol@c.example", None);
            Ok(())
        }
    }
    struct StreamingTarget {
        reported: Arc<Mutex<Vec<String>>>,
    }
    #[async_trait::async_trait]
    impl DeliveryTarget for StreamingTarget {
        fn name(&self) -> &str {
            "streaming"
        }
        fn instance_name(&self) -> &str {
            "T_stream"
        }
        async fn start(&self, _: &MsgMeta, _: &str) -> Result<Box<dyn DeliverySession>, DispatchError> {
            Ok(Box::new(StreamingSession {
                reported: self.reported.clone(),
            }))
        }
    }

    /// Property 9 + the second half of S3: a non-atomic body fan-out hands
    /// the wrapped collector to a streaming backend and falls back to atomic
    /// `body` (reporting the failure to every recipient it owns, translated
    /// back to the client-presented address) for a non-streaming one.
    #[tokio::test]
    async fn body_non_atomic_drives_streaming_and_plain_backends() {
        struct RewriteBobToRobert;
        #[async_trait::async_trait]
        impl ModifierState for RewriteBobToRobert {
            async fn rewrite_sender(&mut self, mail_from: &str) -> Result<String, DispatchError> {
                Ok(mail_from.to_owned())
            }
            async fn rewrite_rcpt(&mut self, rcpt: &str) -> Result<String, DispatchError> {
                if rcpt == "bob@b.example" {
                    Ok("robert@b.example".to_owned())
                } else {
                    Ok(rcpt.to_owned())
                }
            }
            async fn rewrite_body(&mut self, _: &mut dyn Header, _: &mut dyn Body) -> Result<(), DispatchError> {
                Ok(())
            }
            async fn close(&mut self) {}
        }
        struct RewriteBobToRobertFactory;
        #[async_trait::async_trait]
        impl Modifier for RewriteBobToRobertFactory {
            async fn open(&self, _: &MsgMeta) -> Result<Box<dyn ModifierState>, DispatchError> {
                Ok(Box::new(RewriteBobToRobert))
            }
        }

        let reported = Arc::new(Mutex::new(Vec::new()));
        let plain_target: Arc<dyn DeliveryTarget> = Arc::new(PlainFailingTarget);
        let stream_target: Arc<dyn DeliveryTarget> = Arc::new(StreamingTarget {
            reported: reported.clone(),
        });

        let default_rcpt = Arc::new(RcptBlockBuilder::new().target(plain_target).build().unwrap());
        let stream_rcpt = Arc::new(RcptBlockBuilder::new().target(stream_target).build().unwrap());
        let source_block = Arc::new(
            SourceBlockBuilder::new()
                .modifier(Arc::new(RewriteBobToRobertFactory))
                .rcpt("c.example", stream_rcpt)
                .default_rcpt(default_rcpt)
                .build()
                .unwrap(),
        );
        let dispatcher = Arc::new(
            DispatcherBuilder::new()
                .hostname("mx.example")
                .default_source(source_block)
                .build()
                .unwrap(),
        );

        let mut delivery = dispatcher.start(meta(), "alice@a.example").await.unwrap();
        delivery.add_rcpt("bob@b.example").await.unwrap();
        delivery.add_rcpt("carol@c.example").await.unwrap();

        let mut collector = RecordingCollector::default();
        let mut header = SimpleHeader::new();
        let mut body = InMemoryBody::new(b"hi".to_vec());
        delivery.body_non_atomic(&mut collector, &mut header, &mut body).await;

        assert_eq!(*reported.lock().unwrap(), vec!["carol@c.example".to_owned()]);
        assert!(collector.reports.contains(&("bob@b.example".to_owned(), true)));
        assert!(collector.reports.contains(&("carol@c.example".to_owned(), false)));
    }
}
