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

//! Backend multiplexer (spec §4.5): lazily start one backend session per
//! distinct target, fan out `AddRcpt`/`Body`/`Commit`/`Abort`.

use std::sync::Arc;

use dispatch_common::{Body, Header};

use crate::capability::{DeliverySession, DeliveryTarget, StatusCollector};
use crate::error::DispatchError;
use crate::meta::MsgMeta;

/// A target's identity for the lifetime of one transaction: the pointer
/// value behind its `Arc`, stable as long as the `Arc` (owned by the
/// routing tree) lives.
pub type TargetId = usize;

/// Returns the identity `get_or_start`/`fan_*` key for `target`.
#[must_use]
pub fn target_id(target: &Arc<dyn DeliveryTarget>) -> TargetId {
    Arc::as_ptr(target).cast::<()>() as TargetId
}

struct OpenSession {
    id: TargetId,
    name: String,
    session: Box<dyn DeliverySession>,
    original_rcpts: Vec<String>,
}

/// One open session per distinct delivery backend referenced by any
/// recipient in the transaction (spec §3: `deliveries`).
#[derive(Default)]
pub struct BackendMultiplexer {
    deliveries: Vec<OpenSession>,
}

impl BackendMultiplexer {
    /// No backends started yet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start (or reuse) the session for `target` (spec §4.5 `get_or_start`).
    ///
    /// # Errors
    ///
    /// Propagates the target's `Start` failure; the caller is expected to
    /// abort the transaction (spec §4.5).
    #[tracing::instrument(level = "debug", skip(self, target, meta))]
    pub async fn get_or_start(
        &mut self,
        target: &Arc<dyn DeliveryTarget>,
        meta: &MsgMeta,
        mail_from: &str,
    ) -> Result<TargetId, DispatchError> {
        let id = target_id(target);
        if self.deliveries.iter().any(|d| d.id == id) {
            return Ok(id);
        }
        let session = target.start(meta, mail_from).await.map_err(|err| {
            tracing::debug!(target = target.instance_name(), "backend Start failed");
            err
        })?;
        self.deliveries.push(OpenSession {
            id,
            name: target.instance_name().to_owned(),
            session,
            original_rcpts: Vec::new(),
        });
        Ok(id)
    }

    /// Hand `target_id`'s session one more recipient (spec §4.5
    /// `fan_add_rcpt`).
    ///
    /// # Errors
    ///
    /// Propagates the backend's `AddRcpt` failure.
    pub async fn fan_add_rcpt(
        &mut self,
        target_id: TargetId,
        rewritten_to: &str,
        original_to: &str,
    ) -> Result<(), DispatchError> {
        let open = self.find_mut(target_id);
        open.session.add_rcpt(rewritten_to).await?;
        open.original_rcpts.push(original_to.to_owned());
        Ok(())
    }

    /// Hand every open session the final header/body, atomically (spec
    /// §4.5 `fan_body_atomic`): on the first error, return it, and do not
    /// call the remaining sessions — the caller aborts the transaction.
    ///
    /// # Errors
    ///
    /// The first backend's `Body` failure, or [`DispatchError::Cancelled`]
    /// if `meta`'s token is cancelled before the next session is reached
    /// (spec §5).
    pub async fn fan_body_atomic(
        &mut self,
        meta: &MsgMeta,
        header: &mut dyn Header,
        body: &dyn Body,
    ) -> Result<(), DispatchError> {
        for open in &mut self.deliveries {
            if meta.cancel.is_cancelled() {
                return Err(DispatchError::Cancelled);
            }
            open.session.body(header, body).await?;
        }
        Ok(())
    }

    /// Hand every open session the final header/body, streaming status
    /// through `collector` for sessions that support it and falling back
    /// to atomic `Body` (with the failure, if any, broadcast to every
    /// recipient of that session) for sessions that don't (spec §4.5
    /// `fan_body_streaming`). Never raises: per-recipient failures are
    /// reported through `collector`, not returned. If `meta`'s token is
    /// cancelled before a session is reached, that session (and every
    /// session after it) is reported cancelled via `collector` instead of
    /// being driven (spec §5).
    pub async fn fan_body_streaming(
        &mut self,
        meta: &MsgMeta,
        collector: &mut dyn StatusCollector,
        header: &mut dyn Header,
        body: &dyn Body,
    ) {
        for open in &mut self.deliveries {
            if meta.cancel.is_cancelled() {
                for rcpt in &open.original_rcpts {
                    collector.set_status(rcpt, Some(&DispatchError::Cancelled));
                }
                continue;
            }
            if let Some(streaming) = open.session.as_streaming() {
                if let Err(err) = streaming.body_non_atomic(collector, header, body).await {
                    tracing::warn!(target = open.name, %err, "streaming body_non_atomic failed");
                    for rcpt in &open.original_rcpts {
                        collector.set_status(rcpt, Some(&err));
                    }
                }
                // On success, the backend itself is responsible for having
                // reported status for each recipient (spec §9: do not
                // synthesize "ok" statuses in the adapter).
                continue;
            }
            if let Err(err) = open.session.body(header, body).await {
                tracing::warn!(target = open.name, %err, "non-streaming backend failed, reporting to all its recipients");
                for rcpt in &open.original_rcpts {
                    collector.set_status(rcpt, Some(&err));
                }
            }
        }
    }

    /// Commit every open session, in the order it was opened (spec §4.5
    /// `commit_all`): on the first error, stop and return it, leaving the
    /// remaining sessions uncommitted.
    ///
    /// # Errors
    ///
    /// The first backend's `Commit` failure.
    pub async fn commit_all(&mut self) -> Result<(), DispatchError> {
        for open in &mut self.deliveries {
            open.session.commit().await?;
        }
        Ok(())
    }

    /// Abort every open session regardless of individual failures (spec
    /// §4.5 `abort_all`: "best-effort cleanup"), returning the last error
    /// observed, if any.
    pub async fn abort_all(&mut self) -> Result<(), DispatchError> {
        let mut last_err = None;
        for open in &mut self.deliveries {
            if let Err(err) = open.session.abort().await {
                tracing::warn!(target = open.name, %err, "backend Abort failed, continuing with the rest");
                last_err = Some(err);
            }
        }
        match last_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Every original recipient routed to `target_id`'s session, used to
    /// broadcast a prelude-stage failure in `BodyNonAtomic` (spec §4.7).
    pub fn recipients_of_all(&self) -> Vec<&str> {
        self.deliveries
            .iter()
            .flat_map(|open| open.original_rcpts.iter().map(String::as_str))
            .collect()
    }

    fn find_mut(&mut self, id: TargetId) -> &mut OpenSession {
        #[allow(clippy::expect_used)]
        self.deliveries
            .iter_mut()
            .find(|d| d.id == id)
            .expect("target_id must come from a prior get_or_start call on this multiplexer")
    }
}
