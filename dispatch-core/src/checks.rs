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

//! Check runner (spec §4.2): run check callables at a transaction stage,
//! accumulate their score contributions and header annotations, and at the
//! body phase apply the aggregated verdict.

use std::sync::Arc;

use dispatch_common::{Body, Header};

use crate::capability::{Check, CheckOutcome};
use crate::error::DispatchError;
use crate::meta::MsgMeta;

/// The verdict `apply_results` (spec §4.2) produces, once, before body
/// rewriters run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Delivery proceeds normally.
    Proceed,
    /// Delivery proceeds, but `msg_meta` is flagged quarantined.
    Quarantine,
}

/// Accumulates check outcomes across all three stages of one transaction
/// (spec §3: "owns its own resources until `close`").
#[derive(Default)]
pub struct CheckRunner {
    score: i64,
    annotations: Vec<String>,
    closed: bool,
}

impl CheckRunner {
    /// A runner with no accumulated score or annotations yet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `checks` against the envelope sender (called once for global
    /// checks, then again for source checks, spec §4.2).
    ///
    /// # Errors
    ///
    /// [`DispatchError::Rejected`] on the first hard reject, which
    /// short-circuits the remaining checks in `checks` (spec §4.2).
    #[tracing::instrument(level = "debug", skip(self, checks, meta))]
    pub async fn check_conn_sender(
        &mut self,
        checks: &[Arc<dyn Check>],
        meta: &MsgMeta,
        mail_from: &str,
    ) -> Result<(), DispatchError> {
        for check in checks {
            if meta.cancel.is_cancelled() {
                return Err(DispatchError::Cancelled);
            }
            self.absorb(check.check_conn_sender(meta, mail_from).await)?;
        }
        Ok(())
    }

    /// Run `checks` against one recipient (called for global, source, then
    /// rcpt checks, per recipient, spec §4.2).
    ///
    /// # Errors
    ///
    /// [`DispatchError::Rejected`] on the first hard reject.
    #[tracing::instrument(level = "debug", skip(self, checks, meta))]
    pub async fn check_rcpt(
        &mut self,
        checks: &[Arc<dyn Check>],
        meta: &MsgMeta,
        rcpt: &str,
    ) -> Result<(), DispatchError> {
        for check in checks {
            if meta.cancel.is_cancelled() {
                return Err(DispatchError::Cancelled);
            }
            self.absorb(check.check_rcpt(meta, rcpt).await)?;
        }
        Ok(())
    }

    /// Run `checks` against the assembled message (called for global, then
    /// source checks, spec §4.2; the open question in spec §9 preserves
    /// the absence of a third, rcpt-scope, call here).
    ///
    /// # Errors
    ///
    /// [`DispatchError::Rejected`] on the first hard reject.
    #[tracing::instrument(level = "debug", skip(self, checks, meta, header, body))]
    pub async fn check_body(
        &mut self,
        checks: &[Arc<dyn Check>],
        meta: &MsgMeta,
        header: &mut dyn Header,
        body: &dyn Body,
    ) -> Result<(), DispatchError> {
        for check in checks {
            if meta.cancel.is_cancelled() {
                return Err(DispatchError::Cancelled);
            }
            self.absorb(check.check_body(meta, header, body).await)?;
        }
        Ok(())
    }

    fn absorb(&mut self, outcome: CheckOutcome) -> Result<(), DispatchError> {
        match outcome {
            CheckOutcome::Ok => {}
            CheckOutcome::Score(delta) => self.score += delta,
            CheckOutcome::Annotate(fragment) => self.annotations.push(fragment),
            CheckOutcome::Reject(status) => return Err(DispatchError::Rejected(status)),
        }
        Ok(())
    }

    /// Prepend the aggregated `Authentication-Results` header and return
    /// the reject/quarantine verdict (spec §4.2). Called once, before body
    /// rewriters run.
    ///
    /// # Errors
    ///
    /// [`DispatchError::Rejected`] if the accumulated score reached
    /// `reject_score`.
    pub fn apply_results(
        &mut self,
        hostname: &str,
        header: &mut dyn Header,
        reject_score: i64,
        quarantine_score: i64,
    ) -> Result<Verdict, DispatchError> {
        let body = if self.annotations.is_empty() {
            "none".to_owned()
        } else {
            self.annotations.join("; ")
        };
        header.prepend("Authentication-Results", &format!("{hostname}; {body}"));

        if self.score >= reject_score {
            tracing::debug!(score = self.score, reject_score, "check score crossed reject threshold");
            return Err(DispatchError::Rejected(dispatch_common::EnhancedStatus {
                code: 550,
                enhanced: "5.7.1",
                message: format!("message rejected, score {} >= {reject_score}", self.score),
            }));
        }
        if self.score >= quarantine_score {
            tracing::debug!(score = self.score, quarantine_score, "check score crossed quarantine threshold");
            return Ok(Verdict::Quarantine);
        }
        Ok(Verdict::Proceed)
    }

    /// Release any per-check state. Idempotent.
    pub fn close(&mut self) {
        self.closed = true;
    }
}
