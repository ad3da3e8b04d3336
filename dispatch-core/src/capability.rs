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

//! The capability interfaces named in spec §6: narrow, variant-free
//! polymorphism points the orchestrator is handed and drives, but never
//! implements itself. Every concrete check, modifier, and delivery backend
//! lives outside this crate (spec §1 Non-goals); tests exercise these
//! traits with in-memory fakes (spec §9).

use dispatch_common::{Body, EnhancedStatus, Header};

use crate::error::DispatchError;
use crate::meta::MsgMeta;

/// What a single [`Check`] call decided (spec §6: "`Outcome` carries either
/// a hard error, a score delta, or an auth-results annotation").
#[derive(Debug, Clone)]
pub enum CheckOutcome {
    /// No objection, nothing to report.
    Ok,
    /// No objection, but contribute a score delta to the transaction's
    /// running total (spec §4.2).
    Score(i64),
    /// No objection, and annotate the eventual `Authentication-Results`
    /// header with this fragment (e.g. `"spf=pass"`).
    Annotate(String),
    /// Immediately fail the calling stage (spec §4.2: "a hard reject at any
    /// stage short-circuits the stage").
    Reject(EnhancedStatus),
}

/// A policy check, run at up to three points in a transaction (spec §4.2).
#[async_trait::async_trait]
pub trait Check: Send + Sync {
    /// Run once per scope against the envelope sender.
    async fn check_conn_sender(&self, meta: &MsgMeta, mail_from: &str) -> CheckOutcome;

    /// Run once per scope, per recipient.
    async fn check_rcpt(&self, meta: &MsgMeta, rcpt: &str) -> CheckOutcome;

    /// Run once per scope against the assembled message.
    async fn check_body(&self, meta: &MsgMeta, header: &mut dyn Header, body: &dyn Body) -> CheckOutcome;
}

/// A per-transaction modifier session (spec §6: "Modifier state").
///
/// Exactly one of these is produced per [`Modifier`] per scope per
/// transaction, and exactly one `close` call releases it (spec §4.3,
/// §5 "Resource discipline").
#[async_trait::async_trait]
pub trait ModifierState: Send + Sync {
    /// Rewrite the envelope sender. Identity (`Ok(mail_from.to_owned())`) is
    /// a valid no-op implementation.
    async fn rewrite_sender(&mut self, mail_from: &str) -> Result<String, DispatchError>;

    /// Rewrite a recipient.
    async fn rewrite_rcpt(&mut self, rcpt: &str) -> Result<String, DispatchError>;

    /// Rewrite the header and/or body in place.
    async fn rewrite_body(&mut self, header: &mut dyn Header, body: &mut dyn Body) -> Result<(), DispatchError>;

    /// Release any resources this session holds. Must be idempotent: the
    /// orchestrator may call it more than once on the error-unwind path.
    async fn close(&mut self);
}

/// A modifier's static configuration, able to open one [`ModifierState`]
/// session per transaction (spec §6: factories are named `Start` elsewhere;
/// modifiers mirror that with `open`).
#[async_trait::async_trait]
pub trait Modifier: Send + Sync {
    /// Open a session for one transaction.
    async fn open(&self, meta: &MsgMeta) -> Result<Box<dyn ModifierState>, DispatchError>;
}

/// A per-transaction delivery backend session (spec §6: "Delivery
/// session").
#[async_trait::async_trait]
pub trait DeliverySession: Send + Sync {
    /// Hand the backend one more recipient, already rewritten through every
    /// applicable scope.
    async fn add_rcpt(&mut self, to: &str) -> Result<(), DispatchError>;

    /// Hand the backend the final header/body, atomically (spec §4.5
    /// `fan_body_atomic`).
    async fn body(&mut self, header: &mut dyn Header, body: &dyn Body) -> Result<(), DispatchError>;

    /// Finalize delivery. Exactly one of `commit`/`abort` is ever called on
    /// a session that was successfully started (spec §8, property 2).
    async fn commit(&mut self) -> Result<(), DispatchError>;

    /// Abandon delivery; best-effort.
    async fn abort(&mut self) -> Result<(), DispatchError>;

    /// A session that also implements [`StreamingDelivery`] can report
    /// per-recipient status as it goes (required by line-at-a-time
    /// protocols like LMTP, spec §6). Sessions that return `None` here are
    /// driven with atomic `body` only.
    fn as_streaming(&mut self) -> Option<&mut dyn StreamingDelivery> {
        None
    }
}

/// The streaming-delivery capability extension probed for at body fan-out
/// time (spec §9 "Streaming-vs-atomic backend").
#[async_trait::async_trait]
pub trait StreamingDelivery: Send + Sync {
    /// Like [`DeliverySession::body`], but reports a status per recipient
    /// via `collector` as they resolve, rather than one status for the
    /// whole session.
    async fn body_non_atomic(
        &mut self,
        collector: &mut dyn StatusCollector,
        header: &mut dyn Header,
        body: &dyn Body,
    ) -> Result<(), DispatchError>;
}

/// A named delivery backend able to start a session for a transaction
/// (spec §6: "Delivery target").
#[async_trait::async_trait]
pub trait DeliveryTarget: Send + Sync {
    /// The backend's kind, for diagnostics (e.g. `"maildir"`).
    fn name(&self) -> &str;

    /// This particular configured instance's name, for diagnostics (e.g.
    /// `"maildir-users"`).
    fn instance_name(&self) -> &str;

    /// Open a session for this transaction.
    async fn start(&self, meta: &MsgMeta, mail_from: &str) -> Result<Box<dyn DeliverySession>, DispatchError>;
}

/// An upstream status sink (spec §6: "Status collector").
pub trait StatusCollector: Send + Sync {
    /// Report the outcome for one recipient. `err` is `None` on success.
    fn set_status(&mut self, rcpt: &str, err: Option<&DispatchError>);
}
