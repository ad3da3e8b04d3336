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

//! Modifier stack (spec §4.3): maintains per-scope modifier state and
//! guarantees cleanup.

use dispatch_common::{Body, Header};

use crate::capability::{Modifier, ModifierState};
use crate::error::DispatchError;
use crate::meta::MsgMeta;

/// Every session opened for one scope's list of [`Modifier`]s, applied in
/// configuration order (spec §4.3: "global rewrite first, then source
/// rewrite"; "global → source → per-rcpt").
pub struct ModifierStack {
    sessions: Vec<Box<dyn ModifierState>>,
    closed: bool,
}

impl ModifierStack {
    /// Open one session per modifier in `modifiers`, in order.
    ///
    /// # Errors
    ///
    /// The first modifier that fails to open aborts the whole stack; any
    /// sessions already opened are closed before the error is returned, so
    /// the caller never has to clean up a partially-opened stack.
    pub async fn open(modifiers: &[std::sync::Arc<dyn Modifier>], meta: &MsgMeta) -> Result<Self, DispatchError> {
        let mut sessions = Vec::with_capacity(modifiers.len());
        for modifier in modifiers {
            match modifier.open(meta).await {
                Ok(session) => sessions.push(session),
                Err(err) => {
                    for mut session in sessions {
                        session.close().await;
                    }
                    return Err(err);
                }
            }
        }
        Ok(Self { sessions, closed: false })
    }

    /// Run every session's `rewrite_sender` in order, feeding each one's
    /// output into the next.
    pub async fn rewrite_sender(&mut self, mail_from: &str) -> Result<String, DispatchError> {
        let mut current = mail_from.to_owned();
        for session in &mut self.sessions {
            current = session.rewrite_sender(&current).await?;
        }
        Ok(current)
    }

    /// Run every session's `rewrite_rcpt` in order.
    pub async fn rewrite_rcpt(&mut self, rcpt: &str) -> Result<String, DispatchError> {
        let mut current = rcpt.to_owned();
        for session in &mut self.sessions {
            current = session.rewrite_rcpt(&current).await?;
        }
        Ok(current)
    }

    /// Run every session's `rewrite_body` in order (spec §4.3: body
    /// rewrite ordering is "auth-results header first, then global, then
    /// source" — the ordering between scopes is the orchestrator's job;
    /// this stack only orders the modifiers *within* one scope).
    pub async fn rewrite_body(&mut self, header: &mut dyn Header, body: &mut dyn Body) -> Result<(), DispatchError> {
        for session in &mut self.sessions {
            session.rewrite_body(header, body).await?;
        }
        Ok(())
    }

    /// Release every session. Idempotent (spec §5: "Resource discipline").
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        for session in &mut self.sessions {
            session.close().await;
        }
        self.closed = true;
    }
}
