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

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

/// Opaque per-transaction metadata handed to checks, modifiers and
/// delivery backends (spec §3: `msg_meta`).
///
/// Cheap to clone: every clone shares the same `original_rcpts` map and the
/// same cancellation token, as required by spec §5 ("backends may read it
/// after `Start` returns") and §9 ("thread a cancellation token through all
/// check calls ... via `msg_meta`").
#[derive(Clone)]
pub struct MsgMeta {
    /// Cancelled by the caller to unwind the transaction promptly (spec §5).
    pub cancel: CancellationToken,
    original_rcpts: Arc<Mutex<HashMap<String, String>>>,
    quarantined: Arc<Mutex<bool>>,
}

impl MsgMeta {
    /// An empty `msg_meta`, as created by `Start` (spec §3).
    #[must_use]
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            original_rcpts: Arc::new(Mutex::new(HashMap::new())),
            quarantined: Arc::new(Mutex::new(false)),
        }
    }

    /// Record that `final_rcpt` was presented to the client as
    /// `original_rcpt`, if they differ (spec §4.4). A no-op when they are
    /// equal: the map only ever grows during `AddRcpt` and is never
    /// mutated once the body phase starts (spec §4.4 invariant).
    pub(crate) fn record_rewrite(&self, final_rcpt: &str, original_rcpt: &str) {
        if final_rcpt != original_rcpt {
            #[allow(clippy::unwrap_used)]
            self.original_rcpts
                .lock()
                .unwrap()
                .insert(final_rcpt.to_owned(), original_rcpt.to_owned());
        }
    }

    /// Recover the client-presented recipient for a (possibly rewritten)
    /// final recipient, falling back to `rcpt` itself when it was never
    /// rewritten.
    #[must_use]
    pub fn original_of(&self, rcpt: &str) -> String {
        #[allow(clippy::unwrap_used)]
        self.original_rcpts
            .lock()
            .unwrap()
            .get(rcpt)
            .cloned()
            .unwrap_or_else(|| rcpt.to_owned())
    }

    pub(crate) fn set_quarantined(&self) {
        #[allow(clippy::unwrap_used)]
        {
            *self.quarantined.lock().unwrap() = true;
        }
    }

    /// Whether the accumulated check score crossed `quarantine_score`
    /// (spec §4.2).
    #[must_use]
    pub fn is_quarantined(&self) -> bool {
        #[allow(clippy::unwrap_used)]
        {
            *self.quarantined.lock().unwrap()
        }
    }
}
