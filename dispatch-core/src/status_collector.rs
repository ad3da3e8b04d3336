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

//! Status-collector adapter (spec §4.6): translate a rewritten recipient
//! back to the client-presented one before handing a status to the
//! upstream sink, so rewrites never leak upstream (spec §8, property 3).

use crate::capability::StatusCollector;
use crate::error::DispatchError;
use crate::meta::MsgMeta;

/// Wraps an upstream [`StatusCollector`] with `msg_meta`'s rewrite map.
pub struct OriginalRcptCollector<'a> {
    meta: MsgMeta,
    upstream: &'a mut dyn StatusCollector,
}

impl<'a> OriginalRcptCollector<'a> {
    /// Wrap `upstream` so every `set_status` call is rewritten through
    /// `meta`'s `original_rcpts` map before forwarding.
    #[must_use]
    pub fn new(meta: MsgMeta, upstream: &'a mut dyn StatusCollector) -> Self {
        Self { meta, upstream }
    }
}

impl StatusCollector for OriginalRcptCollector<'_> {
    fn set_status(&mut self, rcpt: &str, err: Option<&DispatchError>) {
        let original = self.meta.original_of(rcpt);
        self.upstream.set_status(&original, err);
    }
}
