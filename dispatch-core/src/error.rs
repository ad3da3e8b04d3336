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

use dispatch_common::EnhancedStatus;

/// Every way a dispatcher operation can fail, one variant per row of
/// spec §7's error table.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// §4.1: the envelope sender or a recipient does not split into a
    /// local-part and a domain.
    #[error("invalid address: {0}")]
    InvalidAddress(#[from] dispatch_common::AddressError),

    /// A hard reject, either returned directly by a check or produced by
    /// the aggregated score crossing `reject_score` (spec §4.2).
    #[error("rejected: {0}")]
    Rejected(EnhancedStatus),

    /// A matched `SourceBlock`/`RcptBlock` carries a configured
    /// `reject_error` (spec §3, §4.7 step 4).
    #[error("rejected by routing block: {0}")]
    BlockRejected(EnhancedStatus),

    /// A modifier's `rewrite_sender`/`rewrite_rcpt`/`rewrite_body` failed.
    #[error("modifier failed: {0}")]
    Modifier(String),

    /// A delivery backend's `Start`/`AddRcpt`/`Body`/`Commit`/`Abort` failed.
    #[error("backend '{target}' failed: {source}")]
    Backend {
        /// The failing target's diagnostic name (spec §6: `Name`/`InstanceName`).
        target: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The transaction's cancellation token was cancelled mid-operation
    /// (spec §5).
    #[error("transaction cancelled")]
    Cancelled,

    /// A transition was attempted from a state that does not permit it
    /// (spec §4.7), e.g. `AddRcpt` before `Start` completed.
    #[error("invalid transaction state: {0}")]
    InvalidState(&'static str),
}

impl DispatchError {
    /// The structured SMTP reply this error bubbles as (spec §6: "Protocol
    /// errors bubble as structured codes"), where one applies.
    ///
    /// `Modifier`, `Backend`, `Cancelled` and `InvalidState` have no single
    /// wire status in this design; callers map those to their own
    /// transport-level failure reply.
    #[must_use]
    pub fn enhanced_status(&self) -> Option<EnhancedStatus> {
        match self {
            Self::InvalidAddress(err) => Some(EnhancedStatus::invalid_address(err.addr())),
            Self::Rejected(status) | Self::BlockRejected(status) => Some(status.clone()),
            Self::Modifier(_) | Self::Backend { .. } | Self::Cancelled | Self::InvalidState(_) => None,
        }
    }
}

/// A routing-tree invariant was violated at construction time (spec §3):
/// empty `targets`, or a block missing its mandatory default entry.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// §3: "`targets` (non-empty ordered list of delivery backends)".
    #[error("rcpt block must have at least one delivery target")]
    EmptyTargets,
    /// §3: "every `SourceBlock` has a `default_rcpt`".
    #[error("source block is missing its default_rcpt")]
    MissingDefaultRcpt,
    /// §3: "the dispatcher has a `default_source`".
    #[error("dispatcher is missing its default_source")]
    MissingDefaultSource,
}
