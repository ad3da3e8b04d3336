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

//! The routing tree (spec §3): immutable after construction, shared by
//! reference across every concurrent transaction.

use std::collections::HashMap;
use std::sync::Arc;

use dispatch_common::EnhancedStatus;

use crate::capability::{Check, DeliveryTarget, Modifier};
use crate::error::ConfigError;

/// Match result for a given recipient within a [`SourceBlock`] (spec §3).
pub struct RcptBlock {
    pub(crate) checks: Vec<Arc<dyn Check>>,
    pub(crate) modifiers: Vec<Arc<dyn Modifier>>,
    pub(crate) reject_error: Option<EnhancedStatus>,
    pub(crate) targets: Vec<Arc<dyn DeliveryTarget>>,
}

/// Builds a [`RcptBlock`], enforcing "`targets` is non-empty" (spec §3).
#[derive(Default)]
pub struct RcptBlockBuilder {
    checks: Vec<Arc<dyn Check>>,
    modifiers: Vec<Arc<dyn Modifier>>,
    reject_error: Option<EnhancedStatus>,
    targets: Vec<Arc<dyn DeliveryTarget>>,
}

impl RcptBlockBuilder {
    /// A block with no checks, no modifiers and no reject error yet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a check, run after `source_checks` in `AddRcpt` (spec §4.7).
    #[must_use]
    pub fn check(mut self, check: Arc<dyn Check>) -> Self {
        self.checks.push(check);
        self
    }

    /// Append a modifier to this block's stack.
    #[must_use]
    pub fn modifier(mut self, modifier: Arc<dyn Modifier>) -> Self {
        self.modifiers.push(modifier);
        self
    }

    /// Short-circuit every recipient matching this block with `error`
    /// (spec §3, §4.7 step 4).
    #[must_use]
    pub fn reject_error(mut self, error: EnhancedStatus) -> Self {
        self.reject_error = Some(error);
        self
    }

    /// Append a delivery backend this block's recipients fan out to.
    #[must_use]
    pub fn target(mut self, target: Arc<dyn DeliveryTarget>) -> Self {
        self.targets.push(target);
        self
    }

    /// Validate and build.
    ///
    /// # Errors
    ///
    /// [`ConfigError::EmptyTargets`] if no target was ever appended.
    pub fn build(self) -> Result<RcptBlock, ConfigError> {
        if self.targets.is_empty() {
            return Err(ConfigError::EmptyTargets);
        }
        Ok(RcptBlock {
            checks: self.checks,
            modifiers: self.modifiers,
            reject_error: self.reject_error,
            targets: self.targets,
        })
    }
}

/// Match result for a given envelope sender (spec §3).
pub struct SourceBlock {
    pub(crate) checks: Vec<Arc<dyn Check>>,
    pub(crate) modifiers: Vec<Arc<dyn Modifier>>,
    pub(crate) reject_error: Option<EnhancedStatus>,
    pub(crate) per_rcpt: HashMap<String, Arc<RcptBlock>>,
    pub(crate) default_rcpt: Arc<RcptBlock>,
}

/// Builds a [`SourceBlock`], enforcing "every `SourceBlock` has a
/// `default_rcpt`" (spec §3).
#[derive(Default)]
pub struct SourceBlockBuilder {
    checks: Vec<Arc<dyn Check>>,
    modifiers: Vec<Arc<dyn Modifier>>,
    reject_error: Option<EnhancedStatus>,
    per_rcpt: HashMap<String, Arc<RcptBlock>>,
    default_rcpt: Option<Arc<RcptBlock>>,
}

impl SourceBlockBuilder {
    /// A block with no rcpt mapping and no default yet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a check, run after `global_checks` in `Start`/`AddRcpt`
    /// (spec §4.7).
    #[must_use]
    pub fn check(mut self, check: Arc<dyn Check>) -> Self {
        self.checks.push(check);
        self
    }

    /// Append a modifier to this block's stack.
    #[must_use]
    pub fn modifier(mut self, modifier: Arc<dyn Modifier>) -> Self {
        self.modifiers.push(modifier);
        self
    }

    /// Short-circuit every sender matching this block with `error`
    /// (spec §3, §4.7 step 4).
    #[must_use]
    pub fn reject_error(mut self, error: EnhancedStatus) -> Self {
        self.reject_error = Some(error);
        self
    }

    /// Map `addr_or_domain` (already lower-cased by the caller, or
    /// lower-cased here defensively) to `block` (spec §3 invariant:
    /// "mapping keys are lowercased").
    #[must_use]
    pub fn rcpt(mut self, addr_or_domain: impl Into<String>, block: Arc<RcptBlock>) -> Self {
        self.per_rcpt.insert(addr_or_domain.into().to_lowercase(), block);
        self
    }

    /// Set the mandatory fallback rcpt block.
    #[must_use]
    pub fn default_rcpt(mut self, block: Arc<RcptBlock>) -> Self {
        self.default_rcpt = Some(block);
        self
    }

    /// Validate and build.
    ///
    /// # Errors
    ///
    /// [`ConfigError::MissingDefaultRcpt`] if [`Self::default_rcpt`] was
    /// never called.
    pub fn build(self) -> Result<SourceBlock, ConfigError> {
        Ok(SourceBlock {
            checks: self.checks,
            modifiers: self.modifiers,
            reject_error: self.reject_error,
            per_rcpt: self.per_rcpt,
            default_rcpt: self.default_rcpt.ok_or(ConfigError::MissingDefaultRcpt)?,
        })
    }
}

/// The dispatcher root (spec §3): holds the global scope plus every
/// configured source block, immutable once built and shared by reference
/// across concurrent transactions (spec §5).
pub struct Dispatcher {
    pub(crate) hostname: String,
    pub(crate) reject_score: i64,
    pub(crate) quarantine_score: i64,
    pub(crate) global_checks: Vec<Arc<dyn Check>>,
    pub(crate) global_modifiers: Vec<Arc<dyn Modifier>>,
    pub(crate) per_source: HashMap<String, Arc<SourceBlock>>,
    pub(crate) default_source: Arc<SourceBlock>,
}

/// Builds a [`Dispatcher`] (spec §6: `NewDispatcher(globals, config_tree)`).
#[derive(Default)]
pub struct DispatcherBuilder {
    hostname: String,
    reject_score: i64,
    quarantine_score: i64,
    global_checks: Vec<Arc<dyn Check>>,
    global_modifiers: Vec<Arc<dyn Modifier>>,
    per_source: HashMap<String, Arc<SourceBlock>>,
    default_source: Option<Arc<SourceBlock>>,
}

impl DispatcherBuilder {
    /// A builder with empty score thresholds and no hostname yet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the hostname the `Authentication-Results` header is keyed by
    /// (spec §4.2 `apply_results`).
    #[must_use]
    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    /// Set the reject score threshold (spec §4.2).
    #[must_use]
    pub const fn reject_score(mut self, score: i64) -> Self {
        self.reject_score = score;
        self
    }

    /// Set the quarantine score threshold (spec §4.2).
    #[must_use]
    pub const fn quarantine_score(mut self, score: i64) -> Self {
        self.quarantine_score = score;
        self
    }

    /// Append a global-scope check, run first in every stage (spec §4.7).
    #[must_use]
    pub fn global_check(mut self, check: Arc<dyn Check>) -> Self {
        self.global_checks.push(check);
        self
    }

    /// Append a global-scope modifier.
    #[must_use]
    pub fn global_modifier(mut self, modifier: Arc<dyn Modifier>) -> Self {
        self.global_modifiers.push(modifier);
        self
    }

    /// Map `addr_or_domain` to `block` (lower-cased here defensively, per
    /// the spec §3 invariant).
    #[must_use]
    pub fn source(mut self, addr_or_domain: impl Into<String>, block: Arc<SourceBlock>) -> Self {
        self.per_source.insert(addr_or_domain.into().to_lowercase(), block);
        self
    }

    /// Set the mandatory fallback source block.
    #[must_use]
    pub fn default_source(mut self, block: Arc<SourceBlock>) -> Self {
        self.default_source = Some(block);
        self
    }

    /// Validate and build.
    ///
    /// # Errors
    ///
    /// [`ConfigError::MissingDefaultSource`] if [`Self::default_source`]
    /// was never called.
    pub fn build(self) -> Result<Dispatcher, ConfigError> {
        Ok(Dispatcher {
            hostname: self.hostname,
            reject_score: self.reject_score,
            quarantine_score: self.quarantine_score,
            global_checks: self.global_checks,
            global_modifiers: self.global_modifiers,
            per_source: self.per_source,
            default_source: self
                .default_source
                .ok_or(ConfigError::MissingDefaultSource)?,
        })
    }
}
