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

//! Address matcher (spec §4.1): map an address to a routing block by exact
//! match, then domain, then default.

use std::collections::HashMap;

use crate::error::DispatchError;

/// Which rung of the match precedence ladder an address landed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum MatchKind {
    /// The full, lower-cased address was a key in the table.
    Exact,
    /// The address's lower-cased domain was a key in the table.
    Domain,
    /// Neither matched; the block's default entry was used.
    Default,
}

/// `match(addr, table, default) -> (entry, match_kind)` (spec §4.1).
///
/// `allow_empty` governs the one exception to the "must be splittable"
/// requirement: envelope-sender matching (spec §4.7 `Start`) passes `true`
/// so the empty bounce sender falls straight through to `default` instead of
/// erroring; recipient matching (spec §4.7 `AddRcpt`) passes `false`, since
/// "invalid address here is always an error (unlike the sender case)".
///
/// # Errors
///
/// Returns [`DispatchError::InvalidAddress`] if `addr` has no `@` to split
/// on, unless `addr` is empty and `allow_empty` is `true`.
pub fn match_entry<'a, T>(
    addr: &str,
    table: &'a HashMap<String, T>,
    default: &'a T,
    allow_empty: bool,
) -> Result<(&'a T, MatchKind), DispatchError> {
    let lower = addr.to_lowercase();
    if let Some(entry) = table.get(&lower) {
        return Ok((entry, MatchKind::Exact));
    }

    match dispatch_common::split_address(addr) {
        Ok((_, domain)) => {
            let domain = domain.to_lowercase();
            if let Some(entry) = table.get(&domain) {
                return Ok((entry, MatchKind::Domain));
            }
        }
        Err(_) if addr.is_empty() && allow_empty => {}
        Err(err) => return Err(DispatchError::InvalidAddress(err)),
    }

    Ok((default, MatchKind::Default))
}
