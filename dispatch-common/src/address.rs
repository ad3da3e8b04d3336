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

/// Failure to split an address into a local-part and a domain.
///
/// The empty envelope sender is not an error on its own; callers that allow
/// an empty address (envelope sender matching, see `dispatch-core::matcher`)
/// must special-case it before treating this as fatal.
#[derive(Debug, Clone, thiserror::Error)]
#[error("'{0}' is not splittable into a local-part and a domain")]
pub struct AddressError(String);

impl AddressError {
    /// The address that failed to split.
    #[must_use]
    pub fn addr(&self) -> &str {
        &self.0
    }
}

/// Split `addr` into `(local_part, domain)` on the last `@`.
///
/// This is the "address normalization primitive" the dispatcher consumes
/// rather than owns (see spec §1, §6): it performs no syntax validation
/// beyond requiring an `@` to split on, and callers are expected to
/// lower-case the returned domain themselves for case-insensitive routing
/// lookups.
///
/// # Errors
///
/// Returns [`AddressError`] if `addr` contains no `@`.
#[inline]
pub fn split_address(addr: &str) -> Result<(&str, &str), AddressError> {
    addr.rsplit_once('@')
        .ok_or_else(|| AddressError(addr.to_owned()))
}
