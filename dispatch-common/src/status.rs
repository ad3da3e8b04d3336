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

/// A structured SMTP reply: a basic status code plus an enhanced status
/// code (RFC 3463), so a front-end can build a wire reply without
/// string-parsing an error message (see spec §6, §7).
///
/// `Serialize`-only: `enhanced` is `&'static str` (every construction site
/// uses a literal), and a derived `Deserialize` impl for a `&'static str`
/// field can't soundly exist for arbitrary input lifetimes.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct EnhancedStatus {
    /// e.g. `501`.
    pub code: u16,
    /// e.g. `"5.1.3"`.
    pub enhanced: &'static str,
    /// Human-readable detail, not part of the wire code.
    pub message: String,
}

impl EnhancedStatus {
    /// `501 5.1.3`: the address presented by the client does not parse.
    #[must_use]
    pub fn invalid_address(addr: &str) -> Self {
        Self {
            code: 501,
            enhanced: "5.1.3",
            message: format!("invalid address: '{addr}'"),
        }
    }
}

impl std::fmt::Display for EnhancedStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} {}", self.code, self.enhanced, self.message)
    }
}
