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

/// One `Name: Value` header field, in presentation order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderField {
    /// Field name, e.g. `"Authentication-Results"`.
    pub name: String,
    /// Field value, without the trailing CRLF.
    pub value: String,
}

/// A mutable ordered field list supporting prepend, the shape spec §6
/// requires of the message header checks and modifiers see.
///
/// Storage of the underlying message is the message-body-storage
/// collaborator excluded in spec §1; this trait only describes the mutable
/// view the dispatcher core hands to checks/modifiers/backends during a
/// transaction.
pub trait Header: Send + Sync {
    /// Insert a field at the front of the list (used for
    /// `Authentication-Results`, see spec §4.3).
    fn prepend(&mut self, name: &str, value: &str);

    /// Append a field at the end of the list.
    fn append(&mut self, name: &str, value: &str);

    /// All values for a (case-insensitive) field name, in order.
    fn get_all(&self, name: &str) -> Vec<&str>;

    /// All fields, in presentation order.
    fn fields(&self) -> &[HeaderField];
}

/// An in-memory [`Header`] suitable for tests and for any backend that does
/// not need a more specialized representation.
#[derive(Debug, Clone, Default)]
pub struct SimpleHeader {
    fields: Vec<HeaderField>,
}

impl SimpleHeader {
    /// An empty header list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Header for SimpleHeader {
    fn prepend(&mut self, name: &str, value: &str) {
        self.fields.insert(
            0,
            HeaderField {
                name: name.to_owned(),
                value: value.to_owned(),
            },
        );
    }

    fn append(&mut self, name: &str, value: &str) {
        self.fields.push(HeaderField {
            name: name.to_owned(),
            value: value.to_owned(),
        });
    }

    fn get_all(&self, name: &str) -> Vec<&str> {
        self.fields
            .iter()
            .filter(|f| f.name.eq_ignore_ascii_case(name))
            .map(|f| f.value.as_str())
            .collect()
    }

    fn fields(&self) -> &[HeaderField] {
        &self.fields
    }
}
