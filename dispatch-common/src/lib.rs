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

//! Shared vocabulary between the dispatcher core and the capability
//! implementations it is handed at construction time: address splitting,
//! the mutable header/body views checks and modifiers operate on, and the
//! structured status codes protocol errors carry.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all)]

mod address;
mod body;
mod header;
mod status;

pub use address::{split_address, AddressError};
pub use body::{Body, InMemoryBody};
pub use header::{Header, HeaderField, SimpleHeader};
pub use status::EnhancedStatus;
