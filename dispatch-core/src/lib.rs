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

//! Routes one inbound mail transaction through per-scope policy checks and
//! content modifiers, then fans the result out across the delivery
//! backends selected for its recipients.
//!
//! The entry points are [`routing::DispatcherBuilder`] to assemble a
//! [`routing::Dispatcher`] and [`routing::Dispatcher::start`] to open a
//! [`transaction::Delivery`] for one transaction. Everything this crate
//! calls out to — checks, modifiers, delivery backends, the status sink —
//! is a capability interface in [`capability`]; this crate implements none
//! of them.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all)]

mod backend;
mod capability;
mod checks;
mod error;
mod matcher;
mod meta;
mod modifiers;
mod routing;
mod status_collector;
mod transaction;

pub use capability::{
    Check, CheckOutcome, DeliverySession, DeliveryTarget, Modifier, ModifierState, StatusCollector,
    StreamingDelivery,
};
pub use checks::Verdict;
pub use error::{ConfigError, DispatchError};
pub use matcher::MatchKind;
pub use meta::MsgMeta;
pub use routing::{
    Dispatcher, DispatcherBuilder, RcptBlock, RcptBlockBuilder, SourceBlock, SourceBlockBuilder,
};
pub use status_collector::OriginalRcptCollector;
pub use transaction::Delivery;
