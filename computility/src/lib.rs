// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of computility.
//
// computility is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// computility is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with computility.  If not,
// see <http://www.gnu.org/licenses/>.

//! # computility
//!
//! Compute-quota accounting: orgs assign quota to their members, members' spaces consume &
//! release it, and when a member leaves owing more than their balance covers, a recall event goes
//! out. The library crate holds everything; `computilityd` wires it to configuration & serves it.
pub mod api;
pub mod authn;
#[path = "background-tasks.rs"]
pub mod background_tasks;
pub mod computility;
pub mod entities;
pub mod http;
pub mod memory;
pub mod metrics;
pub mod postgres;
pub mod publisher;
pub mod quota;
pub mod recall;
pub mod scylla;
#[path = "signing-keys.rs"]
pub mod signing_keys;
pub mod storage;
pub mod token;
pub mod util;
