/*
 * This file is part of bootmeta.
 *
 * Copyright (C) 2025 bootmeta contributors
 *
 * bootmeta is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * bootmeta is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with bootmeta. If not, see <https://www.gnu.org/licenses/>.
 */

//! bootmeta - early boot platform detection and instance metadata
//!
//! The heavy lifting lives in `bm-core`; this crate holds the command line
//! front end, settings resolution and the JSON event log.

pub mod cli;
pub mod config;
pub mod logger;
